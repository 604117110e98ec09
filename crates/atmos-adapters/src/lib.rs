//! Provider adapter contracts, raw payload shapes, and the normalizer that
//! turns heterogeneous provider payloads into canonical records.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use atmos_core::{AirQualityRecord, Pollutant, WeatherRecord, TIMESTAMP_FORMAT, UNKNOWN_POLLUTANT};
use chrono::{DateTime, NaiveDateTime};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "atmos-adapters";

/// Three-way provider failure taxonomy. Transient, per-location, never
/// fatal for the batch.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("provider rate limit hit")]
    RateLimited,
    #[error("provider call timed out")]
    Timeout,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizationError {
    #[error("provider rejected request{}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    ProviderRejected { message: Option<String> },
    #[error("missing required field {0}")]
    MissingField(&'static str),
}

// ---------------------------------------------------------------------------
// HTTP layer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Thin JSON fetcher shared by both provider adapters. Retries transient
/// failures with capped exponential backoff; terminal failures collapse
/// into the three-way [`FetchError`] taxonomy.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let mut last_error: Option<FetchError> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp
                            .json::<T>()
                            .await
                            .map_err(|e| FetchError::Network(e.to_string()));
                    }

                    let error = if status == StatusCode::TOO_MANY_REQUESTS {
                        FetchError::RateLimited
                    } else {
                        FetchError::Network(format!("http status {status}"))
                    };
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying provider call");
                        last_error = Some(error);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(error);
                }
                Err(err) => {
                    let error = if err.is_timeout() {
                        FetchError::Timeout
                    } else {
                        FetchError::Network(err.to_string())
                    };
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_error = Some(error);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| FetchError::Network("retries exhausted".to_string())))
    }
}

// ---------------------------------------------------------------------------
// Raw payload shapes, one per provider
// ---------------------------------------------------------------------------

/// WAQI/AQICN feed response. `data` is a nested object on success but may
/// be a bare error string on rejection, so it stays loose until the status
/// check passes.
#[derive(Debug, Clone, Deserialize)]
pub struct AqiPayload {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub data: JsonValue,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AqiData {
    city: Option<AqiCity>,
    aqi: Option<JsonValue>,
    time: Option<AqiTime>,
    dominentpol: Option<String>,
    forecast: Option<AqiForecast>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AqiCity {
    name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AqiTime {
    s: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AqiForecast {
    daily: Option<AqiDaily>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AqiDaily {
    #[serde(default)]
    pm25: Vec<AqiForecastEntry>,
    #[serde(default)]
    pm10: Vec<AqiForecastEntry>,
    #[serde(default)]
    o3: Vec<AqiForecastEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AqiForecastEntry {
    avg: Option<f64>,
}

/// OpenWeatherMap current-weather response. `cod` is a JSON number on
/// success and sometimes a string on error; both must be accepted.
#[derive(Debug, Clone, Deserialize)]
pub struct WeatherPayload {
    #[serde(default)]
    pub cod: JsonValue,
    #[serde(default)]
    pub message: Option<String>,
    pub name: Option<String>,
    pub main: Option<WeatherMain>,
    #[serde(default)]
    pub weather: Vec<WeatherDescription>,
    pub wind: Option<WeatherWind>,
    pub dt: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WeatherMain {
    pub temp: Option<f64>,
    pub humidity: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WeatherDescription {
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WeatherWind {
    pub speed: Option<f64>,
}

/// Tagged per-provider payload. Only the matching normalizer branch ever
/// looks inside a variant; nothing downstream pattern-matches on
/// provider-specific shapes.
#[derive(Debug, Clone)]
pub enum ProviderPayload {
    AirQuality(AqiPayload),
    Weather(WeatherPayload),
}

/// Normalized, unit-converted, provider-agnostic record.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalRecord {
    AirQuality(AirQualityRecord),
    Weather(WeatherRecord),
}

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

pub fn kelvin_to_celsius(kelvin: f64) -> f64 {
    kelvin - 273.15
}

/// Shapes a raw provider payload into a canonical record. `ingested_at` is
/// the fallback timestamp for providers (or readings) that carry no native
/// observation time; second-precision collisions within a batch are an
/// accepted limitation backed by the uniqueness constraint.
pub fn normalize(
    payload: &ProviderPayload,
    ingested_at: NaiveDateTime,
) -> Result<CanonicalRecord, NormalizationError> {
    match payload {
        ProviderPayload::AirQuality(raw) => {
            normalize_air_quality(raw, ingested_at).map(CanonicalRecord::AirQuality)
        }
        ProviderPayload::Weather(raw) => {
            normalize_weather(raw, ingested_at).map(CanonicalRecord::Weather)
        }
    }
}

fn normalize_air_quality(
    raw: &AqiPayload,
    ingested_at: NaiveDateTime,
) -> Result<AirQualityRecord, NormalizationError> {
    if raw.status != "ok" {
        return Err(NormalizationError::ProviderRejected {
            message: raw.data.as_str().map(str::to_string),
        });
    }

    let data: AqiData = serde_json::from_value(raw.data.clone())
        .map_err(|_| NormalizationError::MissingField("data"))?;

    let location = data
        .city
        .as_ref()
        .and_then(|c| c.name.as_deref())
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or(NormalizationError::MissingField("data.city.name"))?
        .to_string();

    // Stations without a current reading report aqi as "-".
    let index_value = data
        .aqi
        .as_ref()
        .and_then(json_integer)
        .ok_or(NormalizationError::MissingField("data.aqi"))?;

    let observed_at = data
        .time
        .as_ref()
        .and_then(|t| t.s.as_deref())
        .and_then(|s| NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).ok())
        .unwrap_or(ingested_at);

    let dominant_pollutant = data
        .dominentpol
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or(UNKNOWN_POLLUTANT)
        .to_string();

    // A forecast block missing entirely is a shape violation; a single
    // absent pollutant series or average defaults to zero.
    let forecast = data
        .forecast
        .as_ref()
        .ok_or(NormalizationError::MissingField("data.forecast"))?;
    let daily = forecast
        .daily
        .as_ref()
        .ok_or(NormalizationError::MissingField("data.forecast.daily"))?;

    Ok(AirQualityRecord {
        location,
        observed_at,
        index_value,
        dominant_pollutant,
        forecast_pm25: first_forecast_avg(&daily.pm25),
        forecast_pm10: first_forecast_avg(&daily.pm10),
        forecast_o3: first_forecast_avg(&daily.o3),
    })
}

fn normalize_weather(
    raw: &WeatherPayload,
    ingested_at: NaiveDateTime,
) -> Result<WeatherRecord, NormalizationError> {
    let cod_ok = raw.cod.as_i64() == Some(200) || raw.cod.as_str() == Some("200");
    if !cod_ok {
        return Err(NormalizationError::ProviderRejected {
            message: raw.message.clone(),
        });
    }

    let location = raw
        .name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or(NormalizationError::MissingField("name"))?
        .to_string();

    let main = raw
        .main
        .as_ref()
        .ok_or(NormalizationError::MissingField("main"))?;
    let temp_kelvin = main
        .temp
        .ok_or(NormalizationError::MissingField("main.temp"))?;
    let humidity = main
        .humidity
        .ok_or(NormalizationError::MissingField("main.humidity"))?;
    let wind_speed = raw
        .wind
        .as_ref()
        .and_then(|w| w.speed)
        .ok_or(NormalizationError::MissingField("wind.speed"))?;

    let condition = raw
        .weather
        .first()
        .and_then(|w| w.description.as_deref())
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .unwrap_or("unknown")
        .to_string();

    let observed_at = raw
        .dt
        .and_then(|dt| DateTime::from_timestamp(dt, 0))
        .map(|dt| dt.naive_utc())
        .unwrap_or(ingested_at);

    Ok(WeatherRecord {
        location,
        observed_at,
        temperature_c: kelvin_to_celsius(temp_kelvin),
        condition,
        humidity,
        wind_speed,
    })
}

// The index arrives as a JSON number most of the time, but some stations
// report it as a numeric string, and "-" when no current reading exists.
fn json_integer(value: &JsonValue) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f.round() as i64))
        .or_else(|| {
            value
                .as_str()
                .and_then(|s| s.trim().parse::<f64>().ok())
                .map(|f| f.round() as i64)
        })
}

fn first_forecast_avg(series: &[AqiForecastEntry]) -> f64 {
    series.first().and_then(|entry| entry.avg).unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Provider adapters
// ---------------------------------------------------------------------------

/// One external observation source. The pipeline only ever sees this
/// contract plus the three-way failure taxonomy.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_id(&self) -> &'static str;

    async fn fetch(&self, location: &str) -> Result<ProviderPayload, FetchError>;
}

pub struct AqicnAdapter {
    http: HttpClient,
    token: String,
}

impl AqicnAdapter {
    pub fn new(http: HttpClient, token: impl Into<String>) -> Self {
        Self {
            http,
            token: token.into(),
        }
    }

    pub fn from_env(http: HttpClient) -> anyhow::Result<Self> {
        let token = std::env::var("AQICN_TOKEN").context("AQICN_TOKEN must be set")?;
        Ok(Self::new(http, token))
    }
}

#[async_trait]
impl ProviderAdapter for AqicnAdapter {
    fn provider_id(&self) -> &'static str {
        "aqicn"
    }

    async fn fetch(&self, location: &str) -> Result<ProviderPayload, FetchError> {
        let url = format!(
            "https://api.waqi.info/feed/{}/?token={}",
            location, self.token
        );
        let payload: AqiPayload = self.http.fetch_json(&url).await?;
        Ok(ProviderPayload::AirQuality(payload))
    }
}

pub struct OpenWeatherAdapter {
    http: HttpClient,
    api_key: String,
}

impl OpenWeatherAdapter {
    pub fn new(http: HttpClient, api_key: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
        }
    }

    pub fn from_env(http: HttpClient) -> anyhow::Result<Self> {
        let api_key =
            std::env::var("OPENWEATHER_API_KEY").context("OPENWEATHER_API_KEY must be set")?;
        Ok(Self::new(http, api_key))
    }
}

#[async_trait]
impl ProviderAdapter for OpenWeatherAdapter {
    fn provider_id(&self) -> &'static str {
        "openweather"
    }

    async fn fetch(&self, location: &str) -> Result<ProviderPayload, FetchError> {
        let url = format!(
            "https://api.openweathermap.org/data/2.5/weather?q={}&appid={}",
            location, self.api_key
        );
        let payload: WeatherPayload = self.http.fetch_json(&url).await?;
        Ok(ProviderPayload::Weather(payload))
    }
}

/// Convenience check used when wiring dominant-pollutant codes through to
/// the resolver: codes outside the closed set resolve to the sentinel.
pub fn pollutant_or_unknown(code: &str) -> &str {
    match Pollutant::from_code(code) {
        Some(p) => p.as_str(),
        None => UNKNOWN_POLLUTANT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ingested_at() -> NaiveDateTime {
        NaiveDateTime::parse_from_str("2026-03-01 12:00:00", TIMESTAMP_FORMAT).unwrap()
    }

    fn aqi_payload(value: serde_json::Value) -> AqiPayload {
        serde_json::from_value(value).expect("aqi payload")
    }

    fn weather_payload(value: serde_json::Value) -> WeatherPayload {
        serde_json::from_value(value).expect("weather payload")
    }

    #[test]
    fn kelvin_conversion_matches_reference_point() {
        assert!((kelvin_to_celsius(300.0) - 26.85).abs() < 1e-9);
        assert!((kelvin_to_celsius(273.15)).abs() < 1e-9);
    }

    #[test]
    fn aqi_happy_path_normalizes() {
        let raw = aqi_payload(json!({
            "status": "ok",
            "data": {
                "aqi": 42,
                "city": { "name": "Berlin" },
                "time": { "s": "2026-02-28 09:00:00" },
                "dominentpol": "pm25",
                "forecast": { "daily": {
                    "pm25": [{ "avg": 18.0, "max": 30.0, "min": 8.0 }],
                    "pm10": [{ "avg": 9.5 }],
                    "o3": [{ "avg": 21.0 }]
                }}
            }
        }));

        let record = normalize_air_quality(&raw, ingested_at()).unwrap();
        assert_eq!(record.location, "Berlin");
        assert_eq!(record.index_value, 42);
        assert_eq!(
            record.observed_at.format(TIMESTAMP_FORMAT).to_string(),
            "2026-02-28 09:00:00"
        );
        assert_eq!(record.dominant_pollutant, "pm25");
        assert!((record.forecast_pm25 - 18.0).abs() < f64::EPSILON);
        assert!((record.forecast_pm10 - 9.5).abs() < f64::EPSILON);
    }

    #[test]
    fn aqi_rejection_carries_provider_message() {
        let raw = aqi_payload(json!({ "status": "error", "data": "Unknown station" }));
        let err = normalize_air_quality(&raw, ingested_at()).unwrap_err();
        assert_eq!(
            err,
            NormalizationError::ProviderRejected {
                message: Some("Unknown station".to_string())
            }
        );
    }

    #[test]
    fn aqi_missing_forecast_block_is_structural() {
        let raw = aqi_payload(json!({
            "status": "ok",
            "data": {
                "aqi": 42,
                "city": { "name": "Berlin" },
                "dominentpol": "pm25"
            }
        }));
        let err = normalize_air_quality(&raw, ingested_at()).unwrap_err();
        assert_eq!(err, NormalizationError::MissingField("data.forecast"));
    }

    #[test]
    fn aqi_missing_single_forecast_series_defaults_to_zero() {
        let raw = aqi_payload(json!({
            "status": "ok",
            "data": {
                "aqi": "55",
                "city": { "name": "Cairo" },
                "forecast": { "daily": { "pm25": [{ "avg": 12.0 }] } }
            }
        }));
        let record = normalize_air_quality(&raw, ingested_at()).unwrap();
        assert_eq!(record.forecast_pm10, 0.0);
        assert_eq!(record.forecast_o3, 0.0);
        // No dominentpol reported: sentinel, not an error.
        assert_eq!(record.dominant_pollutant, UNKNOWN_POLLUTANT);
        // No provider time: stamped with ingestion time.
        assert_eq!(record.observed_at, ingested_at());
    }

    #[test]
    fn aqi_dash_index_is_missing_field() {
        let raw = aqi_payload(json!({
            "status": "ok",
            "data": {
                "aqi": "-",
                "city": { "name": "Oslo" },
                "forecast": { "daily": {} }
            }
        }));
        let err = normalize_air_quality(&raw, ingested_at()).unwrap_err();
        assert_eq!(err, NormalizationError::MissingField("data.aqi"));
    }

    #[test]
    fn weather_happy_path_converts_units_and_prefers_provider_time() {
        let raw = weather_payload(json!({
            "cod": 200,
            "name": "Tokyo",
            "dt": 1767225600,
            "main": { "temp": 300.0, "humidity": 61 },
            "weather": [{ "description": "scattered clouds" }],
            "wind": { "speed": 4.6 }
        }));

        let record = normalize_weather(&raw, ingested_at()).unwrap();
        assert_eq!(record.location, "Tokyo");
        assert!((record.temperature_c - 26.85).abs() < 1e-9);
        assert_eq!(record.condition, "scattered clouds");
        assert_eq!(record.humidity, 61);
        assert_ne!(record.observed_at, ingested_at());
    }

    #[test]
    fn weather_cod_accepts_number_and_string() {
        let ok_number = weather_payload(json!({
            "cod": 200,
            "name": "Lima",
            "main": { "temp": 290.0, "humidity": 70 },
            "wind": { "speed": 2.0 }
        }));
        assert!(normalize_weather(&ok_number, ingested_at()).is_ok());

        let err_string = weather_payload(json!({
            "cod": "404",
            "message": "city not found"
        }));
        let err = normalize_weather(&err_string, ingested_at()).unwrap_err();
        assert_eq!(
            err,
            NormalizationError::ProviderRejected {
                message: Some("city not found".to_string())
            }
        );
    }

    #[test]
    fn weather_missing_temp_is_missing_field() {
        let raw = weather_payload(json!({
            "cod": 200,
            "name": "Quito",
            "main": { "humidity": 44 },
            "wind": { "speed": 1.0 }
        }));
        let err = normalize_weather(&raw, ingested_at()).unwrap_err();
        assert_eq!(err, NormalizationError::MissingField("main.temp"));
    }

    #[test]
    fn weather_without_dt_falls_back_to_ingestion_time() {
        let raw = weather_payload(json!({
            "cod": 200,
            "name": "Nairobi",
            "main": { "temp": 295.15, "humidity": 50 },
            "wind": { "speed": 3.1 }
        }));
        let record = normalize_weather(&raw, ingested_at()).unwrap();
        assert_eq!(record.observed_at, ingested_at());
        assert_eq!(record.condition, "unknown");
    }

    #[test]
    fn status_classification_marks_transients_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn unknown_pollutant_codes_resolve_to_sentinel() {
        assert_eq!(pollutant_or_unknown("pm25"), "pm25");
        assert_eq!(pollutant_or_unknown("PM2.5"), "pm25");
        assert_eq!(pollutant_or_unknown("benzene"), UNKNOWN_POLLUTANT);
    }
}
