//! Core domain model for the Atmos ingestion pipeline.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "atmos-core";

/// Wire format for observation timestamps. Lexicographic order of the
/// formatted text matches chronological order, which the storage layer
/// relies on for latest-observation queries.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// The closed set of tracked pollutants. Locations and weather conditions
/// are open-ended lookup sets, but pollutant identity stays a fixed,
/// auditable enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pollutant {
    Pm25,
    Pm10,
    O3,
    No2,
    So2,
    Co,
}

impl Pollutant {
    pub const ALL: [Pollutant; 6] = [
        Pollutant::Pm25,
        Pollutant::Pm10,
        Pollutant::O3,
        Pollutant::No2,
        Pollutant::So2,
        Pollutant::Co,
    ];

    /// Natural key as stored in the pollutant lookup table.
    pub fn as_str(&self) -> &'static str {
        match self {
            Pollutant::Pm25 => "pm25",
            Pollutant::Pm10 => "pm10",
            Pollutant::O3 => "o3",
            Pollutant::No2 => "no2",
            Pollutant::So2 => "so2",
            Pollutant::Co => "co",
        }
    }

    /// Maps a provider-reported pollutant code onto the closed set.
    /// Unknown codes return `None`; the resolver turns that into the
    /// sentinel row rather than growing the enumeration.
    pub fn from_code(code: &str) -> Option<Pollutant> {
        match code.trim().to_ascii_lowercase().as_str() {
            "pm25" | "pm2.5" => Some(Pollutant::Pm25),
            "pm10" => Some(Pollutant::Pm10),
            "o3" => Some(Pollutant::O3),
            "no2" => Some(Pollutant::No2),
            "so2" => Some(Pollutant::So2),
            "co" => Some(Pollutant::Co),
            _ => None,
        }
    }
}

/// Natural key of the sentinel pollutant row used when a provider reports
/// a code outside the closed set.
pub const UNKNOWN_POLLUTANT: &str = "unknown";

/// Normalized air-quality reading, unit-converted and provider-agnostic.
/// Entity keys are still natural keys here; the storage layer resolves
/// them to surrogate ids inside the batch transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AirQualityRecord {
    pub location: String,
    pub observed_at: NaiveDateTime,
    pub index_value: i64,
    /// Provider-reported dominant pollutant code, possibly outside the
    /// closed set.
    pub dominant_pollutant: String,
    pub forecast_pm25: f64,
    pub forecast_pm10: f64,
    pub forecast_o3: f64,
}

/// Normalized weather reading. Temperature is always Celsius by the time
/// this type exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherRecord {
    pub location: String,
    pub observed_at: NaiveDateTime,
    pub temperature_c: f64,
    pub condition: String,
    pub humidity: i64,
    pub wind_speed: f64,
}

/// One batch of canonical records headed for the upsert layer. Either
/// side may be empty when the matching provider failed for a location.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservationBatch {
    pub air_quality: Vec<AirQualityRecord>,
    pub weather: Vec<WeatherRecord>,
}

impl ObservationBatch {
    pub fn is_empty(&self) -> bool {
        self.air_quality.is_empty() && self.weather.is_empty()
    }

    pub fn len(&self) -> usize {
        self.air_quality.len() + self.weather.len()
    }

    pub fn merge(&mut self, other: ObservationBatch) {
        self.air_quality.extend(other.air_quality);
        self.weather.extend(other.weather);
    }
}

/// Per-fact-table outcome counts from a committed batch. Duplicates are
/// the expected steady-state outcome of reprocessing, never errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCounts {
    pub inserted: u64,
    pub duplicate: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub air_quality: TableCounts,
    pub weather: TableCounts,
}

impl BatchResult {
    pub fn inserted(&self) -> u64 {
        self.air_quality.inserted + self.weather.inserted
    }

    pub fn duplicates(&self) -> u64 {
        self.air_quality.duplicate + self.weather.duplicate
    }
}
