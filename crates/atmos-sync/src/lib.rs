//! Run-loop orchestration: batch selection from the checkpoint, bounded
//! concurrent provider fetches, single-writer commit, checkpoint advance,
//! and aggregate recompute.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use atmos_adapters::{
    normalize, CanonicalRecord, FetchError, HttpClient, HttpClientConfig, NormalizationError,
    ProviderAdapter,
};
use atmos_core::{BatchResult, ObservationBatch};
use atmos_storage::Store;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "atmos-sync";

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub database_path: PathBuf,
    pub batch_size: usize,
    pub designated_pollutant: String,
    pub fetch_concurrency: usize,
    pub http_timeout_secs: u64,
    /// Optional row-count guard: stop ingesting once the air-quality fact
    /// table already holds this many rows. Off by default.
    pub max_rows: Option<i64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("atmos.db"),
            batch_size: 25,
            designated_pollutant: "pm25".to_string(),
            fetch_concurrency: 4,
            http_timeout_secs: 20,
            max_rows: None,
        }
    }
}

/// The ordered location list the checkpoint indexes into. Callers must
/// treat it as append-only and order-stable between runs; reordering or
/// truncating it silently changes what the checkpoint means.
pub fn default_locations() -> Vec<String> {
    [
        "New York",
        "London",
        "Tokyo",
        "Delhi",
        "Shanghai",
        "Sydney",
        "Paris",
        "Berlin",
        "Cairo",
        "Moscow",
        "Dubai",
        "San Francisco",
        "São Paulo",
        "Mumbai",
        "Los Angeles",
        "Mexico City",
        "Seoul",
        "Istanbul",
        "Hong Kong",
        "Lagos",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Reads a newline-separated ordered location list, skipping blank lines.
pub async fn load_locations_file(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub offset_before: i64,
    pub offset_after: i64,
    pub locations_processed: usize,
    pub fetch_failures: usize,
    pub normalization_failures: usize,
    pub batch: BatchResult,
    pub aggregate_rows: u64,
}

/// Outcome of the fetch/normalize stage for one location. Failures are
/// recorded, never raised; only the storage layer can abort a run.
struct LocationReport {
    batch: ObservationBatch,
    fetch_failures: usize,
    normalization_failures: usize,
}

pub struct Pipeline {
    config: RunConfig,
    store: Store,
    locations: Vec<String>,
    aqi: Arc<dyn ProviderAdapter>,
    weather: Arc<dyn ProviderAdapter>,
}

impl Pipeline {
    pub fn new(
        config: RunConfig,
        store: Store,
        locations: Vec<String>,
        aqi: Arc<dyn ProviderAdapter>,
        weather: Arc<dyn ProviderAdapter>,
    ) -> Self {
        Self {
            config,
            store,
            locations,
            aqi,
            weather,
        }
    }

    /// Opens the store at the configured path and wires the real provider
    /// adapters from environment tokens.
    pub async fn with_live_adapters(config: RunConfig, locations: Vec<String>) -> Result<Self> {
        let store = Store::open(&config.database_path).await?;
        let http = HttpClient::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            ..Default::default()
        })?;
        let aqi = Arc::new(atmos_adapters::AqicnAdapter::from_env(http.clone())?);
        let weather = Arc::new(atmos_adapters::OpenWeatherAdapter::from_env(http)?);
        Ok(Self::new(config, store, locations, aqi, weather))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Processes one bounded batch of locations starting at the persisted
    /// checkpoint. At-least-once with idempotent upsert: an interrupted
    /// run leaves the checkpoint at its last committed value and the next
    /// run reprocesses the in-flight batch, with reprocessed rows counted
    /// as duplicates.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        self.store.bootstrap().await?;
        let designated_id = self
            .store
            .designated_pollutant_id(&self.config.designated_pollutant)
            .await?;

        let offset_before = self.store.read_offset().await?;

        if let Some(max_rows) = self.config.max_rows {
            let existing = self.store.counts().await?.air_quality;
            if existing >= max_rows {
                info!(existing, max_rows, "row-count guard reached; skipping ingest");
                return Ok(self
                    .noop_summary(run_id, started_at, offset_before, designated_id)
                    .await?);
            }
        }

        let slice: Vec<String> = self
            .locations
            .iter()
            .skip(offset_before.max(0) as usize)
            .take(self.config.batch_size.max(1))
            .cloned()
            .collect();

        if slice.is_empty() {
            info!(offset = offset_before, "no unprocessed locations; nothing to do");
            return Ok(self
                .noop_summary(run_id, started_at, offset_before, designated_id)
                .await?);
        }

        info!(
            %run_id,
            offset = offset_before,
            batch = slice.len(),
            "starting ingestion batch"
        );

        // Fetch stage: the network calls are the unit of parallelism.
        // Everything after collection is single-writer.
        let semaphore = Arc::new(Semaphore::new(self.config.fetch_concurrency.max(1)));
        let mut tasks = Vec::with_capacity(slice.len());
        for location in &slice {
            let location = location.clone();
            let semaphore = semaphore.clone();
            let aqi = self.aqi.clone();
            let weather = self.weather.clone();
            let span = info_span!("ingest_location", %run_id, location = %location);
            tasks.push(tokio::spawn(
                async move {
                    let _permit = semaphore.acquire().await.expect("semaphore not closed");
                    fetch_location(&location, aqi.as_ref(), weather.as_ref()).await
                }
                .instrument(span),
            ));
        }

        let mut batch = ObservationBatch::default();
        let mut fetch_failures = 0usize;
        let mut normalization_failures = 0usize;
        for task in tasks {
            let report = task.await.context("fetch task panicked")?;
            fetch_failures += report.fetch_failures;
            normalization_failures += report.normalization_failures;
            batch.merge(report.batch);
        }

        // Commit stage: one transaction; a storage failure rolls the batch
        // back, leaves the checkpoint alone, and aborts the run.
        let result = self.store.commit_batch(&batch).await?;

        // The checkpoint advances even when every fetch in the batch
        // failed; the dead-letter WARN entries above are the audit trail.
        // One permanently broken location must not stall the pipeline.
        let offset_after = offset_before + slice.len() as i64;
        self.store.advance_checkpoint(offset_after).await?;

        let aggregate_rows = self
            .store
            .recompute_average_temperature(designated_id)
            .await?;

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            offset_before,
            offset_after,
            locations_processed: slice.len(),
            fetch_failures,
            normalization_failures,
            batch: result,
            aggregate_rows,
        };
        info!(
            inserted = summary.batch.inserted(),
            duplicate = summary.batch.duplicates(),
            fetch_failures,
            checkpoint = offset_after,
            aggregate_rows,
            "batch complete"
        );
        Ok(summary)
    }

    /// Summary for a run that ingests nothing. The aggregate is still
    /// recomputed so the derived view tracks the designated pollutant
    /// even across no-op runs.
    async fn noop_summary(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        offset: i64,
        designated_id: i64,
    ) -> Result<RunSummary> {
        let aggregate_rows = self
            .store
            .recompute_average_temperature(designated_id)
            .await?;
        Ok(RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            offset_before: offset,
            offset_after: offset,
            locations_processed: 0,
            fetch_failures: 0,
            normalization_failures: 0,
            batch: BatchResult::default(),
            aggregate_rows,
        })
    }
}

/// Invokes both providers for one location and normalizes whatever came
/// back. Each provider failure is a logged skip for that provider only.
async fn fetch_location(
    location: &str,
    aqi: &dyn ProviderAdapter,
    weather: &dyn ProviderAdapter,
) -> LocationReport {
    let mut report = LocationReport {
        batch: ObservationBatch::default(),
        fetch_failures: 0,
        normalization_failures: 0,
    };

    for adapter in [aqi, weather] {
        match adapter.fetch(location).await {
            Ok(payload) => {
                let ingested_at = Utc::now().naive_utc();
                match normalize(&payload, ingested_at) {
                    Ok(CanonicalRecord::AirQuality(record)) => {
                        report.batch.air_quality.push(record)
                    }
                    Ok(CanonicalRecord::Weather(record)) => report.batch.weather.push(record),
                    Err(err) => {
                        report.normalization_failures += 1;
                        log_skip(location, adapter.provider_id(), &err);
                    }
                }
            }
            Err(err) => {
                report.fetch_failures += 1;
                log_fetch_skip(location, adapter.provider_id(), &err);
            }
        }
    }

    report
}

fn log_fetch_skip(location: &str, provider: &str, err: &FetchError) {
    warn!(location, provider, error = %err, "location skipped for this run");
}

fn log_skip(location: &str, provider: &str, err: &NormalizationError) {
    warn!(location, provider, error = %err, "payload rejected; location skipped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use atmos_adapters::{AqiPayload, ProviderPayload, WeatherPayload};
    use serde_json::json;
    use tempfile::TempDir;

    struct StubAqi;

    #[async_trait]
    impl ProviderAdapter for StubAqi {
        fn provider_id(&self) -> &'static str {
            "stub-aqi"
        }

        async fn fetch(&self, location: &str) -> Result<ProviderPayload, FetchError> {
            let payload: AqiPayload = serde_json::from_value(json!({
                "status": "ok",
                "data": {
                    "aqi": 50,
                    "city": { "name": location },
                    "time": { "s": "2026-03-01 08:00:00" },
                    "dominentpol": "pm25",
                    "forecast": { "daily": { "pm25": [{ "avg": 10.0 }] } }
                }
            }))
            .expect("stub aqi payload");
            Ok(ProviderPayload::AirQuality(payload))
        }
    }

    struct StubWeather {
        temp_kelvin: f64,
    }

    impl StubWeather {
        fn mild() -> Self {
            Self { temp_kelvin: 283.15 }
        }
    }

    #[async_trait]
    impl ProviderAdapter for StubWeather {
        fn provider_id(&self) -> &'static str {
            "stub-weather"
        }

        async fn fetch(&self, location: &str) -> Result<ProviderPayload, FetchError> {
            let payload: WeatherPayload = serde_json::from_value(json!({
                "cod": 200,
                "name": location,
                "dt": 1767254400,
                "main": { "temp": self.temp_kelvin, "humidity": 50 },
                "weather": [{ "description": "mist" }],
                "wind": { "speed": 2.0 }
            }))
            .expect("stub weather payload");
            Ok(ProviderPayload::Weather(payload))
        }
    }

    struct DownAdapter;

    #[async_trait]
    impl ProviderAdapter for DownAdapter {
        fn provider_id(&self) -> &'static str {
            "stub-down"
        }

        async fn fetch(&self, _location: &str) -> Result<ProviderPayload, FetchError> {
            Err(FetchError::Timeout)
        }
    }

    async fn pipeline_with(
        dir: &TempDir,
        batch_size: usize,
        aqi: Arc<dyn ProviderAdapter>,
        weather: Arc<dyn ProviderAdapter>,
    ) -> Pipeline {
        let store = Store::open(dir.path().join("sync.db")).await.expect("open");
        let config = RunConfig {
            database_path: dir.path().join("sync.db"),
            batch_size,
            ..RunConfig::default()
        };
        let locations = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        Pipeline::new(config, store, locations, aqi, weather)
    }

    #[tokio::test]
    async fn batches_resume_from_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline =
            pipeline_with(&dir, 2, Arc::new(StubAqi), Arc::new(StubWeather::mild())).await;

        let first = pipeline.run_once().await.unwrap();
        assert_eq!(first.offset_before, 0);
        assert_eq!(first.offset_after, 2);
        assert_eq!(first.locations_processed, 2);
        assert_eq!(first.batch.inserted(), 4);

        let store = pipeline.store();
        assert_eq!(store.observation_count_for("A").await.unwrap(), (1, 1));
        assert_eq!(store.observation_count_for("B").await.unwrap(), (1, 1));
        assert_eq!(store.observation_count_for("C").await.unwrap(), (0, 0));

        let second = pipeline.run_once().await.unwrap();
        assert_eq!(second.offset_before, 2);
        assert_eq!(second.offset_after, 3);
        assert_eq!(second.locations_processed, 1);
        assert_eq!(store.observation_count_for("C").await.unwrap(), (1, 1));

        // Everything processed: further runs are no-ops.
        let third = pipeline.run_once().await.unwrap();
        assert_eq!(third.locations_processed, 0);
        assert_eq!(third.offset_after, 3);
    }

    #[tokio::test]
    async fn reprocessing_a_batch_inserts_nothing_new() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline =
            pipeline_with(&dir, 25, Arc::new(StubAqi), Arc::new(StubWeather::mild())).await;

        let first = pipeline.run_once().await.unwrap();
        assert_eq!(first.batch.inserted(), 6);

        // Simulate a crash after commit but before the checkpoint write:
        // the whole batch gets reprocessed on the next run.
        pipeline.store().advance_checkpoint(0).await.unwrap();
        let rerun = pipeline.run_once().await.unwrap();
        assert_eq!(rerun.batch.inserted(), 0);
        assert_eq!(rerun.batch.duplicates(), 6);
        assert_eq!(pipeline.store().counts().await.unwrap().air_quality, 3);
    }

    #[tokio::test]
    async fn all_fetch_failures_still_advance_the_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline_with(&dir, 2, Arc::new(DownAdapter), Arc::new(DownAdapter)).await;

        let summary = pipeline.run_once().await.unwrap();
        assert_eq!(summary.fetch_failures, 4);
        assert_eq!(summary.batch.inserted(), 0);
        assert_eq!(summary.offset_after, 2);
        assert_eq!(pipeline.store().read_offset().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn storage_failure_aborts_run_and_preserves_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        // Impossible reading: converts below absolute zero and trips the
        // storage CHECK mid-batch.
        let poisoned = Arc::new(StubWeather { temp_kelvin: -10.0 });
        let pipeline = pipeline_with(&dir, 3, Arc::new(StubAqi), poisoned).await;

        assert!(pipeline.run_once().await.is_err());
        let store = pipeline.store();
        assert_eq!(store.read_offset().await.unwrap(), 0);
        let counts = store.counts().await.unwrap();
        assert_eq!(counts.air_quality, 0);
        assert_eq!(counts.weather, 0);
    }

    #[tokio::test]
    async fn row_count_guard_skips_ingest() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("sync.db")).await.unwrap();
        let config = RunConfig {
            database_path: dir.path().join("sync.db"),
            batch_size: 3,
            max_rows: Some(0),
            ..RunConfig::default()
        };
        let pipeline = Pipeline::new(
            config,
            store,
            vec!["A".to_string()],
            Arc::new(StubAqi),
            Arc::new(StubWeather::mild()),
        );

        let summary = pipeline.run_once().await.unwrap();
        assert_eq!(summary.locations_processed, 0);
        assert_eq!(pipeline.store().read_offset().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn locations_file_parsing_skips_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locations.txt");
        tokio::fs::write(&path, "Berlin\n\n  Tokyo  \nCairo\n")
            .await
            .unwrap();
        let locations = load_locations_file(&path).await.unwrap();
        assert_eq!(locations, vec!["Berlin", "Tokyo", "Cairo"]);
    }
}
