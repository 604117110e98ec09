//! SQLite persistence for the Atmos ingestion pipeline: schema bootstrap,
//! entity resolution, deduplicating batch upsert, checkpoint tracking, and
//! the derived average-temperature aggregate.

use std::path::Path;

use atmos_core::{format_timestamp, BatchResult, ObservationBatch, Pollutant, UNKNOWN_POLLUTANT};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "atmos-storage";

/// Storage failures are fatal for the enclosing batch: the transaction
/// rolls back, the checkpoint stays put, and the run exits non-zero.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("unknown pollutant {0:?}; the pollutant set is fixed at initialization")]
    UnknownPollutant(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Lookup entity kinds the resolver knows about. Location and
/// WeatherCondition are open sets (insert on first sight); Pollutant is a
/// closed enumeration where unseen codes resolve to the sentinel row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Location,
    Pollutant,
    WeatherCondition,
}

/// Conditions seeded at bootstrap. Providers return free-text descriptions
/// outside this set, so the resolver also inserts novel ones dynamically.
const SEED_CONDITIONS: [&str; 9] = [
    "clear sky",
    "few clouds",
    "scattered clouds",
    "broken clouds",
    "shower rain",
    "rain",
    "thunderstorm",
    "snow",
    "mist",
];

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS location (
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS pollutant (
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS weather_condition (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    description TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS air_quality_observation (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    location_id           INTEGER NOT NULL REFERENCES location(id),
    observed_at           TEXT NOT NULL,
    index_value           INTEGER NOT NULL,
    dominant_pollutant_id INTEGER NOT NULL REFERENCES pollutant(id),
    forecast_pm25         REAL NOT NULL,
    forecast_pm10         REAL NOT NULL,
    forecast_o3           REAL NOT NULL,
    UNIQUE(location_id, observed_at)
);
CREATE TABLE IF NOT EXISTS weather_observation (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    location_id   INTEGER NOT NULL REFERENCES location(id),
    observed_at   TEXT NOT NULL,
    temperature_c REAL NOT NULL CHECK(temperature_c >= -273.15),
    condition_id  INTEGER NOT NULL REFERENCES weather_condition(id),
    humidity      INTEGER NOT NULL,
    wind_speed    REAL NOT NULL,
    UNIQUE(location_id, observed_at)
);
CREATE TABLE IF NOT EXISTS avg_temperature_aggregate (
    location_id       INTEGER PRIMARY KEY REFERENCES location(id),
    avg_temperature_c REAL NOT NULL
);
CREATE TABLE IF NOT EXISTS ingestion_checkpoint (
    singleton_key INTEGER PRIMARY KEY CHECK(singleton_key = 0),
    next_offset   INTEGER NOT NULL
);
"#;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub locations: i64,
    pub pollutants: i64,
    pub conditions: i64,
    pub air_quality: i64,
    pub weather: i64,
    pub aggregates: i64,
    pub checkpoint: i64,
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if missing) the SQLite database at `path`. A single
    /// pooled connection keeps the resolver/upsert stages single-writer.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        info!(path = %path.as_ref().display(), "opened sqlite store");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates tables and seeds the lookup sets. Idempotent; safe to call
    /// on every run start.
    pub async fn bootstrap(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&mut *tx).await?;
        }

        for pollutant in Pollutant::ALL {
            sqlx::query("INSERT OR IGNORE INTO pollutant (name) VALUES (?1)")
                .bind(pollutant.as_str())
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("INSERT OR IGNORE INTO pollutant (name) VALUES (?1)")
            .bind(UNKNOWN_POLLUTANT)
            .execute(&mut *tx)
            .await?;

        for condition in SEED_CONDITIONS {
            sqlx::query("INSERT OR IGNORE INTO weather_condition (description) VALUES (?1)")
                .bind(condition)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Resolves a natural key to its surrogate id in a standalone
    /// transaction. The batch commit path uses the same logic inside its
    /// own transaction so a failed batch cannot leak orphan lookup rows.
    pub async fn resolve(&self, kind: EntityKind, natural_key: &str) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let id = resolve_in_tx(&mut tx, kind, natural_key).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Surrogate id for a designated pollutant name. Unlike `resolve`,
    /// this rejects names outside the closed set instead of falling back
    /// to the sentinel, so a typo in `--designated-pollutant` surfaces
    /// instead of silently aggregating nothing.
    pub async fn designated_pollutant_id(&self, name: &str) -> Result<i64> {
        let Some(pollutant) = Pollutant::from_code(name) else {
            return Err(StorageError::UnknownPollutant(name.to_string()));
        };
        let row = sqlx::query("SELECT id FROM pollutant WHERE name = ?1")
            .bind(pollutant.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("id"))
    }

    /// Writes one batch of canonical records atomically. Rows that already
    /// exist under the `(location_id, observed_at)` uniqueness key are
    /// counted as duplicates and skipped. Any storage failure rolls the
    /// whole batch back.
    pub async fn commit_batch(&self, batch: &ObservationBatch) -> Result<BatchResult> {
        let mut tx = self.pool.begin().await?;
        let mut result = BatchResult::default();

        for record in &batch.air_quality {
            let location_id = resolve_in_tx(&mut tx, EntityKind::Location, &record.location).await?;
            let pollutant_id =
                resolve_in_tx(&mut tx, EntityKind::Pollutant, &record.dominant_pollutant).await?;

            let outcome = sqlx::query(
                r#"
                INSERT OR IGNORE INTO air_quality_observation
                    (location_id, observed_at, index_value, dominant_pollutant_id,
                     forecast_pm25, forecast_pm10, forecast_o3)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(location_id)
            .bind(format_timestamp(record.observed_at))
            .bind(record.index_value)
            .bind(pollutant_id)
            .bind(record.forecast_pm25)
            .bind(record.forecast_pm10)
            .bind(record.forecast_o3)
            .execute(&mut *tx)
            .await?;

            if outcome.rows_affected() == 0 {
                result.air_quality.duplicate += 1;
            } else {
                result.air_quality.inserted += 1;
            }
        }

        for record in &batch.weather {
            let location_id = resolve_in_tx(&mut tx, EntityKind::Location, &record.location).await?;
            let condition_id =
                resolve_in_tx(&mut tx, EntityKind::WeatherCondition, &record.condition).await?;

            let outcome = sqlx::query(
                r#"
                INSERT OR IGNORE INTO weather_observation
                    (location_id, observed_at, temperature_c, condition_id, humidity, wind_speed)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(location_id)
            .bind(format_timestamp(record.observed_at))
            .bind(record.temperature_c)
            .bind(condition_id)
            .bind(record.humidity)
            .bind(record.wind_speed)
            .execute(&mut *tx)
            .await?;

            if outcome.rows_affected() == 0 {
                result.weather.duplicate += 1;
            } else {
                result.weather.inserted += 1;
            }
        }

        tx.commit().await?;
        debug!(
            inserted = result.inserted(),
            duplicate = result.duplicates(),
            "batch committed"
        );
        Ok(result)
    }

    /// Offset of the next unprocessed location; 0 when no checkpoint has
    /// ever been persisted.
    pub async fn read_offset(&self) -> Result<i64> {
        let row = sqlx::query("SELECT next_offset FROM ingestion_checkpoint WHERE singleton_key = 0")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("next_offset")).unwrap_or(0))
    }

    /// Persists a new checkpoint offset, replacing the prior value. Must
    /// only be called after the batch for that range has committed.
    pub async fn advance_checkpoint(&self, new_offset: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingestion_checkpoint (singleton_key, next_offset)
            VALUES (0, ?1)
            ON CONFLICT(singleton_key) DO UPDATE SET next_offset = excluded.next_offset
            "#,
        )
        .bind(new_offset)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Rebuilds the average-temperature aggregate from scratch: one row
    /// per location whose most recent air-quality observation names the
    /// designated pollutant as dominant, averaging all weather history for
    /// that location. Locations without weather observations get no row;
    /// a mean over an empty set is undefined, not zero.
    pub async fn recompute_average_temperature(&self, designated_pollutant_id: i64) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM avg_temperature_aggregate")
            .execute(&mut *tx)
            .await?;
        let outcome = sqlx::query(
            r#"
            INSERT INTO avg_temperature_aggregate (location_id, avg_temperature_c)
            SELECT w.location_id, AVG(w.temperature_c)
              FROM weather_observation w
             WHERE w.location_id IN (
                   SELECT a.location_id
                     FROM air_quality_observation a
                     JOIN (SELECT location_id, MAX(observed_at) AS latest
                             FROM air_quality_observation
                            GROUP BY location_id) m
                       ON a.location_id = m.location_id AND a.observed_at = m.latest
                    WHERE a.dominant_pollutant_id = ?1)
             GROUP BY w.location_id
            "#,
        )
        .bind(designated_pollutant_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(outcome.rows_affected())
    }

    /// Mean temperature stored for a location, if it qualified for the
    /// aggregate on the last recompute.
    pub async fn average_temperature(&self, location: &str) -> Result<Option<f64>> {
        let row = sqlx::query(
            r#"
            SELECT a.avg_temperature_c
              FROM avg_temperature_aggregate a
              JOIN location l ON l.id = a.location_id
             WHERE l.name = ?1
            "#,
        )
        .bind(location)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get::<f64, _>("avg_temperature_c")))
    }

    pub async fn observation_count_for(&self, location: &str) -> Result<(i64, i64)> {
        let air = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM air_quality_observation o
              JOIN location l ON l.id = o.location_id WHERE l.name = ?1
            "#,
        )
        .bind(location)
        .fetch_one(&self.pool)
        .await?
        .get::<i64, _>("n");
        let weather = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM weather_observation o
              JOIN location l ON l.id = o.location_id WHERE l.name = ?1
            "#,
        )
        .bind(location)
        .fetch_one(&self.pool)
        .await?
        .get::<i64, _>("n");
        Ok((air, weather))
    }

    pub async fn counts(&self) -> Result<StoreCounts> {
        Ok(StoreCounts {
            locations: self.scalar("SELECT COUNT(*) AS n FROM location").await?,
            pollutants: self.scalar("SELECT COUNT(*) AS n FROM pollutant").await?,
            conditions: self
                .scalar("SELECT COUNT(*) AS n FROM weather_condition")
                .await?,
            air_quality: self
                .scalar("SELECT COUNT(*) AS n FROM air_quality_observation")
                .await?,
            weather: self
                .scalar("SELECT COUNT(*) AS n FROM weather_observation")
                .await?,
            aggregates: self
                .scalar("SELECT COUNT(*) AS n FROM avg_temperature_aggregate")
                .await?,
            checkpoint: self.read_offset().await?,
        })
    }

    async fn scalar(&self, sql: &str) -> Result<i64> {
        let row = sqlx::query(sql).fetch_one(&self.pool).await?;
        Ok(row.get::<i64, _>("n"))
    }
}

/// Resolve-or-create inside an existing transaction. For the closed
/// pollutant set, unseen codes resolve to the sentinel row instead of
/// inserting; the open sets insert on first sight. Existence is
/// re-checked here, inside the transaction that performs the write, so
/// concurrent upstream stages cannot race the insert.
async fn resolve_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    kind: EntityKind,
    natural_key: &str,
) -> Result<i64> {
    let (table, column, key) = match kind {
        EntityKind::Location => ("location", "name", natural_key),
        EntityKind::WeatherCondition => ("weather_condition", "description", natural_key),
        EntityKind::Pollutant => {
            let name = Pollutant::from_code(natural_key)
                .map(|p| p.as_str())
                .unwrap_or(UNKNOWN_POLLUTANT);
            let row = sqlx::query("SELECT id FROM pollutant WHERE name = ?1")
                .bind(name)
                .fetch_one(&mut **tx)
                .await?;
            return Ok(row.get::<i64, _>("id"));
        }
    };

    let existing = sqlx::query(&format!("SELECT id FROM {table} WHERE {column} = ?1"))
        .bind(key)
        .fetch_optional(&mut **tx)
        .await?;
    if let Some(row) = existing {
        return Ok(row.get::<i64, _>("id"));
    }

    let outcome = sqlx::query(&format!("INSERT INTO {table} ({column}) VALUES (?1)"))
        .bind(key)
        .execute(&mut **tx)
        .await?;
    Ok(outcome.last_insert_rowid())
}
