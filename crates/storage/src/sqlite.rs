//! SQLite Repository Implementation

use crate::{Aggregate, Alert, AlertStore, Measurement, MeasurementStore, SensorStore, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, sqlx::FromRow)]
struct MeasurementRow {
    seq: i64,
    sensor_id: String,
    co2_ppm: i64,
    measured_at: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct AlertRow {
    sensor_id: String,
    started_at: i64,
    ended_at: Option<i64>,
}

/// Sub-microsecond parts are dropped
fn to_micros(time: DateTime<Utc>) -> i64 {
    time.timestamp_micros()
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StorageError::SerializationError(format!("Invalid timestamp: {}", micros)))
}

impl TryFrom<MeasurementRow> for Measurement {
    type Error = StorageError;

    fn try_from(row: MeasurementRow) -> Result<Self, Self::Error> {
        Ok(Measurement {
            seq: row.seq as u64,
            sensor_id: row.sensor_id,
            co2_ppm: row.co2_ppm,
            measured_at: from_micros(row.measured_at)?,
        })
    }
}

fn into_measurements(rows: Vec<MeasurementRow>) -> Result<Vec<Measurement>, StorageError> {
    rows.into_iter().map(Measurement::try_from).collect()
}

impl TryFrom<AlertRow> for Alert {
    type Error = StorageError;

    fn try_from(row: AlertRow) -> Result<Self, Self::Error> {
        Ok(Alert {
            sensor_id: row.sensor_id,
            started_at: from_micros(row.started_at)?,
            ended_at: row.ended_at.map(from_micros).transpose()?,
        })
    }
}

/// Repository backed by a SQLite database
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    /// Open (or create) the database at `db_url` and apply migrations
    pub async fn connect(db_url: &str) -> Result<Self, StorageError> {
        let opts = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;

        info!("Opened SQLite repository at {}", db_url);
        Self::with_pool(pool).await
    }

    /// Private in-memory database on a single pinned connection
    pub async fn in_memory() -> Result<Self, StorageError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(opts)
            .await?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!("Migrations applied");
        Ok(Self { pool })
    }
}

#[async_trait]
impl MeasurementStore for SqliteRepository {
    async fn insert_measurement(
        &self,
        sensor_id: &str,
        co2_ppm: i64,
        measured_at: DateTime<Utc>,
    ) -> Result<Measurement, StorageError> {
        let result = sqlx::query(
            "INSERT INTO sensor_measurements (sensor_id, co2_ppm, measured_at) VALUES (?, ?, ?)",
        )
        .bind(sensor_id)
        .bind(co2_ppm)
        .bind(to_micros(measured_at))
        .execute(&self.pool)
        .await?;

        let seq = result.last_insert_rowid() as u64;
        debug!(sensor_id, seq, co2_ppm, "Inserted measurement");

        Ok(Measurement {
            seq,
            sensor_id: sensor_id.to_string(),
            co2_ppm,
            measured_at,
        })
    }

    async fn remove_measurement(&self, sensor_id: &str, seq: u64) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM sensor_measurements WHERE seq = ? AND sensor_id = ?")
            .bind(seq as i64)
            .bind(sensor_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }

        debug!(sensor_id, seq, "Removed measurement");
        Ok(())
    }

    async fn find_recent(&self, sensor_id: &str, n: usize) -> Result<Vec<Measurement>, StorageError> {
        let rows: Vec<MeasurementRow> = sqlx::query_as(
            "SELECT seq, sensor_id, co2_ppm, measured_at FROM sensor_measurements \
             WHERE sensor_id = ? ORDER BY measured_at DESC, seq DESC LIMIT ?",
        )
        .bind(sensor_id)
        .bind(n as i64)
        .fetch_all(&self.pool)
        .await?;

        into_measurements(rows)
    }

    async fn find_at_or_before(
        &self,
        sensor_id: &str,
        time: DateTime<Utc>,
        offset: usize,
    ) -> Result<Option<Measurement>, StorageError> {
        let rows: Vec<MeasurementRow> = sqlx::query_as(
            "SELECT seq, sensor_id, co2_ppm, measured_at FROM sensor_measurements \
             WHERE sensor_id = ? AND measured_at <= ? \
             ORDER BY measured_at DESC, seq DESC LIMIT 1 OFFSET ?",
        )
        .bind(sensor_id)
        .bind(to_micros(time))
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(into_measurements(rows)?.into_iter().next())
    }

    async fn find_from(
        &self,
        sensor_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Measurement>, StorageError> {
        let rows: Vec<MeasurementRow> = sqlx::query_as(
            "SELECT seq, sensor_id, co2_ppm, measured_at FROM sensor_measurements \
             WHERE sensor_id = ? AND measured_at >= ? \
             ORDER BY measured_at ASC, seq ASC LIMIT ?",
        )
        .bind(sensor_id)
        .bind(to_micros(since))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        into_measurements(rows)
    }

    async fn count(&self, sensor_id: &str) -> Result<u64, StorageError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sensor_measurements WHERE sensor_id = ?")
                .bind(sensor_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(count as u64)
    }

    async fn aggregate_since(
        &self,
        sensor_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<Aggregate>, StorageError> {
        let (avg, max, count): (Option<f64>, Option<i64>, i64) = sqlx::query_as(
            "SELECT AVG(co2_ppm), MAX(co2_ppm), COUNT(*) FROM sensor_measurements \
             WHERE sensor_id = ? AND measured_at > ?",
        )
        .bind(sensor_id)
        .bind(to_micros(cutoff))
        .fetch_one(&self.pool)
        .await?;

        Ok(match (avg, max) {
            (Some(avg_co2_ppm), Some(max_co2_ppm)) => Some(Aggregate {
                avg_co2_ppm,
                max_co2_ppm,
                count: count as u64,
            }),
            _ => None,
        })
    }
}

#[async_trait]
impl AlertStore for SqliteRepository {
    async fn insert_open(&self, sensor_id: &str, started_at: DateTime<Utc>) -> Result<(), StorageError> {
        let result = sqlx::query("INSERT INTO sensor_alerts (sensor_id, started_at) VALUES (?, ?)")
            .bind(sensor_id)
            .bind(to_micros(started_at))
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StorageError::OpenAlertExists(sensor_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn close_open(&self, sensor_id: &str, ended_at: DateTime<Utc>) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE sensor_alerts SET ended_at = ? WHERE sensor_id = ? AND ended_at IS NULL",
        )
        .bind(to_micros(ended_at))
        .bind(sensor_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_open(&self, sensor_id: &str) -> Result<Option<Alert>, StorageError> {
        let row: Option<AlertRow> = sqlx::query_as(
            "SELECT sensor_id, started_at, ended_at FROM sensor_alerts \
             WHERE sensor_id = ? AND ended_at IS NULL",
        )
        .bind(sensor_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Alert::try_from).transpose()
    }

    async fn list_alerts(&self, sensor_id: &str) -> Result<Vec<Alert>, StorageError> {
        let rows: Vec<AlertRow> = sqlx::query_as(
            "SELECT sensor_id, started_at, ended_at FROM sensor_alerts \
             WHERE sensor_id = ? ORDER BY started_at ASC, id ASC",
        )
        .bind(sensor_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Alert::try_from).collect()
    }
}

impl SensorStore for SqliteRepository {
    fn backend(&self) -> &'static str {
        "sqlite"
    }
}
