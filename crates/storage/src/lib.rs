//! Storage Layer
//!
//! Measurement and alert persistence behind repository traits, with an
//! in-memory backend and a SQLite backend.

mod models;
mod repository;
mod sqlite;

pub use models::{Aggregate, Alert, Measurement};
pub use repository::Repository;
pub use sqlite::SqliteRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Record not found")]
    NotFound,
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Sensor {0} already has an open alert")]
    OpenAlertExists(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::DatabaseError(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for StorageError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StorageError::DatabaseError(format!("Migration failed: {}", err))
    }
}

/// Measurement history, ordered by `(measured_at, seq)`.
///
/// Timestamps are kept at microsecond precision; finer parts may be lost
/// by a backend.
#[async_trait]
pub trait MeasurementStore: Send + Sync {
    /// Append a reading; the store assigns its sequence number
    async fn insert_measurement(
        &self,
        sensor_id: &str,
        co2_ppm: i64,
        measured_at: DateTime<Utc>,
    ) -> Result<Measurement, StorageError>;

    /// Undo an insert whose evaluation failed. [`StorageError::NotFound`]
    /// if no reading with `seq` exists for the sensor.
    async fn remove_measurement(&self, sensor_id: &str, seq: u64) -> Result<(), StorageError>;

    /// Most recent `n` readings, newest first
    async fn find_recent(&self, sensor_id: &str, n: usize) -> Result<Vec<Measurement>, StorageError>;

    /// Reading at position `offset` when walking back from `time` (inclusive), newest first
    async fn find_at_or_before(
        &self,
        sensor_id: &str,
        time: DateTime<Utc>,
        offset: usize,
    ) -> Result<Option<Measurement>, StorageError>;

    /// Up to `limit` readings with `measured_at >= since`, oldest first
    async fn find_from(
        &self,
        sensor_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Measurement>, StorageError>;

    /// Total readings ever recorded for the sensor
    async fn count(&self, sensor_id: &str) -> Result<u64, StorageError>;

    /// Average and maximum over readings strictly after `cutoff`
    async fn aggregate_since(
        &self,
        sensor_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<Aggregate>, StorageError>;
}

/// Alert episodes. At most one open alert per sensor.
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Open a new episode. Fails with [`StorageError::OpenAlertExists`]
    /// if the sensor already has one open.
    async fn insert_open(&self, sensor_id: &str, started_at: DateTime<Utc>) -> Result<(), StorageError>;

    /// Close the open episode, returning whether one was closed
    async fn close_open(&self, sensor_id: &str, ended_at: DateTime<Utc>) -> Result<bool, StorageError>;

    async fn find_open(&self, sensor_id: &str) -> Result<Option<Alert>, StorageError>;

    /// All episodes ordered by `started_at`
    async fn list_alerts(&self, sensor_id: &str) -> Result<Vec<Alert>, StorageError>;
}

/// Combined store used by the alerting service
pub trait SensorStore: MeasurementStore + AlertStore {
    /// Short backend name for health reporting
    fn backend(&self) -> &'static str;
}
