//! Alerting Error Types

use storage::StorageError;
use thiserror::Error;

/// Errors from status detection and the alert lifecycle
#[derive(Debug, Error)]
pub enum AlertError {
    /// Sensor has never reported a measurement
    #[error("Sensor {0} not found")]
    NotFound(String),

    /// Detector and lifecycle disagree about the reading history
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Reading rejected before it reached the store
    #[error("Invalid measurement: {0}")]
    InvalidMeasurement(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
