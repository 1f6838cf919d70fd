//! Status Detector

use crate::error::AlertError;
use crate::status::{classify, Status, STATUS_WINDOW};
use storage::MeasurementStore;

/// Classifies a sensor from its latest readings. Never touches alert state.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusDetector;

impl StatusDetector {
    pub fn new() -> Self {
        Self
    }

    /// Instantaneous status from the latest [`STATUS_WINDOW`] readings
    pub async fn detect<S>(&self, store: &S, sensor_id: &str) -> Result<Status, AlertError>
    where
        S: MeasurementStore + ?Sized,
    {
        let recent = store.find_recent(sensor_id, STATUS_WINDOW).await?;
        classify(&recent).ok_or_else(|| AlertError::NotFound(sensor_id.to_string()))
    }
}
