//! In-memory Repository Implementation

use crate::{Aggregate, Alert, AlertStore, Measurement, MeasurementStore, SensorStore, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Repository for data access (in-memory implementation)
pub struct Repository {
    /// Readings per sensor, sorted by `(measured_at, seq)`
    measurements: Mutex<HashMap<String, Vec<Measurement>>>,
    /// Alert episodes per sensor, in insertion order
    alerts: Mutex<HashMap<String, Vec<Alert>>>,
    /// Next measurement sequence number
    next_seq: Mutex<u64>,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StorageError> {
    mutex
        .lock()
        .map_err(|e| StorageError::DatabaseError(format!("Lock error: {}", e)))
}

impl Repository {
    /// Create a new in-memory repository
    pub fn new() -> Self {
        info!("Creating in-memory repository");
        Self {
            measurements: Mutex::new(HashMap::new()),
            alerts: Mutex::new(HashMap::new()),
            next_seq: Mutex::new(1),
        }
    }
}

impl Default for Repository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MeasurementStore for Repository {
    async fn insert_measurement(
        &self,
        sensor_id: &str,
        co2_ppm: i64,
        measured_at: DateTime<Utc>,
    ) -> Result<Measurement, StorageError> {
        let mut measurements = lock(&self.measurements)?;

        let mut seq = lock(&self.next_seq)?;
        let record = Measurement {
            seq: *seq,
            sensor_id: sensor_id.to_string(),
            co2_ppm,
            measured_at,
        };
        *seq += 1;

        // seq only grows, so the new record goes after every equal timestamp
        let history = measurements.entry(sensor_id.to_string()).or_default();
        let pos = history.partition_point(|m| m.measured_at <= measured_at);
        history.insert(pos, record.clone());

        debug!(sensor_id, seq = record.seq, co2_ppm, "Inserted measurement");
        Ok(record)
    }

    async fn remove_measurement(&self, sensor_id: &str, seq: u64) -> Result<(), StorageError> {
        let mut measurements = lock(&self.measurements)?;

        let history = measurements.get_mut(sensor_id).ok_or(StorageError::NotFound)?;
        let pos = history
            .iter()
            .position(|m| m.seq == seq)
            .ok_or(StorageError::NotFound)?;
        history.remove(pos);
        if history.is_empty() {
            measurements.remove(sensor_id);
        }

        debug!(sensor_id, seq, "Removed measurement");
        Ok(())
    }

    async fn find_recent(&self, sensor_id: &str, n: usize) -> Result<Vec<Measurement>, StorageError> {
        let measurements = lock(&self.measurements)?;

        Ok(measurements
            .get(sensor_id)
            .map(|h| h.iter().rev().take(n).cloned().collect())
            .unwrap_or_default())
    }

    async fn find_at_or_before(
        &self,
        sensor_id: &str,
        time: DateTime<Utc>,
        offset: usize,
    ) -> Result<Option<Measurement>, StorageError> {
        let measurements = lock(&self.measurements)?;

        Ok(measurements.get(sensor_id).and_then(|h| {
            let end = h.partition_point(|m| m.measured_at <= time);
            h[..end].iter().rev().nth(offset).cloned()
        }))
    }

    async fn find_from(
        &self,
        sensor_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Measurement>, StorageError> {
        let measurements = lock(&self.measurements)?;

        Ok(measurements
            .get(sensor_id)
            .map(|h| {
                let start = h.partition_point(|m| m.measured_at < since);
                h[start..].iter().take(limit).cloned().collect()
            })
            .unwrap_or_default())
    }

    async fn count(&self, sensor_id: &str) -> Result<u64, StorageError> {
        let measurements = lock(&self.measurements)?;
        Ok(measurements.get(sensor_id).map_or(0, |h| h.len() as u64))
    }

    async fn aggregate_since(
        &self,
        sensor_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<Aggregate>, StorageError> {
        let measurements = lock(&self.measurements)?;

        let Some(history) = measurements.get(sensor_id) else {
            return Ok(None);
        };
        let start = history.partition_point(|m| m.measured_at <= cutoff);
        let window = &history[start..];

        let Some(max) = window.iter().map(|m| m.co2_ppm).max() else {
            return Ok(None);
        };
        let sum: i64 = window.iter().map(|m| m.co2_ppm).sum();

        Ok(Some(Aggregate {
            avg_co2_ppm: sum as f64 / window.len() as f64,
            max_co2_ppm: max,
            count: window.len() as u64,
        }))
    }
}

#[async_trait]
impl AlertStore for Repository {
    async fn insert_open(&self, sensor_id: &str, started_at: DateTime<Utc>) -> Result<(), StorageError> {
        let mut alerts = lock(&self.alerts)?;

        let episodes = alerts.entry(sensor_id.to_string()).or_default();
        if episodes.iter().any(Alert::is_open) {
            return Err(StorageError::OpenAlertExists(sensor_id.to_string()));
        }

        episodes.push(Alert {
            sensor_id: sensor_id.to_string(),
            started_at,
            ended_at: None,
        });
        Ok(())
    }

    async fn close_open(&self, sensor_id: &str, ended_at: DateTime<Utc>) -> Result<bool, StorageError> {
        let mut alerts = lock(&self.alerts)?;

        let open = alerts
            .get_mut(sensor_id)
            .and_then(|episodes| episodes.iter_mut().find(|a| a.is_open()));

        match open {
            Some(alert) => {
                alert.ended_at = Some(ended_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_open(&self, sensor_id: &str) -> Result<Option<Alert>, StorageError> {
        let alerts = lock(&self.alerts)?;

        Ok(alerts
            .get(sensor_id)
            .and_then(|episodes| episodes.iter().find(|a| a.is_open()).cloned()))
    }

    async fn list_alerts(&self, sensor_id: &str) -> Result<Vec<Alert>, StorageError> {
        let alerts = lock(&self.alerts)?;

        let mut episodes = alerts.get(sensor_id).cloned().unwrap_or_default();
        // stable sort keeps insertion order for equal start times
        episodes.sort_by_key(|a| a.started_at);
        Ok(episodes)
    }
}

impl SensorStore for Repository {
    fn backend(&self) -> &'static str {
        "memory"
    }
}
