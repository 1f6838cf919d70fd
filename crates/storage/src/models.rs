//! Stored record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single CO2 reading
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    /// Insertion counter, breaks ties between equal timestamps
    pub seq: u64,
    pub sensor_id: String,
    pub co2_ppm: i64,
    pub measured_at: DateTime<Utc>,
}

impl Measurement {
    /// Ordering key within a sensor's history
    pub fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.measured_at, self.seq)
    }
}

/// One contiguous alert episode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub sensor_id: String,
    pub started_at: DateTime<Utc>,
    /// `None` while the episode is open
    pub ended_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Windowed aggregate over a sensor's readings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub avg_co2_ppm: f64,
    pub max_co2_ppm: i64,
    pub count: u64,
}
