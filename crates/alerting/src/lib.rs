//! Alerting System
//!
//! Turns a sensor's reading history into an OK / WARN / ALERT status and
//! tracks alert episodes that open after three consecutive readings above
//! the safe CO2 threshold and close after three consecutive safe ones.

mod detector;
mod error;
mod manager;
mod service;
mod status;

pub use detector::StatusDetector;
pub use error::AlertError;
pub use manager::{AlertManager, AlertPhase, SensorGuard, Transition};
pub use service::{AlertSummary, MetricsSummary, SensorService, METRICS_WINDOW_DAYS};
pub use status::{classify, Status, SAFE_CO2_THRESHOLD_PPM, STATUS_WINDOW};
