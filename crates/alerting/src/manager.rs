//! Alert Manager Implementation
//!
//! Per-sensor state machine over alert episodes:
//!
//! ```text
//!            ALERT (open, backdated start)
//!  Normal ─────────────────────────────────► Alerting
//!    ▲                                          │
//!    └──────────────────────────────────────────┘
//!              OK (close, backdated end)
//! ```
//!
//! WARN never moves the machine, and repeated ALERT / OK readings in the
//! matching phase are no-ops. The phase is read from the store (an open
//! alert row means `Alerting`), so the ingest path and the status query
//! can never disagree about it.

use crate::detector::StatusDetector;
use crate::error::AlertError;
use crate::status::{Status, STATUS_WINDOW};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use storage::{Alert, SensorStore, StorageError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Whether a sensor currently has an open alert episode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlertPhase {
    #[default]
    Normal,
    Alerting,
}

/// Action the state machine takes for a freshly detected status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Open a new episode
    Open,
    /// Close the open episode
    Close,
    /// Leave alert state untouched
    Stay,
}

impl AlertPhase {
    pub fn from_open_alert(open: Option<&Alert>) -> Self {
        match open {
            Some(_) => AlertPhase::Alerting,
            None => AlertPhase::Normal,
        }
    }

    /// Edge to take when the detector reports `status`
    pub fn transition(self, status: Status) -> Transition {
        match (self, status) {
            (AlertPhase::Normal, Status::Alert) => Transition::Open,
            (AlertPhase::Alerting, Status::Ok) => Transition::Close,
            _ => Transition::Stay,
        }
    }

    /// Externally reported status. ALERT sticks until the episode closes.
    pub fn visible_status(self, detected: Status) -> Status {
        match self {
            AlertPhase::Alerting => Status::Alert,
            AlertPhase::Normal => detected,
        }
    }
}

type LockMap = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

/// Critical section for one sensor. Dropping it releases the lock and
/// removes the sensor's map entry when nobody else is waiting on it.
pub struct SensorGuard<'a> {
    locks: &'a LockMap,
    sensor_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for SensorGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // one reference in the map, one held by this guard
        let idle = locks
            .get(&self.sensor_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 2);
        if idle {
            locks.remove(&self.sensor_id);
        }
    }
}

/// Opens and closes alert episodes as measurements arrive
pub struct AlertManager {
    store: Arc<dyn SensorStore>,
    detector: StatusDetector,
    /// One entry per sensor with a write in flight, serializing detect → check → write
    locks: LockMap,
}

impl AlertManager {
    /// Create a new alert manager over `store`
    pub fn new(store: Arc<dyn SensorStore>) -> Self {
        info!("Creating alert manager on {} store", store.backend());
        Self {
            store,
            detector: StatusDetector::new(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Take the sensor's critical section. Held across ingest and evaluation.
    pub async fn lock_sensor(&self, sensor_id: &str) -> SensorGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(sensor_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        SensorGuard {
            locks: &self.locks,
            sensor_id: sensor_id.to_string(),
            _guard: lock.lock_owned().await,
        }
    }

    /// Current phase of the sensor's state machine
    pub async fn phase(&self, sensor_id: &str) -> Result<AlertPhase, AlertError> {
        let open = self.store.find_open(sensor_id).await?;
        Ok(AlertPhase::from_open_alert(open.as_ref()))
    }

    /// Status as reported to clients
    pub async fn current_status(&self, sensor_id: &str) -> Result<Status, AlertError> {
        let phase = self.phase(sensor_id).await?;
        if phase == AlertPhase::Alerting {
            return Ok(Status::Alert);
        }

        let detected = self.detector.detect(self.store.as_ref(), sensor_id).await?;
        Ok(phase.visible_status(detected))
    }

    /// Re-evaluate the sensor after the reading at `measured_at` was stored
    pub async fn evaluate(
        &self,
        sensor_id: &str,
        measured_at: DateTime<Utc>,
    ) -> Result<Transition, AlertError> {
        let _guard = self.lock_sensor(sensor_id).await;
        self.evaluate_locked(sensor_id, measured_at).await
    }

    /// Same as [`evaluate`](Self::evaluate); caller holds the sensor lock
    pub(crate) async fn evaluate_locked(
        &self,
        sensor_id: &str,
        measured_at: DateTime<Utc>,
    ) -> Result<Transition, AlertError> {
        let status = self.detector.detect(self.store.as_ref(), sensor_id).await?;
        let phase = self.phase(sensor_id).await?;
        let transition = phase.transition(status);

        debug!(sensor_id, %status, ?phase, ?transition, "Evaluated sensor");

        match transition {
            Transition::Open => {
                let started_at = self.boundary(sensor_id, measured_at).await?;
                match self.store.insert_open(sensor_id, started_at).await {
                    Ok(()) => {
                        metrics::counter!("co2_alerts_opened_total").increment(1);
                        info!(sensor_id, %started_at, "Alert opened");
                    }
                    Err(StorageError::OpenAlertExists(_)) => {
                        warn!(sensor_id, "Alert already opened by another writer");
                        return Ok(Transition::Stay);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Transition::Close => {
                let ended_at = self.boundary(sensor_id, measured_at).await?;
                if self.store.close_open(sensor_id, ended_at).await? {
                    metrics::counter!("co2_alerts_closed_total").increment(1);
                    info!(sensor_id, %ended_at, "Alert closed");
                } else {
                    warn!(sensor_id, "Alert already closed by another writer");
                    return Ok(Transition::Stay);
                }
            }
            Transition::Stay => {}
        }

        Ok(transition)
    }

    /// Timestamp of the first of the readings that caused a transition:
    /// the third most recent reading at or before `measured_at`.
    async fn boundary(
        &self,
        sensor_id: &str,
        measured_at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, AlertError> {
        self.store
            .find_at_or_before(sensor_id, measured_at, STATUS_WINDOW - 1)
            .await?
            .map(|m| m.measured_at)
            .ok_or_else(|| {
                AlertError::InvariantViolation(format!(
                    "sensor {} has fewer than {} readings at or before {}",
                    sensor_id, STATUS_WINDOW, measured_at
                ))
            })
    }

    /// Number of sensors currently locked or waited on
    pub fn locked_sensors(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }
}
