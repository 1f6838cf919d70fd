//! Sensor service: ingestion plus the status, alert and metrics queries

use crate::error::AlertError;
use crate::manager::{AlertManager, Transition};
use crate::status::{Status, STATUS_WINDOW};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use storage::SensorStore;
use tracing::{debug, instrument, warn};

/// Length of the metrics window
pub const METRICS_WINDOW_DAYS: i64 = 30;

/// One alert episode with the readings that opened it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertSummary {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub measurement1: i64,
    pub measurement2: i64,
    pub measurement3: i64,
}

/// Max and average CO2 over the metrics window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub max_last_30_days: i64,
    pub avg_last_30_days: f64,
}

/// Entry point used by the HTTP layer
pub struct SensorService {
    store: Arc<dyn SensorStore>,
    manager: AlertManager,
}

impl SensorService {
    pub fn new(store: Arc<dyn SensorStore>) -> Self {
        Self {
            manager: AlertManager::new(store.clone()),
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn SensorStore> {
        &self.store
    }

    pub fn manager(&self) -> &AlertManager {
        &self.manager
    }

    /// Store a reading and run the alert lifecycle for it.
    ///
    /// Timestamps are truncated to microseconds so every backend reports
    /// the same instants. If evaluation fails the reading is removed again
    /// and the error returned, leaving the sensor as it was.
    #[instrument(skip(self), level = "debug")]
    pub async fn ingest(
        &self,
        sensor_id: &str,
        co2_ppm: i64,
        measured_at: DateTime<Utc>,
    ) -> Result<Transition, AlertError> {
        if sensor_id.trim().is_empty() {
            return Err(AlertError::InvalidMeasurement("sensor id is empty".to_string()));
        }
        if co2_ppm < 0 {
            return Err(AlertError::InvalidMeasurement(format!(
                "co2 must be non-negative, got {}",
                co2_ppm
            )));
        }

        let measured_at = measured_at.trunc_subsecs(6);
        let _guard = self.manager.lock_sensor(sensor_id).await;

        let record = self
            .store
            .insert_measurement(sensor_id, co2_ppm, measured_at)
            .await?;

        match self.manager.evaluate_locked(sensor_id, measured_at).await {
            Ok(transition) => {
                metrics::counter!("co2_measurements_ingested_total").increment(1);
                Ok(transition)
            }
            Err(e) => {
                warn!(sensor_id, seq = record.seq, error = %e, "Evaluation failed, discarding reading");
                self.store.remove_measurement(sensor_id, record.seq).await?;
                Err(e)
            }
        }
    }

    /// Client-visible status, sticky ALERT while an episode is open
    pub async fn status(&self, sensor_id: &str) -> Result<Status, AlertError> {
        self.manager.current_status(sensor_id).await
    }

    /// All episodes ordered by start, each with its first three readings
    pub async fn alerts(&self, sensor_id: &str) -> Result<Vec<AlertSummary>, AlertError> {
        self.ensure_known(sensor_id).await?;

        let alerts = self.store.list_alerts(sensor_id).await?;
        let mut summaries = Vec::with_capacity(alerts.len());

        for alert in alerts {
            let readings = self
                .store
                .find_from(sensor_id, alert.started_at, STATUS_WINDOW)
                .await?;

            let [first, second, third] = readings.as_slice() else {
                return Err(AlertError::InvariantViolation(format!(
                    "alert for sensor {} starting {} has {} readings, expected {}",
                    sensor_id,
                    alert.started_at,
                    readings.len(),
                    STATUS_WINDOW
                )));
            };

            summaries.push(AlertSummary {
                start_time: alert.started_at,
                end_time: alert.ended_at,
                measurement1: first.co2_ppm,
                measurement2: second.co2_ppm,
                measurement3: third.co2_ppm,
            });
        }

        debug!(sensor_id, count = summaries.len(), "Listed alerts");
        Ok(summaries)
    }

    /// Metrics over the window ending now
    pub async fn metrics(&self, sensor_id: &str) -> Result<MetricsSummary, AlertError> {
        self.metrics_at(sensor_id, Utc::now()).await
    }

    /// Metrics over `(now - 30 days, ∞)`; zeros if nothing falls inside
    pub async fn metrics_at(
        &self,
        sensor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<MetricsSummary, AlertError> {
        self.ensure_known(sensor_id).await?;

        let cutoff = now - Duration::days(METRICS_WINDOW_DAYS);
        let summary = match self.store.aggregate_since(sensor_id, cutoff).await? {
            Some(agg) => {
                debug!(sensor_id, readings = agg.count, "Aggregated metrics window");
                MetricsSummary {
                    max_last_30_days: agg.max_co2_ppm,
                    avg_last_30_days: agg.avg_co2_ppm,
                }
            }
            None => MetricsSummary {
                max_last_30_days: 0,
                avg_last_30_days: 0.0,
            },
        };

        Ok(summary)
    }

    async fn ensure_known(&self, sensor_id: &str) -> Result<(), AlertError> {
        if self.store.count(sensor_id).await? == 0 {
            return Err(AlertError::NotFound(sensor_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use storage::{Repository, SqliteRepository};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    fn memory_service() -> SensorService {
        SensorService::new(Arc::new(Repository::new()))
    }

    /// Three rising episodes, each followed by three safe readings
    async fn run_episodes(service: &SensorService) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        let mut minute = 0;
        let mut ranges = Vec::new();

        for j in 1..=3 {
            let start = base() + Duration::minutes(minute + 1);
            for i in 1..=3 {
                minute += 1;
                service
                    .ingest("s1", 2000 + i * j, base() + Duration::minutes(minute))
                    .await
                    .unwrap();
            }
            let end = base() + Duration::minutes(minute + 1);
            for i in 1..=3 {
                minute += 1;
                service
                    .ingest("s1", 2000 - i * j, base() + Duration::minutes(minute))
                    .await
                    .unwrap();
            }
            ranges.push((start, end));
        }

        ranges
    }

    async fn assert_episodes(service: &SensorService) {
        let ranges = run_episodes(service).await;
        let alerts = service.alerts("s1").await.unwrap();

        let triples: Vec<[i64; 3]> = alerts
            .iter()
            .map(|a| [a.measurement1, a.measurement2, a.measurement3])
            .collect();
        assert_eq!(
            triples,
            vec![[2001, 2002, 2003], [2002, 2004, 2006], [2003, 2006, 2009]]
        );

        for (alert, (start, end)) in alerts.iter().zip(ranges) {
            assert_eq!(alert.start_time, start);
            assert_eq!(alert.end_time, Some(end));
        }
    }

    #[tokio::test]
    async fn test_alert_episodes_in_memory() {
        assert_episodes(&memory_service()).await;
    }

    #[tokio::test]
    async fn test_alert_episodes_sqlite() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        assert_episodes(&SensorService::new(Arc::new(repo))).await;
    }

    #[tokio::test]
    async fn test_unknown_sensor_is_not_found_everywhere() {
        let service = memory_service();

        assert!(matches!(service.status("x").await, Err(AlertError::NotFound(_))));
        assert!(matches!(service.alerts("x").await, Err(AlertError::NotFound(_))));
        assert!(matches!(service.metrics("x").await, Err(AlertError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_known_sensor_without_alerts() {
        let service = memory_service();
        service.ingest("s1", 2000, base()).await.unwrap();

        assert_eq!(service.status("s1").await.unwrap(), Status::Ok);
        assert!(service.alerts("s1").await.unwrap().is_empty());

        let metrics = service.metrics_at("s1", base()).await.unwrap();
        assert_eq!(metrics.max_last_30_days, 2000);
        assert_eq!(metrics.avg_last_30_days, 2000.0);
    }

    #[tokio::test]
    async fn test_metrics_window_lower_bound() {
        let service = memory_service();
        let now = base();
        let window = Duration::days(METRICS_WINDOW_DAYS);

        service.ingest("s1", 2000, now).await.unwrap();
        service.ingest("s1", 2200, now - window + Duration::seconds(1)).await.unwrap();
        service.ingest("s1", 2300, now - window).await.unwrap();
        service.ingest("s1", 2400, now - window - Duration::seconds(1)).await.unwrap();

        let metrics = service.metrics_at("s1", now).await.unwrap();
        assert_eq!(metrics.max_last_30_days, 2200);
        assert_eq!(metrics.avg_last_30_days, 2100.0);
    }

    #[tokio::test]
    async fn test_metrics_empty_window_is_zero() {
        let service = memory_service();
        service.ingest("s1", 2500, base()).await.unwrap();

        let later = base() + Duration::days(METRICS_WINDOW_DAYS + 1);
        let metrics = service.metrics_at("s1", later).await.unwrap();
        assert_eq!(metrics.max_last_30_days, 0);
        assert_eq!(metrics.avg_last_30_days, 0.0);
    }

    #[tokio::test]
    async fn test_rejects_negative_co2() {
        let service = memory_service();
        let err = service.ingest("s1", -5, base()).await.unwrap_err();

        assert!(matches!(err, AlertError::InvalidMeasurement(_)));
        assert_eq!(service.store().count("s1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_queries_are_idempotent() {
        let service = memory_service();
        for minute in 0..4 {
            service
                .ingest("s1", 2100, base() + Duration::minutes(minute))
                .await
                .unwrap();
        }

        let first = (
            service.status("s1").await.unwrap(),
            service.alerts("s1").await.unwrap(),
            service.metrics_at("s1", base()).await.unwrap(),
        );
        let second = (
            service.status("s1").await.unwrap(),
            service.alerts("s1").await.unwrap(),
            service.metrics_at("s1", base()).await.unwrap(),
        );
        assert_eq!(first, second);
    }

    async fn assert_failed_ingest_leaves_no_trace(service: &SensorService) {
        let at = |minute| base() + Duration::minutes(minute);

        service.ingest("s1", 2500, at(10)).await.unwrap();
        service.ingest("s1", 2500, at(11)).await.unwrap();

        // completes an unsafe window with nothing at or before it to start from
        let err = service.ingest("s1", 2500, at(0)).await.unwrap_err();
        assert!(matches!(err, AlertError::InvariantViolation(_)));

        assert_eq!(service.store().count("s1").await.unwrap(), 2);
        assert_eq!(service.status("s1").await.unwrap(), Status::Warning);
        assert!(service.alerts("s1").await.unwrap().is_empty());

        assert_eq!(service.ingest("s1", 1000, at(12)).await.unwrap(), Transition::Stay);
        assert_eq!(service.status("s1").await.unwrap(), Status::Warning);
    }

    #[tokio::test]
    async fn test_failed_ingest_is_rolled_back_in_memory() {
        assert_failed_ingest_leaves_no_trace(&memory_service()).await;
    }

    #[tokio::test]
    async fn test_failed_ingest_is_rolled_back_sqlite() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        assert_failed_ingest_leaves_no_trace(&SensorService::new(Arc::new(repo))).await;
    }

    #[tokio::test]
    async fn test_timestamps_truncated_to_micros() {
        let memory = memory_service();
        let sqlite = SensorService::new(Arc::new(SqliteRepository::in_memory().await.unwrap()));
        let start = base() + Duration::nanoseconds(123_456_789);

        for service in [&memory, &sqlite] {
            for minute in 0..3 {
                service
                    .ingest("s1", 2500, start + Duration::minutes(minute))
                    .await
                    .unwrap();
            }
        }

        let expected = base() + Duration::microseconds(123_456);
        assert_eq!(memory.alerts("s1").await.unwrap()[0].start_time, expected);
        assert_eq!(memory.alerts("s1").await.unwrap(), sqlite.alerts("s1").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ingest_opens_single_alert() {
        let service = Arc::new(memory_service());
        let t = base();

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move { service.ingest("s1", 2600, t).await })
            })
            .collect();

        let mut opened = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() == Transition::Open {
                opened += 1;
            }
        }

        assert_eq!(opened, 1);
        let alerts = service.store().list_alerts("s1").await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].is_open());
    }
}
