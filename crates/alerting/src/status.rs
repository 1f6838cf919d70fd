//! Status classification over a sensor's latest readings

use serde::{Deserialize, Serialize};
use std::fmt;
use storage::Measurement;

/// Readings strictly above this level are unsafe
pub const SAFE_CO2_THRESHOLD_PPM: i64 = 2000;

/// Number of most recent readings the status is derived from
pub const STATUS_WINDOW: usize = 3;

/// Air-quality status of a sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "WARN")]
    Warning,
    #[serde(rename = "ALERT")]
    Alert,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Warning => "WARN",
            Status::Alert => "ALERT",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a single reading is above the safe threshold
pub fn is_unsafe(co2_ppm: i64) -> bool {
    co2_ppm > SAFE_CO2_THRESHOLD_PPM
}

/// Classify the newest-first `recent` readings.
///
/// Only the first [`STATUS_WINDOW`] entries are considered. ALERT needs a
/// full window with every reading unsafe, so it cannot be reached with
/// fewer readings. Returns `None` when there are no readings at all.
pub fn classify(recent: &[Measurement]) -> Option<Status> {
    if recent.is_empty() {
        return None;
    }

    let unsafe_count = recent
        .iter()
        .take(STATUS_WINDOW)
        .filter(|m| is_unsafe(m.co2_ppm))
        .count();

    Some(match unsafe_count {
        STATUS_WINDOW => Status::Alert,
        0 => Status::Ok,
        _ => Status::Warning,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use proptest::prelude::*;

    /// Build a newest-first window from oldest-first ppm values
    fn window(oldest_first: &[i64]) -> Vec<Measurement> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        oldest_first
            .iter()
            .enumerate()
            .map(|(i, &co2_ppm)| Measurement {
                seq: i as u64 + 1,
                sensor_id: "s1".to_string(),
                co2_ppm,
                measured_at: base + Duration::minutes(i as i64),
            })
            .rev()
            .collect()
    }

    #[test]
    fn test_empty_is_unknown() {
        assert_eq!(classify(&[]), None);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        assert_eq!(classify(&window(&[2000])), Some(Status::Ok));
        assert_eq!(classify(&window(&[2001])), Some(Status::Warning));
    }

    #[test]
    fn test_alert_needs_full_window() {
        assert_eq!(classify(&window(&[2500, 2500])), Some(Status::Warning));
        assert_eq!(classify(&window(&[2500, 2500, 2500])), Some(Status::Alert));
    }

    #[test]
    fn test_only_latest_three_count() {
        assert_eq!(classify(&window(&[2500, 1000, 1000, 1000])), Some(Status::Ok));
        assert_eq!(classify(&window(&[1000, 2500, 2500, 2500])), Some(Status::Alert));
    }

    #[test]
    fn test_transition_sequence() {
        let readings = [2000, 2001, 2001, 2001];
        let statuses: Vec<Status> = (1..=readings.len())
            .filter_map(|n| classify(&window(&readings[..n])))
            .collect();

        assert_eq!(
            statuses,
            vec![Status::Ok, Status::Warning, Status::Warning, Status::Alert]
        );
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(serde_json::to_string(&Status::Ok).unwrap(), "\"OK\"");
        assert_eq!(serde_json::to_string(&Status::Warning).unwrap(), "\"WARN\"");
        assert_eq!(serde_json::to_string(&Status::Alert).unwrap(), "\"ALERT\"");
        assert_eq!(Status::Warning.to_string(), "WARN");
    }

    proptest! {
        #[test]
        fn prop_status_follows_latest_three(readings in prop::collection::vec(0i64..4000, 1..12)) {
            let latest: Vec<i64> = readings.iter().rev().take(STATUS_WINDOW).copied().collect();
            let above = latest.iter().filter(|&&v| v > SAFE_CO2_THRESHOLD_PPM).count();

            let expected = if above == STATUS_WINDOW {
                Status::Alert
            } else if above > 0 {
                Status::Warning
            } else {
                Status::Ok
            };

            prop_assert_eq!(classify(&window(&readings)), Some(expected));
        }
    }
}
