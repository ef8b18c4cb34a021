//! Per-command request statistics.
//!
//! Each outbound/inbound command name accumulates request/response/error
//! counts and a bounded circular buffer of round-trip durations from which
//! the summary measurements (min/max/avg/median/p95/stddev) are derived.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// How many duration samples are retained per command.
const MEASUREMENT_BUFFER_SIZE: usize = 1024;

/// Summary over the retained duration samples, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimeMeasurements {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub median: f64,
    pub percentile95: f64,
    pub std_dev: f64,
}

/// Statistics for a single command name.
#[derive(Debug, Default)]
pub struct CommandStatistics {
    pub request_count: u64,
    pub response_count: u64,
    pub error_count: u64,
    /// Cumulative total of serialized request sizes in bytes. Recorded as a
    /// running total across every CALL for the command, not a last-seen
    /// value.
    pub message_size_total: u64,
    durations_ms: VecDeque<f64>,
}

impl CommandStatistics {
    fn push_duration(&mut self, duration: Duration) {
        if self.durations_ms.len() == MEASUREMENT_BUFFER_SIZE {
            self.durations_ms.pop_front();
        }
        self.durations_ms.push_back(duration.as_secs_f64() * 1000.0);
    }

    /// Derive the summary measurements from the retained samples.
    pub fn measurements(&self) -> TimeMeasurements {
        if self.durations_ms.is_empty() {
            return TimeMeasurements::default();
        }
        let mut sorted: Vec<f64> = self.durations_ms.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let n = sorted.len();
        let sum: f64 = sorted.iter().sum();
        let avg = sum / n as f64;
        let variance = sorted.iter().map(|d| (d - avg).powi(2)).sum::<f64>() / n as f64;

        TimeMeasurements {
            min: sorted[0],
            max: sorted[n - 1],
            avg,
            median: percentile(&sorted, 0.5),
            percentile95: percentile(&sorted, 0.95),
            std_dev: variance.sqrt(),
        }
    }
}

/// Nearest-rank percentile over an ascending-sorted slice.
fn percentile(sorted: &[f64], rank: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    let idx = ((sorted.len() as f64 * rank).ceil() as usize).clamp(1, sorted.len());
    sorted[idx - 1]
}

/// Registry of per-command statistics for one station.
pub struct StatisticsRegistry {
    enabled: bool,
    commands: Mutex<BTreeMap<String, CommandStatistics>>,
}

impl StatisticsRegistry {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            commands: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn record_request(&self, action: &str, message_size: usize) {
        if !self.enabled {
            return;
        }
        metrics::counter!("ocpp_requests_total", "action" => action.to_string()).increment(1);
        let mut commands = self.commands.lock().unwrap();
        let entry = commands.entry(action.to_string()).or_default();
        entry.request_count += 1;
        entry.message_size_total += message_size as u64;
    }

    pub fn record_response(&self, action: &str, duration: Duration) {
        if !self.enabled {
            return;
        }
        metrics::histogram!("ocpp_request_duration_seconds", "action" => action.to_string())
            .record(duration.as_secs_f64());
        let mut commands = self.commands.lock().unwrap();
        let entry = commands.entry(action.to_string()).or_default();
        entry.response_count += 1;
        entry.push_duration(duration);
    }

    pub fn record_error(&self, action: &str) {
        if !self.enabled {
            return;
        }
        metrics::counter!("ocpp_request_errors_total", "action" => action.to_string())
            .increment(1);
        let mut commands = self.commands.lock().unwrap();
        commands.entry(action.to_string()).or_default().error_count += 1;
    }

    /// Snapshot of (counts, measurements) per command.
    pub fn snapshot(&self) -> BTreeMap<String, (u64, u64, u64, TimeMeasurements)> {
        let commands = self.commands.lock().unwrap();
        commands
            .iter()
            .map(|(action, stats)| {
                (
                    action.clone(),
                    (
                        stats.request_count,
                        stats.response_count,
                        stats.error_count,
                        stats.measurements(),
                    ),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_cumulative_message_size() {
        let registry = StatisticsRegistry::new(true);
        registry.record_request("Heartbeat", 20);
        registry.record_request("Heartbeat", 30);
        registry.record_response("Heartbeat", Duration::from_millis(10));
        registry.record_error("Heartbeat");

        let snapshot = registry.snapshot();
        let (requests, responses, errors, _) = snapshot["Heartbeat"];
        assert_eq!((requests, responses, errors), (2, 1, 1));

        let commands = registry.commands.lock().unwrap();
        assert_eq!(commands["Heartbeat"].message_size_total, 50);
    }

    #[test]
    fn measurements_over_known_series() {
        let mut stats = CommandStatistics::default();
        for ms in [10u64, 20, 30, 40, 50] {
            stats.push_duration(Duration::from_millis(ms));
        }
        let m = stats.measurements();
        assert_eq!(m.min, 10.0);
        assert_eq!(m.max, 50.0);
        assert_eq!(m.avg, 30.0);
        assert_eq!(m.median, 30.0);
        assert_eq!(m.percentile95, 50.0);
        assert!((m.std_dev - 14.142135).abs() < 1e-5);
    }

    #[test]
    fn buffer_is_bounded() {
        let mut stats = CommandStatistics::default();
        for i in 0..(MEASUREMENT_BUFFER_SIZE + 100) {
            stats.push_duration(Duration::from_millis(i as u64));
        }
        assert_eq!(stats.durations_ms.len(), MEASUREMENT_BUFFER_SIZE);
        // oldest samples were evicted
        assert_eq!(stats.measurements().min, 100.0);
    }

    #[test]
    fn disabled_registry_records_nothing() {
        let registry = StatisticsRegistry::new(false);
        registry.record_request("Heartbeat", 20);
        assert!(registry.snapshot().is_empty());
    }
}
