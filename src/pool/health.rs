//! Health-check history and failure counting.
//!
//! [`HealthMonitor`] holds the bounded ring buffer of probe results and
//! the consecutive-failure counter that drives failover evaluation. The
//! probe itself (a `SELECT 1` through a borrowed connection) is executed
//! by the manager's background task; this type only records outcomes, so
//! it is fully unit-testable without a database.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Maximum retained probe results. Oldest entries are evicted first.
pub const HISTORY_CAP: usize = 100;

/// Outcome of one health probe.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    /// Whether the probe round-trip succeeded.
    pub healthy: bool,
    /// Probe latency in milliseconds.
    pub response_time_ms: u64,
    /// Error message on failure.
    pub error: Option<String>,
    /// When the probe completed.
    pub timestamp: DateTime<Utc>,
}

impl HealthCheckResult {
    /// Builds a successful result with the given latency.
    #[must_use]
    pub fn ok(latency: Duration) -> Self {
        Self {
            healthy: true,
            response_time_ms: u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Builds a failed result with the given latency and error message.
    #[must_use]
    pub fn failed(latency: Duration, error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            response_time_ms: u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
struct HealthState {
    history: VecDeque<HealthCheckResult>,
    consecutive_failures: u32,
    last_check: Option<DateTime<Utc>>,
}

/// Mutex-guarded probe history with FIFO eviction at [`HISTORY_CAP`].
#[derive(Debug, Default)]
pub struct HealthMonitor {
    state: Mutex<HealthState>,
}

impl HealthMonitor {
    /// Creates an empty monitor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a probe result and returns the updated consecutive-failure
    /// count (zero after any success).
    pub fn record(&self, result: HealthCheckResult) -> u32 {
        let mut state = self.lock();
        if result.healthy {
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        }
        state.last_check = Some(result.timestamp);
        state.history.push_back(result);
        while state.history.len() > HISTORY_CAP {
            state.history.pop_front();
        }
        state.consecutive_failures
    }

    /// Resets the consecutive-failure counter (after a failover switch).
    pub fn reset_failures(&self) {
        self.lock().consecutive_failures = 0;
    }

    /// `true` when the most recent probe succeeded. An unprobed monitor
    /// reports healthy.
    #[must_use]
    pub fn healthy(&self) -> bool {
        self.lock().history.back().is_none_or(|r| r.healthy)
    }

    /// Current consecutive-failure count.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Timestamp of the most recent probe.
    #[must_use]
    pub fn last_check(&self) -> Option<DateTime<Utc>> {
        self.lock().last_check
    }

    /// Fraction of retained probes that succeeded, in `[0, 1]`. Returns
    /// 1.0 for an unprobed monitor.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let state = self.lock();
        if state.history.is_empty() {
            return 1.0;
        }
        let ok = state.history.iter().filter(|r| r.healthy).count();
        #[allow(clippy::cast_precision_loss)]
        let rate = ok as f64 / state.history.len() as f64;
        rate
    }

    /// Mean latency over retained probes, in milliseconds.
    #[must_use]
    pub fn avg_response_time_ms(&self) -> f64 {
        let state = self.lock();
        if state.history.is_empty() {
            return 0.0;
        }
        let total: u64 = state
            .history
            .iter()
            .map(|r| r.response_time_ms)
            .fold(0, u64::saturating_add);
        #[allow(clippy::cast_precision_loss)]
        let avg = total as f64 / state.history.len() as f64;
        avg
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HealthState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn failures_count_consecutively_and_reset_on_success() {
        let monitor = HealthMonitor::new();
        assert_eq!(
            monitor.record(HealthCheckResult::failed(Duration::from_millis(5), "down")),
            1
        );
        assert_eq!(
            monitor.record(HealthCheckResult::failed(Duration::from_millis(5), "down")),
            2
        );
        assert!(!monitor.healthy());

        assert_eq!(monitor.record(HealthCheckResult::ok(Duration::from_millis(1))), 0);
        assert!(monitor.healthy());
        assert_eq!(monitor.consecutive_failures(), 0);
    }

    #[test]
    fn history_is_bounded_fifo() {
        let monitor = HealthMonitor::new();
        for _ in 0..HISTORY_CAP {
            let _ = monitor.record(HealthCheckResult::failed(Duration::ZERO, "old"));
        }
        let _ = monitor.record(HealthCheckResult::ok(Duration::ZERO));

        // 100 entries retained: 99 failures + the final success.
        let expected = (HISTORY_CAP as f64 - 1.0) / HISTORY_CAP as f64;
        let failure_rate = 1.0 - monitor.success_rate();
        assert!((failure_rate - expected).abs() < 1e-9);
    }

    #[test]
    fn unprobed_monitor_is_healthy() {
        let monitor = HealthMonitor::new();
        assert!(monitor.healthy());
        assert!(monitor.last_check().is_none());
        assert!((monitor.success_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn avg_latency_reflects_recorded_probes() {
        let monitor = HealthMonitor::new();
        let _ = monitor.record(HealthCheckResult::ok(Duration::from_millis(10)));
        let _ = monitor.record(HealthCheckResult::ok(Duration::from_millis(30)));
        let avg = monitor.avg_response_time_ms();
        assert!((avg - 20.0).abs() < f64::EPSILON, "avg was {avg}");
    }
}
