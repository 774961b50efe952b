//! Checkout tracking and leak detection.
//!
//! Every checkout registers a [`ConnectionInfo`] in an in-memory
//! registry; every checkin deregisters it and feeds the rolling average
//! of checkout-hold times. A periodic sweep (run at health-check
//! cadence) flags any still-registered checkout older than the
//! configured threshold. Flags are reported, never force-reclaimed:
//! reclaiming a connection mid-transaction would risk data corruption,
//! so this is a detection-and-alert mechanism only.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Provenance of one in-flight checkout. Lives only in the registry
/// mutex; destroyed on checkin.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Unique lease id assigned at checkout.
    pub id: Uuid,
    /// Wall-clock checkout time (for reports).
    pub checked_out_at: DateTime<Utc>,
    /// Monotonic checkout instant (for age computation).
    pub started: Instant,
    /// Label for the owning caller (thread name or explicit label).
    pub owner: String,
}

impl ConnectionInfo {
    /// Age of this checkout.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.started.elapsed()
    }
}

/// One flagged checkout in the leak summary.
#[derive(Debug, Clone, Serialize)]
pub struct LeakReport {
    /// Lease id of the leaked checkout.
    pub id: Uuid,
    /// Owning caller label.
    pub owner: String,
    /// Wall-clock checkout time.
    pub checked_out_at: DateTime<Utc>,
    /// How long the connection has been held, in milliseconds.
    pub held_for_ms: u64,
}

#[derive(Debug, Default)]
struct LeakState {
    active: HashMap<Uuid, ConnectionInfo>,
    flagged: HashSet<Uuid>,
    completed_checkouts: u64,
    total_held: Duration,
}

/// Mutex-guarded registry of in-flight checkouts.
///
/// Cloning shares the underlying registry; the manager and every session
/// guard hold clones.
#[derive(Debug, Clone)]
pub struct LeakDetector {
    state: Arc<Mutex<LeakState>>,
    enabled: bool,
    threshold: Duration,
}

impl LeakDetector {
    /// Creates a detector. When `enabled` is false, checkouts are not
    /// tracked and sweeps report nothing.
    #[must_use]
    pub fn new(enabled: bool, threshold: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(LeakState::default())),
            enabled,
            threshold,
        }
    }

    /// Registers a checkout and returns its lease id.
    pub fn checkout(&self, owner: &str) -> Option<Uuid> {
        if !self.enabled {
            return None;
        }
        let info = ConnectionInfo {
            id: Uuid::new_v4(),
            checked_out_at: Utc::now(),
            started: Instant::now(),
            owner: owner.to_string(),
        };
        let id = info.id;
        let mut state = self.lock();
        state.active.insert(id, info);
        Some(id)
    }

    /// Deregisters a checkout and records its hold time into the rolling
    /// average.
    pub fn checkin(&self, id: Uuid, held: Duration) {
        let mut state = self.lock();
        if state.active.remove(&id).is_some() {
            state.flagged.remove(&id);
            state.completed_checkouts = state.completed_checkouts.saturating_add(1);
            state.total_held = state.total_held.saturating_add(held);
        }
    }

    /// Flags every in-flight checkout older than the threshold and
    /// returns the current leak summary. Newly flagged checkouts are
    /// logged at WARN once.
    #[must_use]
    pub fn sweep(&self) -> Vec<LeakReport> {
        let mut state = self.lock();
        let mut reports = Vec::new();
        let newly_flagged: Vec<Uuid> = state
            .active
            .values()
            .filter(|info| info.duration() >= self.threshold && !state.flagged.contains(&info.id))
            .map(|info| info.id)
            .collect();
        for id in newly_flagged {
            state.flagged.insert(id);
        }
        for info in state.active.values() {
            if !state.flagged.contains(&info.id) {
                continue;
            }
            let held = info.duration();
            reports.push(LeakReport {
                id: info.id,
                owner: info.owner.clone(),
                checked_out_at: info.checked_out_at,
                held_for_ms: u64::try_from(held.as_millis()).unwrap_or(u64::MAX),
            });
        }
        for report in &reports {
            tracing::warn!(
                lease = %report.id,
                owner = %report.owner,
                held_for_ms = report.held_for_ms,
                "connection held past leak threshold; likely missing release path"
            );
        }
        reports
    }

    /// Number of checkouts currently flagged as leaked.
    #[must_use]
    pub fn leaked_count(&self) -> u64 {
        self.lock().flagged.len() as u64
    }

    /// Rolling average checkout-hold time in milliseconds.
    #[must_use]
    pub fn avg_checkout_time_ms(&self) -> f64 {
        let state = self.lock();
        if state.completed_checkouts == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let avg = state.total_held.as_secs_f64() * 1000.0 / state.completed_checkouts as f64;
        avg
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LeakState> {
        // A poisoned registry would only mean a panicked holder; the
        // bookkeeping itself stays consistent.
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
    fn checkin_clears_registration() {
        let detector = LeakDetector::new(true, Duration::ZERO);
        let Some(id) = detector.checkout("test") else {
            panic!("expected lease id");
        };
        detector.checkin(id, Duration::from_millis(3));
        assert!(detector.sweep().is_empty());
        assert_eq!(detector.leaked_count(), 0);
    }

    #[test]
    fn sweep_flags_only_past_threshold() {
        let detector = LeakDetector::new(true, Duration::from_millis(80));
        let _held = detector.checkout("holder");

        assert!(detector.sweep().is_empty(), "flagged before threshold");

        std::thread::sleep(Duration::from_millis(100));
        let reports = detector.sweep();
        assert_eq!(reports.len(), 1);
        assert_eq!(detector.leaked_count(), 1);
        let Some(report) = reports.first() else {
            panic!("expected a report");
        };
        assert_eq!(report.owner, "holder");
        assert!(report.held_for_ms >= 80);
    }

    #[test]
    fn checkin_unflags_a_leak() {
        let detector = LeakDetector::new(true, Duration::ZERO);
        let Some(id) = detector.checkout("slow") else {
            panic!("expected lease id");
        };
        assert_eq!(detector.sweep().len(), 1);

        detector.checkin(id, Duration::from_millis(50));
        assert_eq!(detector.leaked_count(), 0);
        assert!(detector.sweep().is_empty());
    }

    #[test]
    fn disabled_detector_tracks_nothing() {
        let detector = LeakDetector::new(false, Duration::ZERO);
        assert!(detector.checkout("ignored").is_none());
        assert!(detector.sweep().is_empty());
    }

    #[test]
    fn rolling_average_reflects_hold_times() {
        let detector = LeakDetector::new(true, Duration::from_secs(60));
        for _ in 0..4 {
            let Some(id) = detector.checkout("avg") else {
                panic!("expected lease id");
            };
            detector.checkin(id, Duration::from_millis(10));
        }
        let avg = detector.avg_checkout_time_ms();
        assert!((avg - 10.0).abs() < 0.5, "avg was {avg}");
    }
}
