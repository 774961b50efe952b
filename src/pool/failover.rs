//! Failover targets and switchover state.
//!
//! [`FailoverManager`] owns the ordered target list (primary + replicas)
//! and the current switchover state, including the exponential-backoff
//! schedule for primary restoration. Actual pool rebuilding is performed
//! by the connection manager; this type decides *which* target to try
//! and *when* to re-probe the primary, and never touches another
//! subsystem's state.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Connection;
use sqlx::sqlite::SqliteConnection;

use crate::StoreError;
use crate::pool::manager::connect_options;

/// Role of a connection target within the ordered target list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetRole {
    /// The preferred target; restoration probes steer back to it.
    Primary,
    /// A fallback target, tried in priority order.
    Replica,
}

/// One candidate connection target.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionTarget {
    /// Primary or replica.
    pub role: TargetRole,
    /// Database URL.
    pub url: String,
    /// Lower value = tried earlier. The primary is always priority 0.
    pub priority: u32,
}

/// Current switchover state, as reported by `health_status()`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FailoverState {
    /// Connected to the primary target.
    OnPrimary,
    /// Failed over to a replica; restoration probes are running.
    FailedOver {
        /// URL of the currently active replica.
        target_url: String,
        /// When the switch happened.
        since: DateTime<Utc>,
        /// Primary-restoration probes attempted so far.
        restore_attempts: u32,
    },
}

#[derive(Debug)]
struct SwitchState {
    state: FailoverState,
    active_url: String,
    next_restore_at: Option<Instant>,
}

/// Ordered target list plus switchover bookkeeping.
#[derive(Debug)]
pub struct FailoverManager {
    targets: Vec<ConnectionTarget>,
    retry_attempts: u32,
    retry_delay: Duration,
    switch: Mutex<SwitchState>,
}

impl FailoverManager {
    /// Builds the target list: the primary at priority 0, replicas in
    /// the order given at priorities 1..
    #[must_use]
    pub fn new(
        primary_url: &str,
        replica_urls: &[String],
        retry_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        let mut targets = vec![ConnectionTarget {
            role: TargetRole::Primary,
            url: primary_url.to_string(),
            priority: 0,
        }];
        for (i, url) in replica_urls.iter().enumerate() {
            targets.push(ConnectionTarget {
                role: TargetRole::Replica,
                url: url.clone(),
                priority: u32::try_from(i).unwrap_or(u32::MAX).saturating_add(1),
            });
        }
        Self {
            targets,
            retry_attempts,
            retry_delay,
            switch: Mutex::new(SwitchState {
                state: FailoverState::OnPrimary,
                active_url: primary_url.to_string(),
                next_restore_at: None,
            }),
        }
    }

    /// The ordered target list.
    #[must_use]
    pub fn targets(&self) -> &[ConnectionTarget] {
        &self.targets
    }

    /// URL of the currently active target.
    #[must_use]
    pub fn active_url(&self) -> String {
        self.lock().active_url.clone()
    }

    /// URL of the primary target.
    #[must_use]
    pub fn primary_url(&self) -> String {
        self.targets
            .iter()
            .find(|t| t.role == TargetRole::Primary)
            .map(|t| t.url.clone())
            .unwrap_or_default()
    }

    /// Current switchover state.
    #[must_use]
    pub fn state(&self) -> FailoverState {
        self.lock().state.clone()
    }

    /// Candidates to try on failover: every target except the currently
    /// active one, in priority order.
    #[must_use]
    pub fn candidates(&self) -> Vec<ConnectionTarget> {
        let active = self.active_url();
        let mut candidates: Vec<ConnectionTarget> = self
            .targets
            .iter()
            .filter(|t| t.url != active)
            .cloned()
            .collect();
        candidates.sort_by_key(|t| t.priority);
        candidates
    }

    /// Records a switch to the given target and arms the restoration
    /// schedule when the new target is not the primary.
    pub fn mark_switched(&self, target: &ConnectionTarget) {
        let mut switch = self.lock();
        switch.active_url = target.url.clone();
        if target.role == TargetRole::Primary {
            switch.state = FailoverState::OnPrimary;
            switch.next_restore_at = None;
        } else {
            switch.state = FailoverState::FailedOver {
                target_url: target.url.clone(),
                since: Utc::now(),
                restore_attempts: 0,
            };
            switch.next_restore_at = Some(Instant::now() + self.retry_delay);
        }
    }

    /// `true` when a primary-restoration probe is due.
    #[must_use]
    pub fn restore_due(&self) -> bool {
        let switch = self.lock();
        matches!(switch.state, FailoverState::FailedOver { .. })
            && switch.next_restore_at.is_some_and(|at| Instant::now() >= at)
    }

    /// Records a failed restoration probe, pushing the next probe out by
    /// `retry_delay * 2^attempts` (exponent capped). The attempt counter
    /// wraps back to zero once `retry_attempts` probes have failed, which
    /// restarts the backoff cycle rather than giving up on the primary.
    pub fn note_restore_failure(&self) {
        let mut switch = self.lock();
        let FailoverState::FailedOver {
            ref mut restore_attempts,
            ..
        } = switch.state
        else {
            return;
        };
        *restore_attempts = restore_attempts.saturating_add(1);
        if *restore_attempts >= self.retry_attempts {
            *restore_attempts = 0;
        }
        let exponent = (*restore_attempts).min(6);
        let delay = self
            .retry_delay
            .saturating_mul(2_u32.saturating_pow(exponent));
        switch.next_restore_at = Some(Instant::now() + delay);
    }

    /// Validates a target with a pre-ping: open one connection, run a
    /// trivial round-trip, close.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ConnectionFailure`] if the target cannot be
    /// reached or does not answer within `timeout`.
    pub async fn probe(url: &str, timeout: Duration) -> Result<(), StoreError> {
        let options = connect_options(url)?;
        let ping = async {
            let mut conn = SqliteConnection::connect_with(&options)
                .await
                .map_err(|e| StoreError::ConnectionFailure(e.to_string()))?;
            sqlx::query("SELECT 1")
                .execute(&mut conn)
                .await
                .map_err(|e| StoreError::ConnectionFailure(e.to_string()))?;
            conn.close()
                .await
                .map_err(|e| StoreError::ConnectionFailure(e.to_string()))?;
            Ok(())
        };
        tokio::time::timeout(timeout, ping)
            .await
            .map_err(|_| StoreError::ConnectionFailure(format!("pre-ping of {url} timed out")))?
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SwitchState> {
        self.switch
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
