//! Connection manager: pool lifecycle, supervision, and failover
//! execution.
//!
//! [`ConnectionManager`] owns the sqlx pool exclusively. Repositories
//! and the persistence engine borrow sessions from it for the lifetime
//! of one logical operation and release them on every exit path. One
//! background task runs the health probe, the leak sweep, failover
//! evaluation, and primary restoration; it is stopped cooperatively by
//! [`ConnectionManager::dispose`].

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;

use crate::StoreError;
use crate::config::StoreConfig;
use crate::pool::failover::{ConnectionTarget, FailoverManager, FailoverState, TargetRole};
use crate::pool::health::{HealthCheckResult, HealthMonitor};
use crate::pool::leak::{LeakDetector, LeakReport};
use crate::pool::metrics::PoolMetrics;
use crate::pool::session::{Lease, ScopedSession, ScopedTransaction};

/// Aggregate health report for dashboards and health-check endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// `true` when the most recent probe succeeded (or none ran yet).
    pub healthy: bool,
    /// Current pool occupancy and lifetime counters.
    pub pool: PoolMetrics,
    /// Timestamp of the most recent probe.
    pub last_check: Option<DateTime<Utc>>,
    /// Fraction of retained probes that succeeded.
    pub success_rate: f64,
    /// Mean probe latency over the retained history, in milliseconds.
    pub avg_response_time_ms: f64,
    /// Current failover state.
    pub failover: FailoverState,
    /// Checkouts currently flagged as leaked.
    pub leaks: Vec<LeakReport>,
}

#[derive(Debug)]
struct ManagerInner {
    config: StoreConfig,
    pool: RwLock<SqlitePool>,
    leak: LeakDetector,
    health: HealthMonitor,
    failover: FailoverManager,
    total_checkouts: AtomicU64,
    failed_checkouts: AtomicU64,
    total_created: Arc<AtomicU64>,
}

/// Composes the connection pool with leak detection, health monitoring,
/// and failover. Construct once at process start and pass by reference
/// to repositories and engines; there is no global registry.
#[derive(Debug)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
    shutdown: watch::Sender<bool>,
    monitor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Connects to the primary target, runs the core-schema migrations,
    /// and spawns the supervision task when health checks are enabled.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] on an invalid URL,
    /// [`StoreError::ConnectionFailure`] if the primary is unreachable,
    /// or a classified [`StoreError`] if migrations fail.
    pub async fn connect(config: StoreConfig) -> Result<Self, StoreError> {
        let total_created = Arc::new(AtomicU64::new(0));
        let options = connect_options(&config.database_url)?;
        let pool = build_pool(&config, options, &total_created).await?;

        crate::schema::MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let failover = FailoverManager::new(
            &config.database_url,
            &config.failover_urls,
            config.failover_retry_attempts,
            config.failover_retry_delay,
        );
        let leak = LeakDetector::new(config.leak_detection_enabled, config.leak_threshold);

        let inner = Arc::new(ManagerInner {
            config,
            pool: RwLock::new(pool),
            leak,
            health: HealthMonitor::new(),
            failover,
            total_checkouts: AtomicU64::new(0),
            failed_checkouts: AtomicU64::new(0),
            total_created,
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let monitor = if inner.config.health_check_enabled {
            Some(tokio::spawn(monitor_loop(Arc::clone(&inner), shutdown_rx)))
        } else {
            None
        };

        tracing::info!(
            url = %inner.failover.active_url(),
            pool_size = inner.config.pool_size,
            max_overflow = inner.config.max_overflow,
            "connection manager ready"
        );
        Ok(Self {
            inner,
            shutdown,
            monitor: std::sync::Mutex::new(monitor),
        })
    }

    /// Checks out a connection, blocking up to `pool_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::PoolExhausted`] when no connection becomes
    /// available in time, or [`StoreError::ConnectionFailure`] when the
    /// active target cannot produce a valid connection.
    pub async fn acquire_session(&self) -> Result<ScopedSession, StoreError> {
        let owner = std::thread::current()
            .name()
            .unwrap_or("unnamed")
            .to_string();
        self.acquire_session_labeled(&owner).await
    }

    /// [`ConnectionManager::acquire_session`] with an explicit owner
    /// label recorded in the leak registry.
    ///
    /// # Errors
    ///
    /// Same as [`ConnectionManager::acquire_session`].
    pub async fn acquire_session_labeled(&self, owner: &str) -> Result<ScopedSession, StoreError> {
        let pool = self.current_pool().await;
        self.inner.total_checkouts.fetch_add(1, Ordering::Relaxed);
        match pool.acquire().await {
            Ok(conn) => {
                let lease = Lease::begin(&self.inner.leak, owner);
                Ok(ScopedSession::new(conn, lease))
            }
            Err(e) => {
                self.inner.failed_checkouts.fetch_add(1, Ordering::Relaxed);
                Err(StoreError::from_sqlx(e, self.inner.config.pool_timeout))
            }
        }
    }

    /// Begins a transaction-scoped session: commit on success, rollback
    /// on error or drop, connection released in all cases.
    ///
    /// # Errors
    ///
    /// Same as [`ConnectionManager::acquire_session`].
    pub async fn begin(&self) -> Result<ScopedTransaction, StoreError> {
        let owner = std::thread::current()
            .name()
            .unwrap_or("unnamed")
            .to_string();
        let pool = self.current_pool().await;
        self.inner.total_checkouts.fetch_add(1, Ordering::Relaxed);
        match pool.begin().await {
            Ok(tx) => {
                let lease = Lease::begin(&self.inner.leak, &owner);
                Ok(ScopedTransaction::new(tx, lease))
            }
            Err(e) => {
                self.inner.failed_checkouts.fetch_add(1, Ordering::Relaxed);
                Err(StoreError::from_sqlx(e, self.inner.config.pool_timeout))
            }
        }
    }

    /// Point-in-time pool metrics.
    pub async fn metrics(&self) -> PoolMetrics {
        let pool = self.current_pool().await;
        let size = pool.size();
        let checked_in = u32::try_from(pool.num_idle()).unwrap_or(u32::MAX);
        let checked_out = size.saturating_sub(checked_in);
        PoolMetrics {
            size,
            checked_in,
            checked_out,
            overflow: checked_out.saturating_sub(self.inner.config.pool_size),
            total_checkouts: self.inner.total_checkouts.load(Ordering::Relaxed),
            total_created: self.inner.total_created.load(Ordering::Relaxed),
            leaked_count: self.inner.leak.leaked_count(),
            failed_checkouts: self.inner.failed_checkouts.load(Ordering::Relaxed),
            avg_checkout_time_ms: self.inner.leak.avg_checkout_time_ms(),
        }
    }

    /// Aggregate health report: probe history summary, pool metrics,
    /// failover state, and a fresh leak sweep.
    pub async fn health_status(&self) -> HealthStatus {
        let leaks = if self.inner.config.leak_detection_enabled {
            self.inner.leak.sweep()
        } else {
            Vec::new()
        };
        HealthStatus {
            healthy: self.inner.health.healthy(),
            pool: self.metrics().await,
            last_check: self.inner.health.last_check(),
            success_rate: self.inner.health.success_rate(),
            avg_response_time_ms: self.inner.health.avg_response_time_ms(),
            failover: self.inner.failover.state(),
            leaks,
        }
    }

    /// The configuration this manager was built with.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Stops the supervision task cooperatively, then drains and closes
    /// all pooled connections. Used on shutdown/reconfiguration.
    pub async fn dispose(&self) {
        let _ = self.shutdown.send(true);
        let handle = self
            .monitor
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.current_pool().await.close().await;
        tracing::info!("connection manager disposed");
    }

    /// Clone of the currently active pool handle.
    pub(crate) async fn current_pool(&self) -> SqlitePool {
        self.inner.pool.read().await.clone()
    }

    #[cfg(test)]
    pub(crate) fn inner_for_test(&self) -> &Arc<ManagerInner> {
        &self.inner
    }
}

impl ManagerInner {
    /// One supervision cycle: probe, record, sweep, and evaluate
    /// failover or restoration.
    async fn run_cycle(self: &Arc<Self>) {
        let result = self.probe_active().await;
        let failures = self.health.record(result);

        if self.config.leak_detection_enabled {
            let _ = self.leak.sweep();
        }

        if !self.config.failover_enabled {
            return;
        }
        if failures >= self.config.failover_after_failures {
            self.trigger_failover("consecutive health-check failures")
                .await;
        } else if self.failover.restore_due() {
            self.attempt_primary_restore().await;
        }
    }

    /// Runs `SELECT 1` through a borrowed connection under the probe
    /// timeout. The probe timeout is independent of `pool_timeout` so a
    /// slow (but live) database does not falsely trigger failover.
    async fn probe_active(&self) -> HealthCheckResult {
        let pool = self.pool.read().await.clone();
        let start = Instant::now();
        let ping = async {
            let mut conn = pool.acquire().await?;
            sqlx::query("SELECT 1").execute(&mut *conn).await?;
            Ok::<(), sqlx::Error>(())
        };
        match tokio::time::timeout(self.config.health_check_timeout, ping).await {
            Ok(Ok(())) => HealthCheckResult::ok(start.elapsed()),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "health probe failed");
                HealthCheckResult::failed(start.elapsed(), e.to_string())
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = u64::try_from(self.config.health_check_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                    "health probe timed out"
                );
                HealthCheckResult::failed(start.elapsed(), "probe timed out")
            }
        }
    }

    /// Tries each candidate in priority order; the first that passes the
    /// pre-ping becomes active. In-flight sessions keep their original
    /// connections and drain naturally.
    async fn trigger_failover(self: &Arc<Self>, reason: &str) {
        tracing::warn!(reason, "evaluating failover candidates");
        for candidate in self.failover.candidates() {
            if let Err(e) =
                FailoverManager::probe(&candidate.url, self.config.health_check_timeout).await
            {
                tracing::warn!(url = %candidate.url, error = %e, "candidate failed pre-ping");
                continue;
            }
            match self.swap_pool(&candidate.url).await {
                Ok(()) => {
                    self.failover.mark_switched(&candidate);
                    self.health.reset_failures();
                    tracing::warn!(url = %candidate.url, role = ?candidate.role, "failover switch complete");
                    return;
                }
                Err(e) => {
                    tracing::error!(url = %candidate.url, error = %e, "pool rebuild failed");
                }
            }
        }
        tracing::error!("no healthy failover candidate available");
    }

    /// Re-probes the original primary and switches back once healthy.
    async fn attempt_primary_restore(self: &Arc<Self>) {
        let primary_url = self.failover.primary_url();
        match FailoverManager::probe(&primary_url, self.config.health_check_timeout).await {
            Ok(()) => match self.swap_pool(&primary_url).await {
                Ok(()) => {
                    let primary = ConnectionTarget {
                        role: TargetRole::Primary,
                        url: primary_url.clone(),
                        priority: 0,
                    };
                    self.failover.mark_switched(&primary);
                    self.health.reset_failures();
                    tracing::info!(url = %primary_url, "primary restored");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "primary restore pool rebuild failed");
                    self.failover.note_restore_failure();
                }
            },
            Err(e) => {
                tracing::debug!(error = %e, "primary still unhealthy");
                self.failover.note_restore_failure();
            }
        }
    }

    /// Builds a pool against `url` and swaps it in under the write lock.
    /// New checkouts wait for the swap; the old pool drains in the
    /// background.
    async fn swap_pool(&self, url: &str) -> Result<(), StoreError> {
        let options = connect_options(url)?;
        let new_pool = build_pool(&self.config, options, &self.total_created).await?;
        let mut guard = self.pool.write().await;
        let old = std::mem::replace(&mut *guard, new_pool);
        drop(guard);
        tokio::spawn(async move {
            old.close().await;
        });
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn replace_pool_for_test(&self, pool: SqlitePool) {
        let mut guard = self.pool.write().await;
        *guard = pool;
    }
}

/// Supervision loop: one cycle per `health_check_interval`, stopped
/// cooperatively through the watch channel.
async fn monitor_loop(inner: Arc<ManagerInner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(inner.config.health_check_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::debug!("supervision task stopping");
                break;
            }
            _ = ticker.tick() => {}
        }
        inner.run_cycle().await;
    }
}

/// Parses a database URL into connect options with the standing pragmas
/// (busy timeout, foreign keys, WAL for file-backed databases).
pub(crate) fn connect_options(url: &str) -> Result<SqliteConnectOptions, StoreError> {
    let mut options = SqliteConnectOptions::from_str(url)
        .map_err(|e| StoreError::Config(format!("invalid database url {url}: {e}")))?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);
    // WAL is meaningless for in-memory databases.
    let in_memory = url.contains(":memory:") || url.contains("mode=memory");
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }
    Ok(options)
}

/// Builds a pool with the configured sizing, recycle, and pre-ping
/// policy. `min_connections(1)` keeps shared-cache in-memory databases
/// alive for the lifetime of the pool.
async fn build_pool(
    config: &StoreConfig,
    options: SqliteConnectOptions,
    total_created: &Arc<AtomicU64>,
) -> Result<SqlitePool, StoreError> {
    let counter = Arc::clone(total_created);
    SqlitePoolOptions::new()
        .max_connections(config.max_connections())
        .min_connections(1)
        .acquire_timeout(config.pool_timeout)
        .max_lifetime(Some(config.pool_recycle))
        .test_before_acquire(config.pool_pre_ping)
        .after_connect(move |_conn, _meta| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
        })
        .connect_with(options)
        .await
        .map_err(|e| StoreError::ConnectionFailure(e.to_string()))
}
