//! Connection supervision: pooling, leak detection, health monitoring,
//! and failover.
//!
//! [`ConnectionManager`] composes the sqlx connection pool with three
//! observers ([`LeakDetector`], [`HealthMonitor`], and
//! [`FailoverManager`]) and exposes scoped-session acquisition plus an
//! aggregate health report. The observers run inside one cancellable
//! background task; each keeps its own state behind its own lock and
//! never mutates another subsystem directly.

pub mod failover;
pub mod health;
pub mod leak;
pub mod manager;
pub mod metrics;
pub mod session;

pub use failover::{ConnectionTarget, FailoverManager, FailoverState, TargetRole};
pub use health::{HealthCheckResult, HealthMonitor};
pub use leak::{LeakDetector, LeakReport};
pub use manager::{ConnectionManager, HealthStatus};
pub use metrics::PoolMetrics;
pub use session::{ScopedSession, ScopedTransaction};
