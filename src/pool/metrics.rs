//! Point-in-time pool occupancy snapshot.

use serde::Serialize;

/// Snapshot of pool occupancy and lifetime counters.
///
/// Recomputed on demand from the live sqlx pool, the checkout counters,
/// and the leak registry. Never stored independently.
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    /// Connections currently open (idle + checked out).
    pub size: u32,
    /// Connections idle in the pool.
    pub checked_in: u32,
    /// Connections currently checked out.
    pub checked_out: u32,
    /// Checked-out connections beyond the base pool size (transient
    /// overflow capacity in use).
    pub overflow: u32,
    /// Lifetime checkout attempts.
    pub total_checkouts: u64,
    /// Lifetime physical connections created.
    pub total_created: u64,
    /// Checkouts currently flagged as leaked.
    pub leaked_count: u64,
    /// Lifetime checkout attempts that failed (timeout or connect error).
    pub failed_checkouts: u64,
    /// Rolling average checkout-hold time in milliseconds.
    pub avg_checkout_time_ms: f64,
}
