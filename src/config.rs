//! Data-layer configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`). The layer is constructed once at
//! process start from a [`StoreConfig`] and passed by reference to every
//! component; there is no global registry.

use std::time::Duration;

/// Top-level data-layer configuration.
///
/// Loaded once at startup via [`StoreConfig::from_env`], or built
/// directly in tests.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Primary database URL (e.g. `sqlite://data/app.db`).
    pub database_url: String,

    /// Base number of pooled connections.
    pub pool_size: u32,

    /// Additional transient connections allowed beyond `pool_size`.
    pub max_overflow: u32,

    /// Maximum wait for a connection checkout before `PoolExhausted`.
    pub pool_timeout: Duration,

    /// Maximum connection lifetime before forced replacement, guarding
    /// against server-side idle timeouts.
    pub pool_recycle: Duration,

    /// Validate a connection with a trivial round-trip before handing it
    /// to a caller, transparently replacing dead connections.
    pub pool_pre_ping: bool,

    /// Master switch for checkout tracking and leak sweeps.
    pub leak_detection_enabled: bool,

    /// A connection held longer than this is flagged as leaked.
    pub leak_threshold: Duration,

    /// Master switch for the background health monitor.
    pub health_check_enabled: bool,

    /// Interval between health probes (also the leak-sweep cadence).
    pub health_check_interval: Duration,

    /// Independent timeout for a single health probe, shorter than
    /// `pool_timeout` so a slow database does not falsely trigger
    /// failover.
    pub health_check_timeout: Duration,

    /// Consecutive probe failures before failover evaluation.
    pub failover_after_failures: u32,

    /// Master switch for failover.
    pub failover_enabled: bool,

    /// Ordered replica URLs, highest priority first.
    pub failover_urls: Vec<String>,

    /// Primary-restoration probe attempts per backoff cycle.
    pub failover_retry_attempts: u32,

    /// Initial delay between restoration probes; doubles per failed
    /// attempt.
    pub failover_retry_delay: Duration,

    /// Quiet period after the last write to a key before it is flushed.
    pub debounce: Duration,

    /// Pending-entry count that forces an immediate full flush.
    pub batch_size: usize,

    /// Maximum age of the oldest unflushed entry before a forced full
    /// flush, regardless of per-key debounce state.
    pub batch_timeout: Duration,
}

impl StoreConfig {
    /// Loads configuration from environment variables.
    ///
    /// Falls back to sensible defaults when a variable is not set.
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StoreError::Config`] if `DATABASE_URL` is unset,
    /// or if a numeric setting is zero where zero is meaningless
    /// (`POOL_SIZE`, `BATCH_SIZE`).
    pub fn from_env() -> Result<Self, crate::StoreError> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| crate::StoreError::Config("DATABASE_URL must be set".to_string()))?;

        let failover_urls: Vec<String> = std::env::var("FAILOVER_URLS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect();

        let config = Self {
            database_url,
            pool_size: parse_env("POOL_SIZE", 5),
            max_overflow: parse_env("MAX_OVERFLOW", 5),
            pool_timeout: Duration::from_secs(parse_env("POOL_TIMEOUT_SECS", 30)),
            pool_recycle: Duration::from_secs(parse_env("POOL_RECYCLE_SECS", 1800)),
            pool_pre_ping: parse_env_bool("POOL_PRE_PING", true),
            leak_detection_enabled: parse_env_bool("LEAK_DETECTION_ENABLED", true),
            leak_threshold: Duration::from_secs(parse_env("LEAK_THRESHOLD_SECS", 60)),
            health_check_enabled: parse_env_bool("HEALTH_CHECK_ENABLED", true),
            health_check_interval: Duration::from_millis(parse_env(
                "HEALTH_CHECK_INTERVAL_MS",
                10_000,
            )),
            health_check_timeout: Duration::from_millis(parse_env("HEALTH_CHECK_TIMEOUT_MS", 2000)),
            failover_after_failures: parse_env("FAILOVER_AFTER_FAILURES", 3),
            failover_enabled: parse_env_bool("FAILOVER_ENABLED", true),
            failover_urls,
            failover_retry_attempts: parse_env("FAILOVER_RETRY_ATTEMPTS", 5),
            failover_retry_delay: Duration::from_millis(parse_env(
                "FAILOVER_RETRY_DELAY_MS",
                1000,
            )),
            debounce: Duration::from_millis(parse_env("DEBOUNCE_MS", 500)),
            batch_size: parse_env("BATCH_SIZE", 50),
            batch_timeout: Duration::from_millis(parse_env("BATCH_TIMEOUT_MS", 5000)),
        };
        config.validate()?;
        Ok(config)
    }

    /// Builds a configuration with defaults for the given URL. Used by
    /// tests and embedded single-node deployments.
    #[must_use]
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            database_url: url.into(),
            pool_size: 5,
            max_overflow: 5,
            pool_timeout: Duration::from_secs(30),
            pool_recycle: Duration::from_secs(1800),
            pool_pre_ping: true,
            leak_detection_enabled: true,
            leak_threshold: Duration::from_secs(60),
            health_check_enabled: true,
            health_check_interval: Duration::from_secs(10),
            health_check_timeout: Duration::from_secs(2),
            failover_after_failures: 3,
            failover_enabled: true,
            failover_urls: Vec::new(),
            failover_retry_attempts: 5,
            failover_retry_delay: Duration::from_secs(1),
            debounce: Duration::from_millis(500),
            batch_size: 50,
            batch_timeout: Duration::from_secs(5),
        }
    }

    /// Total connection capacity: base pool plus overflow.
    #[must_use]
    pub const fn max_connections(&self) -> u32 {
        self.pool_size.saturating_add(self.max_overflow)
    }

    fn validate(&self) -> Result<(), crate::StoreError> {
        if self.pool_size == 0 {
            return Err(crate::StoreError::Config(
                "POOL_SIZE must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(crate::StoreError::Config(
                "BATCH_SIZE must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parses an environment variable as `T`, returning `default` on missing
/// or invalid values.
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parses an environment variable as a boolean. Accepts `"true"`, `"1"`,
/// `"false"`, `"0"` (case-insensitive). Returns `default` otherwise.
fn parse_env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key).ok().as_deref() {
        Some("true") | Some("TRUE") | Some("1") => true,
        Some("false") | Some("FALSE") | Some("0") => false,
        _ => default,
    }
}
