//! Store error types with retryability classification.
//!
//! [`StoreError`] is the central error type for the data layer. Each
//! variant belongs to one of the categories in the error taxonomy:
//! transient connection-level failures (retryable by the caller with
//! backoff), caller mistakes (never retried), and legitimate
//! concurrent-edit conditions (caller decides).

use std::time::Duration;

use uuid::Uuid;

/// Data-layer error enum with retryability classification.
///
/// # Categories
///
/// | Variant | Category | Retryable |
/// |-------------------|---------------------------|-----------|
/// | `PoolExhausted` | Transient resource | yes |
/// | `ConnectionFailure` | Transient connection | yes |
/// | `Validation` | Caller mistake | no |
/// | `NotFound` | Caller mistake | no |
/// | `Conflict` | Concurrent edit | caller decides |
/// | `PersistenceFlush` | Partial batch failure | no (already re-queued once) |
/// | `Serialization` | Caller data | no |
/// | `Database` | Unclassified engine error | no |
/// | `Config` | Startup misconfiguration | no |
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No pooled or overflow connection became available within the
    /// configured pool timeout.
    #[error("connection pool exhausted after {timeout:?}")]
    PoolExhausted {
        /// The acquire timeout that elapsed.
        timeout: Duration,
    },

    /// A connection-level failure (refused, dropped, protocol error).
    /// Feeds health-check failure counting and possible failover.
    #[error("connection failure: {0}")]
    ConnectionFailure(String),

    /// Bad input to a create/update (constraint violation or invalid
    /// field set). Never retried automatically.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No matching, non-deleted row for the given id.
    #[error("{resource} not found: {id}")]
    NotFound {
        /// Entity table the lookup ran against.
        resource: String,
        /// The id that did not match.
        id: Uuid,
    },

    /// Optimistic-concurrency version mismatch on update.
    #[error("version conflict on {resource} {id}: expected {expected}, found {actual}")]
    Conflict {
        /// Entity table the update ran against.
        resource: String,
        /// The row that was concurrently modified.
        id: Uuid,
        /// Version the caller expected.
        expected: i64,
        /// Version currently in the database.
        actual: i64,
    },

    /// A debounced batch flush left entries behind after one re-queue
    /// attempt. Unrelated entries in the batch were still persisted.
    #[error("persistence flush dropped {dropped} entries: {detail}")]
    PersistenceFlush {
        /// Number of entries dropped after the re-queue attempt.
        dropped: usize,
        /// Pass summary plus the `session/key` pairs that were dropped.
        detail: String,
    },

    /// JSON (de)serialization of an entity or widget value failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unclassified database engine error.
    #[error("database error: {0}")]
    Database(String),

    /// Invalid configuration detected at startup.
    #[error("configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// Returns `true` for transient conditions the caller may retry with
    /// backoff. Validation, not-found, and conflict errors represent
    /// caller mistakes or legitimate concurrent edits and are never
    /// retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted { .. } | Self::ConnectionFailure(_)
        )
    }

    /// Builds a [`StoreError::NotFound`] for the given table and id.
    #[must_use]
    pub fn not_found(resource: &str, id: Uuid) -> Self {
        Self::NotFound {
            resource: resource.to_string(),
            id,
        }
    }

    /// Classifies a raw sqlx error, tagging it with the acquire timeout
    /// in effect (used to build a precise [`StoreError::PoolExhausted`]).
    #[must_use]
    pub fn from_sqlx(err: sqlx::Error, acquire_timeout: Duration) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => Self::PoolExhausted {
                timeout: acquire_timeout,
            },
            other => Self::from(other),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => Self::PoolExhausted {
                timeout: Duration::ZERO,
            },
            sqlx::Error::PoolClosed => {
                Self::ConnectionFailure("connection pool is closed".to_string())
            }
            sqlx::Error::Io(e) => Self::ConnectionFailure(e.to_string()),
            sqlx::Error::Tls(e) => Self::ConnectionFailure(e.to_string()),
            sqlx::Error::Protocol(e) => Self::ConnectionFailure(e),
            sqlx::Error::Database(db) => {
                use sqlx::error::ErrorKind;
                match db.kind() {
                    ErrorKind::UniqueViolation
                    | ErrorKind::ForeignKeyViolation
                    | ErrorKind::NotNullViolation
                    | ErrorKind::CheckViolation => Self::Validation(db.to_string()),
                    _ => Self::Database(db.to_string()),
                }
            }
            other => Self::Database(other.to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhausted_is_retryable() {
        let err = StoreError::PoolExhausted {
            timeout: Duration::from_secs(5),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn connection_failure_is_retryable() {
        let err = StoreError::ConnectionFailure("refused".to_string());
        assert!(err.is_retryable());
    }

    #[test]
    fn caller_mistakes_are_not_retryable() {
        let not_found = StoreError::not_found("customers", Uuid::new_v4());
        assert!(!not_found.is_retryable());

        let validation = StoreError::Validation("email required".to_string());
        assert!(!validation.is_retryable());

        let conflict = StoreError::Conflict {
            resource: "customers".to_string(),
            id: Uuid::new_v4(),
            expected: 2,
            actual: 3,
        };
        assert!(!conflict.is_retryable());
    }

    #[test]
    fn pool_timeout_maps_to_pool_exhausted() {
        let err = StoreError::from_sqlx(sqlx::Error::PoolTimedOut, Duration::from_secs(7));
        let StoreError::PoolExhausted { timeout } = err else {
            panic!("expected PoolExhausted");
        };
        assert_eq!(timeout, Duration::from_secs(7));
    }

    #[test]
    fn display_includes_resource_and_id() {
        let id = Uuid::new_v4();
        let err = StoreError::not_found("customers", id);
        let msg = format!("{err}");
        assert!(msg.contains("customers"));
        assert!(msg.contains(&id.to_string()));
    }
}
