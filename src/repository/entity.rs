//! Entity trait, capability descriptors, and the stored-row wrapper.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

/// A domain type that can be persisted through a [`Repository`].
///
/// The payload is stored as a single JSON document; row metadata
/// (id, timestamps, version) lives in dedicated columns and is exposed
/// through [`Stored`].
///
/// [`Repository`]: crate::repository::Repository
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {
    /// Backing table name. Must be a plain SQL identifier.
    const TABLE: &'static str;

    /// Capabilities this entity opts into.
    ///
    /// Defaults to soft deletion and audit logging both enabled.
    #[must_use]
    fn descriptor() -> EntityDescriptor {
        EntityDescriptor::default()
    }
}

/// Declares which optional behaviors an entity's table supports.
///
/// Soft deletion adds a nullable `deleted_at` column and makes
/// `delete` reversible; auditing records every mutation in the shared
/// audit trail within the same transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    /// Whether deletes tombstone the row instead of removing it.
    pub soft_delete: bool,
    /// Whether mutations write audit-log entries.
    pub audited: bool,
}

impl Default for EntityDescriptor {
    fn default() -> Self {
        Self {
            soft_delete: true,
            audited: true,
        }
    }
}

/// A persisted entity together with its row metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stored<T> {
    /// Row identifier, assigned at creation.
    pub id: Uuid,
    /// When the row was first inserted.
    pub created_at: DateTime<Utc>,
    /// When the row was last mutated.
    pub updated_at: DateTime<Utc>,
    /// Tombstone timestamp for soft-deleted rows.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency version, starts at 1.
    pub version: i64,
    /// The domain payload.
    #[serde(flatten)]
    pub data: T,
}

impl<T> Stored<T> {
    /// Whether this row has been soft-deleted.
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Raw entity row as it comes off the wire, before the JSON document is
/// decoded into a concrete type. Cached in this form so one cache can
/// serve any entity type.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct RawRow {
    pub id: String,
    pub data: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl RawRow {
    pub(crate) fn into_stored<T: Entity>(self) -> Result<Stored<T>, StoreError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| StoreError::Database(format!("malformed row id {:?}: {e}", self.id)))?;
        let data: T = serde_json::from_str(&self.data)?;
        Ok(Stored {
            id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
            version: self.version,
            data,
        })
    }
}
