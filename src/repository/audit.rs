//! Append-only audit trail written in the same transaction as the
//! mutation it records.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{Sqlite, Transaction};
use uuid::Uuid;

use crate::error::StoreError;
use crate::pool::ConnectionManager;

/// Kind of mutation an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    /// Single-row insert.
    Create,
    /// Single-row patch.
    Update,
    /// Hard delete of a single row.
    Delete,
    /// Tombstoning of a single row.
    SoftDelete,
    /// Un-tombstoning of a single row.
    Restore,
    /// Batched insert, recorded as one aggregate entry.
    BulkCreate,
    /// Batched patch, recorded as one aggregate entry.
    BulkUpdate,
    /// Batched delete, recorded as one aggregate entry.
    BulkDelete,
}

impl AuditAction {
    /// Wire representation stored in the `action` column.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::SoftDelete => "SOFT_DELETE",
            Self::Restore => "RESTORE",
            Self::BulkCreate => "BULK_CREATE",
            Self::BulkUpdate => "BULK_UPDATE",
            Self::BulkDelete => "BULK_DELETE",
        }
    }

    fn from_db(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            "SOFT_DELETE" => Ok(Self::SoftDelete),
            "RESTORE" => Ok(Self::Restore),
            "BULK_CREATE" => Ok(Self::BulkCreate),
            "BULK_UPDATE" => Ok(Self::BulkUpdate),
            "BULK_DELETE" => Ok(Self::BulkDelete),
            other => Err(StoreError::Database(format!(
                "unknown audit action {other:?}"
            ))),
        }
    }
}

/// Who is acting, carried by repositories into every audit entry.
#[derive(Debug, Clone)]
pub struct AuditContext {
    /// Acting user or component.
    pub actor: String,
    /// Optional client session the mutation belongs to.
    pub session_id: Option<String>,
    /// Groups all entries written by one logical operation.
    pub correlation_id: Uuid,
}

impl AuditContext {
    /// Context for a named actor with a fresh correlation id.
    #[must_use]
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            session_id: None,
            correlation_id: Uuid::new_v4(),
        }
    }

    /// Context for internal maintenance work.
    #[must_use]
    pub fn system() -> Self {
        Self::new("system")
    }

    /// Attaches a client session id.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// One recorded mutation.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Monotonic sequence number, orders entries within a trail.
    pub id: i64,
    /// Acting user or component.
    pub actor: String,
    /// What happened.
    pub action: AuditAction,
    /// Entity table the mutation touched.
    pub resource_type: String,
    /// Row id, or `"*"` for aggregate bulk entries.
    pub resource_id: String,
    /// Row payload before the mutation, where one existed.
    pub old_values: Option<Value>,
    /// Row payload after the mutation, where one remains.
    pub new_values: Option<Value>,
    /// Client session, if the context carried one.
    pub session_id: Option<String>,
    /// Correlation id shared by entries of one logical operation.
    pub correlation_id: Uuid,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: i64,
    actor: String,
    action: String,
    resource_type: String,
    resource_id: String,
    old_values: Option<String>,
    new_values: Option<String>,
    session_id: Option<String>,
    correlation_id: String,
    created_at: DateTime<Utc>,
}

impl AuditRow {
    fn into_entry(self) -> Result<AuditEntry, StoreError> {
        let parse_values = |raw: Option<String>| -> Result<Option<Value>, StoreError> {
            raw.map(|s| serde_json::from_str(&s)).transpose().map_err(StoreError::from)
        };
        Ok(AuditEntry {
            id: self.id,
            actor: self.actor,
            action: AuditAction::from_db(&self.action)?,
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            old_values: parse_values(self.old_values)?,
            new_values: parse_values(self.new_values)?,
            session_id: self.session_id,
            correlation_id: Uuid::parse_str(&self.correlation_id).map_err(|e| {
                StoreError::Database(format!("malformed correlation id: {e}"))
            })?,
            created_at: self.created_at,
        })
    }
}

/// Inserts one audit entry on the given transaction. Mutations call
/// this before committing so the entry shares the mutation's fate.
pub(crate) async fn record(
    tx: &mut Transaction<'static, Sqlite>,
    ctx: &AuditContext,
    action: AuditAction,
    resource_type: &str,
    resource_id: &str,
    old_values: Option<&Value>,
    new_values: Option<&Value>,
) -> Result<(), StoreError> {
    let serialize = |v: Option<&Value>| -> Result<Option<String>, StoreError> {
        v.map(serde_json::to_string).transpose().map_err(StoreError::from)
    };
    sqlx::query(
        "INSERT INTO audit_log \
         (actor, action, resource_type, resource_id, old_values, new_values, \
          session_id, correlation_id, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )
    .bind(&ctx.actor)
    .bind(action.as_str())
    .bind(resource_type)
    .bind(resource_id)
    .bind(serialize(old_values)?)
    .bind(serialize(new_values)?)
    .bind(ctx.session_id.as_deref())
    .bind(ctx.correlation_id.to_string())
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// The full trail for one resource, oldest first.
///
/// # Errors
///
/// Returns a [`StoreError`] when the query fails or a stored entry
/// cannot be decoded.
pub async fn entries_for(
    manager: &ConnectionManager,
    resource_type: &str,
    resource_id: &str,
) -> Result<Vec<AuditEntry>, StoreError> {
    let mut session = manager.acquire_session().await?;
    let rows: Vec<AuditRow> = sqlx::query_as(
        "SELECT id, actor, action, resource_type, resource_id, old_values, \
         new_values, session_id, correlation_id, created_at \
         FROM audit_log WHERE resource_type = ?1 AND resource_id = ?2 \
         ORDER BY id ASC",
    )
    .bind(resource_type)
    .bind(resource_id)
    .fetch_all(&mut *session)
    .await?;
    rows.into_iter().map(AuditRow::into_entry).collect()
}

/// Deletes audit entries older than `max_age`. Returns how many rows
/// were removed.
///
/// # Errors
///
/// Returns a [`StoreError`] when no connection can be acquired or the
/// delete fails.
pub async fn purge_older_than(
    manager: &ConnectionManager,
    max_age: chrono::Duration,
) -> Result<u64, StoreError> {
    let cutoff = Utc::now() - max_age;
    let mut session = manager.acquire_session().await?;
    let result = sqlx::query("DELETE FROM audit_log WHERE created_at < ?1")
        .bind(cutoff)
        .execute(&mut *session)
        .await?;
    let purged = result.rows_affected();
    if purged > 0 {
        tracing::info!(purged, %cutoff, "purged aged audit entries");
    }
    Ok(purged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_round_trips_through_wire_form() {
        let all = [
            AuditAction::Create,
            AuditAction::Update,
            AuditAction::Delete,
            AuditAction::SoftDelete,
            AuditAction::Restore,
            AuditAction::BulkCreate,
            AuditAction::BulkUpdate,
            AuditAction::BulkDelete,
        ];
        for action in all {
            assert_eq!(AuditAction::from_db(action.as_str()).ok(), Some(action));
        }
        assert!(AuditAction::from_db("TRUNCATE").is_err());
    }

    #[test]
    fn context_builder_carries_session() {
        let ctx = AuditContext::new("alice").with_session("sess-9");
        assert_eq!(ctx.actor, "alice");
        assert_eq!(ctx.session_id.as_deref(), Some("sess-9"));
        assert!(!ctx.correlation_id.is_nil());
    }
}
