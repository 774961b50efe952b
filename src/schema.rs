//! Embedded migrations and per-entity table provisioning.
//!
//! The shared tables (`audit_log`, `widget_states`) live in versioned
//! migrations run at connect time. Entity tables follow a uniform
//! document layout and are created on demand from each entity's
//! capability descriptor.

use sqlx::migrate::Migrator;

use crate::error::StoreError;
use crate::pool::ConnectionManager;
use crate::repository::Entity;

/// Migrations embedded at compile time from `./migrations`.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Creates the backing table for `T` if it does not exist yet.
///
/// Every entity table carries the same metadata columns around a single
/// JSON document column; `deleted_at` is only present when the entity's
/// descriptor opts into soft deletion.
///
/// # Errors
///
/// Returns a [`StoreError`] when no connection can be acquired or the
/// DDL statement fails.
pub async fn ensure_entity_table<T: Entity>(
    manager: &ConnectionManager,
) -> Result<(), StoreError> {
    let descriptor = T::descriptor();
    let deleted_col = if descriptor.soft_delete {
        "    deleted_at TEXT,\n"
    } else {
        ""
    };
    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n\
         \x20   id         TEXT PRIMARY KEY,\n\
         \x20   data       TEXT NOT NULL,\n\
         \x20   created_at TEXT NOT NULL,\n\
         \x20   updated_at TEXT NOT NULL,\n\
         {deleted_col}\
         \x20   version    INTEGER NOT NULL DEFAULT 1\n\
         )",
        table = T::TABLE,
    );
    let mut session = manager.acquire_session().await?;
    sqlx::query(&ddl)
        .execute(&mut *session)
        .await
        .map_err(StoreError::from)?;
    tracing::debug!(table = T::TABLE, soft_delete = descriptor.soft_delete, "entity table ready");
    Ok(())
}
