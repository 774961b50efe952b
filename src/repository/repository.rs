//! Generic CRUD, query and bulk operations over entity tables.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite, Transaction};
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::audit::{self, AuditAction, AuditContext};
use super::cache::StateCache;
use super::entity::{Entity, EntityDescriptor, RawRow, Stored};
use crate::error::StoreError;
use crate::pool::{ConnectionManager, ScopedTransaction};

/// Rows inserted per statement in bulk operations.
const BULK_CHUNK: usize = 50;

/// Equality filters on top-level fields of the entity document.
pub type Filters = serde_json::Map<String, Value>;

/// Transaction slot shared between a [`UnitOfWork`] and the
/// repositories it hands out.
///
/// [`UnitOfWork`]: super::UnitOfWork
pub(crate) type SharedTx = Arc<Mutex<Option<ScopedTransaction>>>;

/// One page of query results.
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// Rows on this page, in creation order.
    pub items: Vec<Stored<T>>,
    /// 1-based page number that was requested.
    pub page: u32,
    /// Page size that was requested.
    pub page_size: u32,
    /// Total matching rows across all pages.
    pub total: u64,
    /// Number of pages at this page size.
    pub total_pages: u64,
}

enum Backend {
    /// Each operation runs in its own short-lived transaction.
    Pooled(Arc<ConnectionManager>),
    /// Operations join a caller-owned unit-of-work transaction.
    Shared(SharedTx),
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pooled(_) => f.write_str("Backend::Pooled"),
            Self::Shared(_) => f.write_str("Backend::Shared"),
        }
    }
}

/// Where a given operation's transaction came from, and therefore who
/// commits it.
enum OpScope<'a> {
    Owned(ScopedTransaction),
    Borrowed(MutexGuard<'a, Option<ScopedTransaction>>),
}

impl OpScope<'_> {
    fn tx(&mut self) -> Result<&mut Transaction<'static, Sqlite>, StoreError> {
        let tx = match self {
            Self::Owned(scoped) => scoped.tx_mut(),
            Self::Borrowed(guard) => guard.as_mut().and_then(ScopedTransaction::tx_mut),
        };
        tx.ok_or_else(|| StoreError::Database("transaction already completed".into()))
    }

    /// Commits an owned transaction. Borrowed transactions are left to
    /// the unit of work that owns them.
    async fn finish(self) -> Result<(), StoreError> {
        match self {
            Self::Owned(scoped) => scoped.commit().await,
            Self::Borrowed(_) => Ok(()),
        }
    }
}

/// Typed data-access surface for one entity type.
///
/// A repository built from a [`ConnectionManager`] wraps each operation
/// in its own transaction; one obtained from a [`UnitOfWork`] enlists
/// in the shared transaction instead.
///
/// [`UnitOfWork`]: super::UnitOfWork
#[derive(Debug)]
pub struct Repository<T: Entity> {
    backend: Backend,
    ctx: AuditContext,
    cache: Option<Arc<StateCache>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> Repository<T> {
    /// A standalone repository; every operation commits on its own.
    #[must_use]
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self {
            backend: Backend::Pooled(manager),
            ctx: AuditContext::system(),
            cache: None,
            _marker: PhantomData,
        }
    }

    pub(crate) fn for_unit_of_work(shared: SharedTx, ctx: AuditContext) -> Self {
        Self {
            backend: Backend::Shared(shared),
            ctx,
            cache: None,
            _marker: PhantomData,
        }
    }

    /// Replaces the audit context recorded with each mutation.
    #[must_use]
    pub fn with_context(mut self, ctx: AuditContext) -> Self {
        self.ctx = ctx;
        self
    }

    /// Enables read-through caching of single-row lookups. Cached rows
    /// are only served outside a unit of work; mutations invalidate.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<StateCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Inserts `value` as a new row with a fresh id and version 1.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the insert or its audit entry
    /// fails, or the payload cannot be serialized.
    pub async fn create(&self, value: T) -> Result<Stored<T>, StoreError> {
        let mut scope = self.scope().await?;
        let stored = insert_one(scope.tx()?, &self.ctx, value).await?;
        scope.finish().await?;
        Ok(stored)
    }

    /// Fetches a row by id. Tombstoned rows are treated as absent
    /// unless `include_deleted` is set.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] for connection or decoding failures.
    pub async fn get_by_id(
        &self,
        id: Uuid,
        include_deleted: bool,
    ) -> Result<Option<Stored<T>>, StoreError> {
        if let (Backend::Pooled(_), Some(cache)) = (&self.backend, &self.cache)
            && let Some(row) = cache.get(T::TABLE, id)
        {
            if row.deleted_at.is_some() && !include_deleted {
                return Ok(None);
            }
            return row.into_stored().map(Some);
        }
        let mut scope = self.scope().await?;
        let row = fetch_row::<T>(scope.tx()?, id, include_deleted).await?;
        scope.finish().await?;
        let Some(row) = row else {
            return Ok(None);
        };
        // Rows read inside a shared transaction are not committed yet,
        // so only pooled reads may fill the cache.
        if let (Backend::Pooled(_), Some(cache)) = (&self.backend, &self.cache) {
            cache.put(T::TABLE, id, row.clone());
        }
        row.into_stored().map(Some)
    }

    /// Rows in creation order, optionally windowed and optionally
    /// including tombstoned rows.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the query or row decoding fails.
    pub async fn get_all(
        &self,
        limit: Option<u32>,
        offset: Option<u32>,
        include_deleted: bool,
    ) -> Result<Vec<Stored<T>>, StoreError> {
        let descriptor = T::descriptor();
        let mut qb = QueryBuilder::new(format!(
            "SELECT {} FROM {} WHERE 1=1",
            select_columns(descriptor),
            T::TABLE
        ));
        if !include_deleted {
            qb.push(live_clause(descriptor));
        }
        qb.push(" ORDER BY created_at ASC, id ASC");
        if limit.is_some() || offset.is_some() {
            // SQLite accepts OFFSET only after a LIMIT; -1 is unbounded.
            qb.push(" LIMIT ");
            qb.push_bind(limit.map_or(-1_i64, i64::from));
            qb.push(" OFFSET ");
            qb.push_bind(offset.map_or(0_i64, i64::from));
        }
        let mut scope = self.scope().await?;
        let rows: Vec<RawRow> = qb
            .build_query_as()
            .fetch_all(&mut **scope.tx()?)
            .await?;
        scope.finish().await?;
        rows.into_iter().map(RawRow::into_stored).collect()
    }

    /// Live rows whose document fields equal the given filter values.
    ///
    /// Filter keys must be plain identifiers naming top-level document
    /// fields; values may be strings, numbers, booleans or null.
    ///
    /// # Errors
    ///
    /// [`StoreError::Validation`] for malformed filter keys or
    /// non-scalar filter values; other [`StoreError`] values for
    /// connection or decoding failures.
    pub async fn find_by(&self, filters: &Filters) -> Result<Vec<Stored<T>>, StoreError> {
        let descriptor = T::descriptor();
        let mut qb = QueryBuilder::new(format!(
            "SELECT {} FROM {} WHERE 1=1",
            select_columns(descriptor),
            T::TABLE
        ));
        push_filters(&mut qb, filters)?;
        qb.push(live_clause(descriptor));
        qb.push(" ORDER BY created_at ASC, id ASC");

        let mut scope = self.scope().await?;
        let rows: Vec<RawRow> = qb
            .build_query_as()
            .fetch_all(&mut **scope.tx()?)
            .await?;
        scope.finish().await?;
        rows.into_iter().map(RawRow::into_stored).collect()
    }

    /// One page of live rows matching `filters`, with a total count
    /// taken in the same transaction so page math stays consistent.
    ///
    /// # Errors
    ///
    /// [`StoreError::Validation`] when `page` or `page_size` is zero or
    /// a filter is malformed; other [`StoreError`] values for
    /// connection or decoding failures.
    pub async fn paginate(
        &self,
        page: u32,
        page_size: u32,
        filters: &Filters,
    ) -> Result<Page<T>, StoreError> {
        if page == 0 || page_size == 0 {
            return Err(StoreError::Validation(
                "page and page_size must be at least 1".into(),
            ));
        }
        let descriptor = T::descriptor();
        let mut scope = self.scope().await?;

        let mut count_qb =
            QueryBuilder::new(format!("SELECT COUNT(*) FROM {} WHERE 1=1", T::TABLE));
        push_filters(&mut count_qb, filters)?;
        count_qb.push(live_clause(descriptor));
        let (total,): (i64,) = count_qb
            .build_query_as()
            .fetch_one(&mut **scope.tx()?)
            .await?;
        let total = u64::try_from(total).unwrap_or(0);

        let mut qb = QueryBuilder::new(format!(
            "SELECT {} FROM {} WHERE 1=1",
            select_columns(descriptor),
            T::TABLE
        ));
        push_filters(&mut qb, filters)?;
        qb.push(live_clause(descriptor));
        qb.push(" ORDER BY created_at ASC, id ASC LIMIT ");
        qb.push_bind(i64::from(page_size));
        qb.push(" OFFSET ");
        qb.push_bind(i64::from(page - 1) * i64::from(page_size));
        let rows: Vec<RawRow> = qb
            .build_query_as()
            .fetch_all(&mut **scope.tx()?)
            .await?;
        scope.finish().await?;

        let items = rows
            .into_iter()
            .map(RawRow::into_stored)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page {
            items,
            page,
            page_size,
            total,
            total_pages: total.div_ceil(u64::from(page_size)),
        })
    }

    /// Applies a JSON merge patch to the row's document. Fields set to
    /// null are removed; the version increments by one.
    ///
    /// When `expected_version` is given, the update fails with
    /// [`StoreError::Conflict`] if the stored version differs.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] for a missing or tombstoned row,
    /// [`StoreError::Conflict`] on a version mismatch,
    /// [`StoreError::Validation`] for a non-object patch, and
    /// [`StoreError::Serialization`] when the patched document no
    /// longer matches the entity's shape.
    pub async fn update(
        &self,
        id: Uuid,
        patch: Value,
        expected_version: Option<i64>,
    ) -> Result<Stored<T>, StoreError> {
        if !patch.is_object() {
            return Err(StoreError::Validation(
                "update patch must be a JSON object".into(),
            ));
        }
        let mut scope = self.scope().await?;
        let stored = update_one(scope.tx()?, &self.ctx, id, &patch, expected_version).await?;
        scope.finish().await?;
        self.invalidate(id);
        Ok(stored)
    }

    /// Deletes a row. The soft path tombstones it so it can later be
    /// restored; the hard path removes it for good. The soft path also
    /// falls back to a hard delete for entities without tombstones.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when no live row matches; other
    /// [`StoreError`] values for connection failures.
    pub async fn delete(&self, id: Uuid, soft: bool) -> Result<(), StoreError> {
        let soft = soft && T::descriptor().soft_delete;
        let mut scope = self.scope().await?;
        delete_one::<T>(scope.tx()?, &self.ctx, id, soft).await?;
        scope.finish().await?;
        self.invalidate(id);
        Ok(())
    }

    /// Clears a tombstone so the row reappears in default reads.
    ///
    /// # Errors
    ///
    /// [`StoreError::Validation`] when the entity does not support
    /// soft deletion, [`StoreError::NotFound`] when the row does not
    /// exist or is not currently soft-deleted, and other
    /// [`StoreError`] values for connection failures.
    pub async fn restore(&self, id: Uuid) -> Result<Stored<T>, StoreError> {
        if !T::descriptor().soft_delete {
            return Err(StoreError::Validation(format!(
                "{} does not support soft deletion",
                T::TABLE
            )));
        }
        let mut scope = self.scope().await?;
        let tx = scope.tx()?;
        let row = fetch_row::<T>(tx, id, true)
            .await?
            .ok_or_else(|| StoreError::not_found(T::TABLE, id))?;
        if row.deleted_at.is_none() {
            return Err(StoreError::not_found(T::TABLE, id));
        }
        let now = Utc::now();
        let sql = format!(
            "UPDATE {} SET deleted_at = NULL, updated_at = ?1, \
             version = version + 1 WHERE id = ?2",
            T::TABLE
        );
        sqlx::query(&sql)
            .bind(now)
            .bind(id.to_string())
            .execute(&mut **tx)
            .await?;
        if T::descriptor().audited {
            let doc: Value = serde_json::from_str(&row.data)?;
            audit::record(
                tx,
                &self.ctx,
                AuditAction::Restore,
                T::TABLE,
                &id.to_string(),
                None,
                Some(&doc),
            )
            .await?;
        }
        scope.finish().await?;
        self.invalidate(id);
        let mut stored = row.into_stored()?;
        stored.deleted_at = None;
        stored.updated_at = now;
        stored.version += 1;
        Ok(stored)
    }

    /// Inserts many rows in chunked multi-row statements, recording one
    /// aggregate audit entry for the whole batch.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when serialization or any insert
    /// fails; the whole batch rolls back in that case.
    pub async fn bulk_create(&self, values: Vec<T>) -> Result<Vec<Stored<T>>, StoreError> {
        if values.is_empty() {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let mut prepared = Vec::with_capacity(values.len());
        for value in values {
            prepared.push((Uuid::new_v4(), serde_json::to_string(&value)?, value));
        }

        let mut scope = self.scope().await?;
        let tx = scope.tx()?;
        for chunk in prepared.chunks(BULK_CHUNK) {
            let mut qb = QueryBuilder::new(format!(
                "INSERT INTO {} (id, data, created_at, updated_at, version) ",
                T::TABLE
            ));
            qb.push_values(chunk, |mut b, (id, json, _)| {
                b.push_bind(id.to_string())
                    .push_bind(json.as_str())
                    .push_bind(now)
                    .push_bind(now)
                    .push_bind(1_i64);
            });
            qb.build().execute(&mut **tx).await?;
        }
        if T::descriptor().audited {
            let ids: Vec<String> = prepared.iter().map(|(id, _, _)| id.to_string()).collect();
            let summary = serde_json::json!({ "count": ids.len(), "ids": ids });
            audit::record(
                tx,
                &self.ctx,
                AuditAction::BulkCreate,
                T::TABLE,
                "*",
                None,
                Some(&summary),
            )
            .await?;
        }
        scope.finish().await?;

        Ok(prepared
            .into_iter()
            .map(|(id, _, data)| Stored {
                id,
                created_at: now,
                updated_at: now,
                deleted_at: None,
                version: 1,
                data,
            })
            .collect())
    }

    /// Applies a merge patch per row using the database's own JSON
    /// patching, so no read-back is needed. Rows that are missing or
    /// tombstoned are skipped; returns how many rows changed.
    ///
    /// # Errors
    ///
    /// [`StoreError::Validation`] when any patch is not a JSON object;
    /// other [`StoreError`] values roll the whole batch back.
    pub async fn bulk_update(&self, patches: Vec<(Uuid, Value)>) -> Result<u64, StoreError> {
        if patches.is_empty() {
            return Ok(0);
        }
        for (_, patch) in &patches {
            if !patch.is_object() {
                return Err(StoreError::Validation(
                    "update patch must be a JSON object".into(),
                ));
            }
        }
        let descriptor = T::descriptor();
        let now = Utc::now();
        let sql = format!(
            "UPDATE {} SET data = json_patch(data, ?1), updated_at = ?2, \
             version = version + 1 WHERE id = ?3{}",
            T::TABLE,
            live_clause(descriptor)
        );

        let mut scope = self.scope().await?;
        let tx = scope.tx()?;
        let mut updated = 0_u64;
        for (id, patch) in &patches {
            let result = sqlx::query(&sql)
                .bind(serde_json::to_string(patch)?)
                .bind(now)
                .bind(id.to_string())
                .execute(&mut **tx)
                .await?;
            updated += result.rows_affected();
        }
        if descriptor.audited && updated > 0 {
            let ids: Vec<String> = patches.iter().map(|(id, _)| id.to_string()).collect();
            let summary = serde_json::json!({ "count": updated, "ids": ids });
            audit::record(
                tx,
                &self.ctx,
                AuditAction::BulkUpdate,
                T::TABLE,
                "*",
                None,
                Some(&summary),
            )
            .await?;
        }
        scope.finish().await?;
        for (id, _) in &patches {
            self.invalidate(*id);
        }
        Ok(updated)
    }

    /// Deletes many rows (tombstoning where the entity supports it),
    /// with one aggregate audit entry. Returns how many rows changed.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when any statement fails; the whole
    /// batch rolls back in that case.
    pub async fn bulk_delete(&self, ids: &[Uuid]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let descriptor = T::descriptor();
        let now = Utc::now();

        let mut scope = self.scope().await?;
        let tx = scope.tx()?;
        let mut removed = 0_u64;
        for chunk in ids.chunks(BULK_CHUNK) {
            let mut qb = if descriptor.soft_delete {
                let mut qb = QueryBuilder::new(format!("UPDATE {} SET deleted_at = ", T::TABLE));
                qb.push_bind(now);
                qb.push(", updated_at = ");
                qb.push_bind(now);
                qb.push(", version = version + 1 WHERE deleted_at IS NULL AND id IN (");
                qb
            } else {
                QueryBuilder::new(format!("DELETE FROM {} WHERE id IN (", T::TABLE))
            };
            let mut sep = qb.separated(", ");
            for id in chunk {
                sep.push_bind(id.to_string());
            }
            qb.push(")");
            removed += qb.build().execute(&mut **tx).await?.rows_affected();
        }
        if descriptor.audited && removed > 0 {
            let id_strings: Vec<String> = ids.iter().map(Uuid::to_string).collect();
            let summary = serde_json::json!({ "count": removed, "ids": id_strings });
            audit::record(
                tx,
                &self.ctx,
                AuditAction::BulkDelete,
                T::TABLE,
                "*",
                None,
                Some(&summary),
            )
            .await?;
        }
        scope.finish().await?;
        for id in ids {
            self.invalidate(*id);
        }
        Ok(removed)
    }

    /// Whether a live row with this id exists.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the query fails.
    pub async fn exists(&self, id: Uuid) -> Result<bool, StoreError> {
        let descriptor = T::descriptor();
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE id = ?1{}",
            T::TABLE,
            live_clause(descriptor)
        );
        let mut scope = self.scope().await?;
        let (count,): (i64,) = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_one(&mut **scope.tx()?)
            .await?;
        scope.finish().await?;
        Ok(count > 0)
    }

    /// Number of live rows matching `filters`.
    ///
    /// # Errors
    ///
    /// [`StoreError::Validation`] for malformed filters; other
    /// [`StoreError`] values when the query fails.
    pub async fn count(&self, filters: &Filters) -> Result<u64, StoreError> {
        let descriptor = T::descriptor();
        let mut qb = QueryBuilder::new(format!("SELECT COUNT(*) FROM {} WHERE 1=1", T::TABLE));
        push_filters(&mut qb, filters)?;
        qb.push(live_clause(descriptor));
        let mut scope = self.scope().await?;
        let (count,): (i64,) = qb
            .build_query_as()
            .fetch_one(&mut **scope.tx()?)
            .await?;
        scope.finish().await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn scope(&self) -> Result<OpScope<'_>, StoreError> {
        match &self.backend {
            Backend::Pooled(manager) => Ok(OpScope::Owned(manager.begin().await?)),
            Backend::Shared(shared) => Ok(OpScope::Borrowed(shared.lock().await)),
        }
    }

    fn invalidate(&self, id: Uuid) {
        if let Some(cache) = &self.cache {
            cache.invalidate(T::TABLE, id);
        }
    }
}

const fn select_columns(descriptor: EntityDescriptor) -> &'static str {
    if descriptor.soft_delete {
        "id, data, created_at, updated_at, deleted_at, version"
    } else {
        "id, data, created_at, updated_at, NULL AS deleted_at, version"
    }
}

const fn live_clause(descriptor: EntityDescriptor) -> &'static str {
    if descriptor.soft_delete {
        " AND deleted_at IS NULL"
    } else {
        ""
    }
}

/// Filter keys are spliced into `json_extract` paths, so they must be
/// plain identifiers.
fn validate_filter_key(key: &str) -> Result<(), StoreError> {
    let mut chars = key.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(StoreError::Validation(format!(
            "invalid filter key {key:?}"
        )))
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, filters: &Filters) -> Result<(), StoreError> {
    for (key, value) in filters {
        validate_filter_key(key)?;
        qb.push(" AND json_extract(data, '$.");
        qb.push(key.as_str());
        qb.push("')");
        match value {
            Value::Null => {
                qb.push(" IS NULL");
            }
            Value::Bool(b) => {
                qb.push(" = ");
                qb.push_bind(i64::from(*b));
            }
            Value::Number(n) => {
                qb.push(" = ");
                if let Some(i) = n.as_i64() {
                    qb.push_bind(i);
                } else {
                    qb.push_bind(n.as_f64().unwrap_or(f64::NAN));
                }
            }
            Value::String(s) => {
                qb.push(" = ");
                qb.push_bind(s.clone());
            }
            Value::Array(_) | Value::Object(_) => {
                return Err(StoreError::Validation(format!(
                    "filter {key:?} must be a scalar value"
                )));
            }
        }
    }
    Ok(())
}

async fn fetch_row<T: Entity>(
    tx: &mut Transaction<'static, Sqlite>,
    id: Uuid,
    include_deleted: bool,
) -> Result<Option<RawRow>, StoreError> {
    let descriptor = T::descriptor();
    let live = if include_deleted {
        ""
    } else {
        live_clause(descriptor)
    };
    let sql = format!(
        "SELECT {} FROM {} WHERE id = ?1{live}",
        select_columns(descriptor),
        T::TABLE
    );
    sqlx::query_as(&sql)
        .bind(id.to_string())
        .fetch_optional(&mut **tx)
        .await
        .map_err(StoreError::from)
}

async fn insert_one<T: Entity>(
    tx: &mut Transaction<'static, Sqlite>,
    ctx: &AuditContext,
    value: T,
) -> Result<Stored<T>, StoreError> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    let doc = serde_json::to_value(&value)?;
    let sql = format!(
        "INSERT INTO {} (id, data, created_at, updated_at, version) VALUES (?1, ?2, ?3, ?4, 1)",
        T::TABLE
    );
    sqlx::query(&sql)
        .bind(id.to_string())
        .bind(serde_json::to_string(&doc)?)
        .bind(now)
        .bind(now)
        .execute(&mut **tx)
        .await?;
    if T::descriptor().audited {
        audit::record(
            tx,
            ctx,
            AuditAction::Create,
            T::TABLE,
            &id.to_string(),
            None,
            Some(&doc),
        )
        .await?;
    }
    Ok(Stored {
        id,
        created_at: now,
        updated_at: now,
        deleted_at: None,
        version: 1,
        data: value,
    })
}

async fn update_one<T: Entity>(
    tx: &mut Transaction<'static, Sqlite>,
    ctx: &AuditContext,
    id: Uuid,
    patch: &Value,
    expected_version: Option<i64>,
) -> Result<Stored<T>, StoreError> {
    let row = fetch_row::<T>(tx, id, false)
        .await?
        .ok_or_else(|| StoreError::not_found(T::TABLE, id))?;
    if let Some(expected) = expected_version
        && expected != row.version
    {
        return Err(StoreError::Conflict {
            resource: T::TABLE.to_owned(),
            id,
            expected,
            actual: row.version,
        });
    }

    let old_doc: Value = serde_json::from_str(&row.data)?;
    let mut new_doc = old_doc.clone();
    merge_patch(&mut new_doc, patch);
    // Deserializing up front surfaces patches that break the entity's
    // shape before anything is written.
    let data: T = serde_json::from_value(new_doc.clone())?;

    let now = Utc::now();
    let new_version = row.version + 1;
    let sql = format!(
        "UPDATE {} SET data = ?1, updated_at = ?2, version = ?3 WHERE id = ?4 AND version = ?5",
        T::TABLE
    );
    let result = sqlx::query(&sql)
        .bind(serde_json::to_string(&new_doc)?)
        .bind(now)
        .bind(new_version)
        .bind(id.to_string())
        .bind(row.version)
        .execute(&mut **tx)
        .await?;
    if result.rows_affected() == 0 {
        let actual = fetch_row::<T>(tx, id, true)
            .await?
            .map_or(-1, |r| r.version);
        return Err(StoreError::Conflict {
            resource: T::TABLE.to_owned(),
            id,
            expected: row.version,
            actual,
        });
    }
    if T::descriptor().audited {
        audit::record(
            tx,
            ctx,
            AuditAction::Update,
            T::TABLE,
            &id.to_string(),
            Some(&old_doc),
            Some(&new_doc),
        )
        .await?;
    }
    Ok(Stored {
        id,
        created_at: row.created_at,
        updated_at: now,
        deleted_at: None,
        version: new_version,
        data,
    })
}

async fn delete_one<T: Entity>(
    tx: &mut Transaction<'static, Sqlite>,
    ctx: &AuditContext,
    id: Uuid,
    soft: bool,
) -> Result<(), StoreError> {
    let row = fetch_row::<T>(tx, id, false)
        .await?
        .ok_or_else(|| StoreError::not_found(T::TABLE, id))?;
    let doc: Value = serde_json::from_str(&row.data)?;
    let action = if soft {
        let now = Utc::now();
        let sql = format!(
            "UPDATE {} SET deleted_at = ?1, updated_at = ?1, \
             version = version + 1 WHERE id = ?2",
            T::TABLE
        );
        sqlx::query(&sql)
            .bind(now)
            .bind(id.to_string())
            .execute(&mut **tx)
            .await?;
        AuditAction::SoftDelete
    } else {
        let sql = format!("DELETE FROM {} WHERE id = ?1", T::TABLE);
        sqlx::query(&sql)
            .bind(id.to_string())
            .execute(&mut **tx)
            .await?;
        AuditAction::Delete
    };
    if T::descriptor().audited {
        audit::record(tx, ctx, action, T::TABLE, &id.to_string(), Some(&doc), None).await?;
    }
    Ok(())
}

/// RFC 7386 merge patch: objects merge recursively, null removes a
/// field, everything else replaces. Matches SQLite's `json_patch`, so
/// single and bulk updates agree.
fn merge_patch(target: &mut Value, patch: &Value) {
    if let Value::Object(patch_map) = patch {
        if !target.is_object() {
            *target = Value::Object(serde_json::Map::new());
        }
        if let Value::Object(target_map) = target {
            for (key, value) in patch_map {
                if value.is_null() {
                    target_map.remove(key);
                } else {
                    merge_patch(
                        target_map.entry(key.clone()).or_insert(Value::Null),
                        value,
                    );
                }
            }
        }
    } else {
        *target = patch.clone();
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use super::*;
    use crate::config::StoreConfig;
    use crate::repository;
    use crate::schema;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Customer {
        name: String,
        email: String,
        active: bool,
    }

    impl Entity for Customer {
        const TABLE: &'static str = "customers";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct LogLine {
        message: String,
    }

    impl Entity for LogLine {
        const TABLE: &'static str = "log_lines";

        fn descriptor() -> EntityDescriptor {
            EntityDescriptor {
                soft_delete: false,
                audited: false,
            }
        }
    }

    fn customer(name: &str) -> Customer {
        Customer {
            name: name.to_owned(),
            email: format!("{name}@example.com"),
            active: true,
        }
    }

    async fn setup(tag: &str) -> Arc<ConnectionManager> {
        let url = format!(
            "sqlite:file:{tag}_{}?mode=memory&cache=shared",
            Uuid::new_v4().simple()
        );
        let mut config = StoreConfig::for_url(&url);
        config.health_check_enabled = false;
        let Ok(manager) = ConnectionManager::connect(config).await else {
            panic!("manager failed to connect");
        };
        let manager = Arc::new(manager);
        if let Err(e) = schema::ensure_entity_table::<Customer>(&manager).await {
            panic!("customers table setup failed: {e}");
        }
        if let Err(e) = schema::ensure_entity_table::<LogLine>(&manager).await {
            panic!("log_lines table setup failed: {e}");
        }
        manager
    }

    #[test]
    fn merge_patch_follows_rfc7386() {
        let mut doc = json!({"a": 1, "b": {"x": 1, "y": 2}, "c": 3});
        merge_patch(&mut doc, &json!({"a": 9, "b": {"y": null, "z": 5}, "c": null}));
        assert_eq!(doc, json!({"a": 9, "b": {"x": 1, "z": 5}}));
    }

    #[test]
    fn filter_keys_must_be_identifiers() {
        assert!(validate_filter_key("email").is_ok());
        assert!(validate_filter_key("created_by2").is_ok());
        assert!(validate_filter_key("").is_err());
        assert!(validate_filter_key("2fast").is_err());
        assert!(validate_filter_key("x'); DROP TABLE customers; --").is_err());
    }

    #[tokio::test]
    async fn create_get_update_delete_cycle() {
        let manager = setup("repo_cycle").await;
        let repo = Repository::<Customer>::new(Arc::clone(&manager));

        let Ok(stored) = repo.create(customer("ada")).await else {
            panic!("create failed");
        };
        assert_eq!(stored.version, 1);

        let Ok(Some(fetched)) = repo.get_by_id(stored.id, false).await else {
            panic!("get failed");
        };
        assert_eq!(fetched.data, stored.data);

        let Ok(updated) = repo
            .update(stored.id, json!({"name": "ada lovelace"}), Some(1))
            .await
        else {
            panic!("update failed");
        };
        assert_eq!(updated.version, 2);
        assert_eq!(updated.data.name, "ada lovelace");
        assert_eq!(updated.data.email, "ada@example.com");

        assert!(repo.delete(stored.id, true).await.is_ok());
        let Ok(None) = repo.get_by_id(stored.id, false).await else {
            panic!("deleted row should not be fetchable");
        };
        let Ok(Some(tombstoned)) = repo.get_by_id(stored.id, true).await else {
            panic!("tombstoned row should be reachable with include_deleted");
        };
        assert!(tombstoned.is_deleted());

        let Ok(restored) = repo.restore(stored.id).await else {
            panic!("restore failed");
        };
        assert!(!restored.is_deleted());
        assert!(matches!(repo.get_by_id(stored.id, false).await, Ok(Some(_))));
        // A second restore has nothing to clear.
        assert!(matches!(
            repo.restore(stored.id).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn stale_expected_version_conflicts() {
        let manager = setup("repo_conflict").await;
        let repo = Repository::<Customer>::new(manager);
        let Ok(stored) = repo.create(customer("bob")).await else {
            panic!("create failed");
        };
        let Ok(_) = repo.update(stored.id, json!({"active": false}), None).await else {
            panic!("first update failed");
        };
        let Err(StoreError::Conflict {
            expected, actual, ..
        }) = repo.update(stored.id, json!({"active": true}), Some(1)).await
        else {
            panic!("stale version should conflict");
        };
        assert_eq!(expected, 1);
        assert_eq!(actual, 2);
    }

    #[tokio::test]
    async fn find_by_and_count_respect_filters_and_tombstones() {
        let manager = setup("repo_filters").await;
        let repo = Repository::<Customer>::new(manager);
        let Ok(a) = repo.create(customer("carol")).await else {
            panic!("create failed");
        };
        let Ok(_) = repo.create(customer("dave")).await else {
            panic!("create failed");
        };
        let Ok(_) = repo
            .update(a.id, json!({"active": false}), None)
            .await
        else {
            panic!("update failed");
        };

        let mut filters = Filters::new();
        filters.insert("active".into(), json!(false));
        let Ok(inactive) = repo.find_by(&filters).await else {
            panic!("find_by failed");
        };
        assert_eq!(inactive.len(), 1);
        let Some(first) = inactive.first() else {
            panic!("filtered row missing");
        };
        assert_eq!(first.data.name, "carol");

        assert!(repo.delete(a.id, true).await.is_ok());
        let Ok(count) = repo.count(&filters).await else {
            panic!("count failed");
        };
        assert_eq!(count, 0);
        let Ok(total) = repo.count(&Filters::new()).await else {
            panic!("count failed");
        };
        assert_eq!(total, 1);

        let Ok(everything) = repo.get_all(None, None, true).await else {
            panic!("get_all failed");
        };
        assert_eq!(everything.len(), 2);
        assert_eq!(everything.iter().filter(|s| s.is_deleted()).count(), 1);
        let Ok(windowed) = repo.get_all(Some(1), Some(1), true).await else {
            panic!("get_all failed");
        };
        assert_eq!(windowed.len(), 1);
    }

    #[tokio::test]
    async fn paginate_reports_consistent_totals() {
        let manager = setup("repo_paginate").await;
        let repo = Repository::<Customer>::new(manager);
        let values: Vec<Customer> = (0..7).map(|i| customer(&format!("user{i}"))).collect();
        let Ok(_) = repo.bulk_create(values).await else {
            panic!("bulk_create failed");
        };

        let Ok(page) = repo.paginate(2, 3, &Filters::new()).await else {
            panic!("paginate failed");
        };
        assert_eq!(page.total, 7);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.items.len(), 3);

        let Ok(last) = repo.paginate(3, 3, &Filters::new()).await else {
            panic!("paginate failed");
        };
        assert_eq!(last.items.len(), 1);

        assert!(matches!(
            repo.paginate(0, 3, &Filters::new()).await,
            Err(StoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn bulk_operations_record_one_audit_entry_each() {
        let manager = setup("repo_bulk_audit").await;
        let repo = Repository::<Customer>::new(Arc::clone(&manager));
        let values: Vec<Customer> = (0..120).map(|i| customer(&format!("bulk{i}"))).collect();
        let Ok(stored) = repo.bulk_create(values).await else {
            panic!("bulk_create failed");
        };
        assert_eq!(stored.len(), 120);

        let patches: Vec<(Uuid, Value)> = stored
            .iter()
            .take(10)
            .map(|s| (s.id, json!({"active": false})))
            .collect();
        let Ok(updated) = repo.bulk_update(patches).await else {
            panic!("bulk_update failed");
        };
        assert_eq!(updated, 10);

        let ids: Vec<Uuid> = stored.iter().skip(10).take(5).map(|s| s.id).collect();
        let Ok(removed) = repo.bulk_delete(&ids).await else {
            panic!("bulk_delete failed");
        };
        assert_eq!(removed, 5);
        let Some(first_removed) = ids.first() else {
            panic!("removed ids missing");
        };
        let Ok(Some(tombstoned)) = repo.get_by_id(*first_removed, true).await else {
            panic!("tombstoned row missing");
        };
        assert_eq!(tombstoned.version, 2);

        let Ok(entries) = repository::entries_for(&manager, Customer::TABLE, "*").await else {
            panic!("audit query failed");
        };
        let actions: Vec<AuditAction> = entries.iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![
                AuditAction::BulkCreate,
                AuditAction::BulkUpdate,
                AuditAction::BulkDelete
            ]
        );
    }

    #[tokio::test]
    async fn bulk_update_merges_via_json_patch() {
        let manager = setup("repo_bulk_patch").await;
        let repo = Repository::<Customer>::new(manager);
        let Ok(stored) = repo.create(customer("erin")).await else {
            panic!("create failed");
        };
        let Ok(updated) = repo
            .bulk_update(vec![(stored.id, json!({"active": false}))])
            .await
        else {
            panic!("bulk_update failed");
        };
        assert_eq!(updated, 1);
        let Ok(Some(after)) = repo.get_by_id(stored.id, false).await else {
            panic!("get failed");
        };
        assert!(!after.data.active);
        assert_eq!(after.data.email, "erin@example.com");
        assert_eq!(after.version, 2);
    }

    #[tokio::test]
    async fn unaudited_entity_writes_no_trail_and_hard_deletes() {
        let manager = setup("repo_unaudited").await;
        let repo = Repository::<LogLine>::new(Arc::clone(&manager));
        let Ok(stored) = repo
            .create(LogLine {
                message: "boot".into(),
            })
            .await
        else {
            panic!("create failed");
        };
        assert!(repo.delete(stored.id, true).await.is_ok());
        let Ok(None) = repo.get_by_id(stored.id, true).await else {
            panic!("row should be gone entirely");
        };
        let Ok(entries) =
            repository::entries_for(&manager, LogLine::TABLE, &stored.id.to_string()).await
        else {
            panic!("audit query failed");
        };
        assert!(entries.is_empty());
        assert!(matches!(
            repo.restore(stored.id).await,
            Err(StoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn lifecycle_writes_ordered_audit_trail() {
        let manager = setup("repo_trail").await;
        let ctx = AuditContext::new("auditor").with_session("sess-1");
        let repo = Repository::<Customer>::new(Arc::clone(&manager)).with_context(ctx.clone());

        let Ok(stored) = repo.create(customer("grace")).await else {
            panic!("create failed");
        };
        let Ok(_) = repo
            .update(stored.id, json!({"name": "grace hopper"}), None)
            .await
        else {
            panic!("update failed");
        };
        assert!(repo.delete(stored.id, true).await.is_ok());
        let Ok(_) = repo.restore(stored.id).await else {
            panic!("restore failed");
        };

        let Ok(entries) =
            repository::entries_for(&manager, Customer::TABLE, &stored.id.to_string()).await
        else {
            panic!("audit query failed");
        };
        let actions: Vec<AuditAction> = entries.iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![
                AuditAction::Create,
                AuditAction::Update,
                AuditAction::SoftDelete,
                AuditAction::Restore
            ]
        );
        for entry in &entries {
            assert_eq!(entry.actor, "auditor");
            assert_eq!(entry.session_id.as_deref(), Some("sess-1"));
            assert_eq!(entry.correlation_id, ctx.correlation_id);
        }
        let Some(update_entry) = entries.get(1) else {
            panic!("update entry missing");
        };
        let Some(old) = &update_entry.old_values else {
            panic!("update entry lacks old values");
        };
        let Some(new) = &update_entry.new_values else {
            panic!("update entry lacks new values");
        };
        assert_eq!(old["name"], "grace");
        assert_eq!(new["name"], "grace hopper");
    }

    #[tokio::test]
    async fn failed_operation_inside_transaction_leaves_no_trace() {
        let manager = setup("repo_atomic").await;
        let repo = Repository::<Customer>::new(Arc::clone(&manager));
        // A conflicting expected_version aborts after the row was read
        // but before anything is written.
        let Ok(stored) = repo.create(customer("henry")).await else {
            panic!("create failed");
        };
        let Err(_) = repo
            .update(stored.id, json!({"name": "other"}), Some(99))
            .await
        else {
            panic!("update should have conflicted");
        };
        let Ok(Some(after)) = repo.get_by_id(stored.id, false).await else {
            panic!("get failed");
        };
        assert_eq!(after.data.name, "henry");
        assert_eq!(after.version, 1);
        let Ok(entries) =
            repository::entries_for(&manager, Customer::TABLE, &stored.id.to_string()).await
        else {
            panic!("audit query failed");
        };
        // Only the create is on record.
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn bulk_create_outpaces_sequential_creates() {
        let manager = setup("repo_bulk_speed").await;
        let repo = Repository::<Customer>::new(manager);
        let n = 500;

        let sequential_start = std::time::Instant::now();
        for i in 0..n {
            let Ok(_) = repo.create(customer(&format!("seq{i}"))).await else {
                panic!("create failed");
            };
        }
        let sequential = sequential_start.elapsed();

        let values: Vec<Customer> = (0..n).map(|i| customer(&format!("blk{i}"))).collect();
        let bulk_start = std::time::Instant::now();
        let Ok(_) = repo.bulk_create(values).await else {
            panic!("bulk_create failed");
        };
        let bulk = bulk_start.elapsed();

        // Chunked inserts in one transaction against 500 per-row
        // transactions with per-row audit inserts.
        assert!(
            bulk * 5 < sequential,
            "bulk {bulk:?} not at least 5x faster than sequential {sequential:?}"
        );
    }

    #[tokio::test]
    async fn cached_reads_are_invalidated_by_writes() {
        let manager = setup("repo_cache").await;
        let cache = Arc::new(StateCache::new());
        let repo = Repository::<Customer>::new(manager).with_cache(Arc::clone(&cache));
        let Ok(stored) = repo.create(customer("fay")).await else {
            panic!("create failed");
        };
        let Ok(Some(_)) = repo.get_by_id(stored.id, false).await else {
            panic!("get failed");
        };
        assert_eq!(cache.len(), 1);

        let Ok(_) = repo.update(stored.id, json!({"name": "faye"}), None).await else {
            panic!("update failed");
        };
        assert!(cache.is_empty());
        let Ok(Some(after)) = repo.get_by_id(stored.id, false).await else {
            panic!("get failed");
        };
        assert_eq!(after.data.name, "faye");
    }

    #[tokio::test]
    async fn rolled_back_reads_never_poison_a_shared_cache() {
        let manager = setup("repo_cache_uow").await;
        let cache = Arc::new(StateCache::new());
        let Ok(uow) = repository::UnitOfWork::begin(&manager, AuditContext::new("tester")).await
        else {
            panic!("begin failed");
        };
        let inside = uow.repository::<Customer>().with_cache(Arc::clone(&cache));
        let Ok(stored) = inside.create(customer("ghost")).await else {
            panic!("create failed");
        };
        // Reading the uncommitted row back must not fill the cache.
        let Ok(Some(_)) = inside.get_by_id(stored.id, false).await else {
            panic!("read inside the transaction failed");
        };
        assert!(cache.is_empty());
        assert!(uow.rollback().await.is_ok());

        let outside = Repository::<Customer>::new(manager).with_cache(cache);
        assert!(matches!(outside.get_by_id(stored.id, false).await, Ok(None)));
    }

    #[tokio::test]
    async fn tombstone_cycle_bumps_version_and_updated_at() {
        let manager = setup("repo_tombstone_version").await;
        let repo = Repository::<Customer>::new(manager);
        let Ok(stored) = repo.create(customer("ida")).await else {
            panic!("create failed");
        };

        assert!(repo.delete(stored.id, true).await.is_ok());
        let Ok(Some(tombstoned)) = repo.get_by_id(stored.id, true).await else {
            panic!("tombstoned row missing");
        };
        assert_eq!(tombstoned.version, 2);
        assert!(tombstoned.updated_at > stored.updated_at);

        let Ok(restored) = repo.restore(stored.id).await else {
            panic!("restore failed");
        };
        assert_eq!(restored.version, 3);
        assert!(restored.updated_at > tombstoned.updated_at);
        let Ok(Some(after)) = repo.get_by_id(stored.id, false).await else {
            panic!("restored row missing");
        };
        assert_eq!(after.version, 3);

        // An optimistic writer holding the pre-delete version must see
        // that the row changed underneath it.
        let Err(StoreError::Conflict {
            expected, actual, ..
        }) = repo
            .update(stored.id, json!({"active": false}), Some(1))
            .await
        else {
            panic!("stale version should conflict");
        };
        assert_eq!(expected, 1);
        assert_eq!(actual, 3);
    }
}
