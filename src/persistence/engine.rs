//! Debounce-and-batch flusher for widget state.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use sqlx::QueryBuilder;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use super::conflict::{ConflictStrategy, resolve};
use super::models::{WidgetStateRecord, WidgetStateRow};
use crate::error::StoreError;
use crate::pool::ConnectionManager;

/// Rows per upsert statement when flushing a batch.
const UPSERT_CHUNK: usize = 50;

type PendingKey = (String, String);

/// Outcome of one flush pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Entries persisted.
    pub written: u64,
    /// Entries that failed once and went back into the pending map.
    pub requeued: u64,
    /// Entries dropped after their re-queue attempt also failed.
    pub dropped: u64,
    /// `(session_id, key)` pairs of the dropped entries.
    pub dropped_keys: Vec<(String, String)>,
}

struct Pending {
    record: WidgetStateRecord,
    first_seen: Instant,
    last_write: Instant,
    retried: bool,
}

struct EngineInner {
    manager: Arc<ConnectionManager>,
    strategy: ConflictStrategy,
    debounce: Duration,
    batch_size: usize,
    batch_timeout: Duration,
    pending: Mutex<HashMap<PendingKey, Pending>>,
    wake: Notify,
}

/// Coalesces bursts of widget-state writes into periodic batched
/// upserts.
///
/// One background task owns the timing: each pending entry flushes
/// after its debounce window goes quiet, the whole map flushes when it
/// reaches `batch_size`, and `batch_timeout` bounds how long a
/// constantly-rewritten entry can stay unflushed.
#[derive(Debug)]
pub struct PersistenceEngine {
    inner: Arc<EngineInner>,
    shutdown: watch::Sender<bool>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for EngineInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineInner")
            .field("debounce", &self.debounce)
            .field("batch_size", &self.batch_size)
            .field("batch_timeout", &self.batch_timeout)
            .finish_non_exhaustive()
    }
}

impl PersistenceEngine {
    /// Starts the flusher task using the manager's debounce and batch
    /// settings, coalescing concurrent writes by last-write-wins.
    #[must_use]
    pub fn start(manager: Arc<ConnectionManager>) -> Self {
        Self::start_with_strategy(manager, ConflictStrategy::LastWriteWins)
    }

    /// Starts the flusher with an explicit coalescing strategy.
    #[must_use]
    pub fn start_with_strategy(
        manager: Arc<ConnectionManager>,
        strategy: ConflictStrategy,
    ) -> Self {
        let config = manager.config();
        let inner = Arc::new(EngineInner {
            strategy,
            debounce: config.debounce,
            batch_size: config.batch_size.max(1),
            batch_timeout: config.batch_timeout,
            manager,
            pending: Mutex::new(HashMap::new()),
            wake: Notify::new(),
        });
        let (shutdown, rx) = watch::channel(false);
        let flusher = tokio::spawn(run_flusher(Arc::clone(&inner), rx));
        tracing::info!(
            debounce_ms = inner.debounce.as_millis() as u64,
            batch_size = inner.batch_size,
            "persistence engine started"
        );
        Self {
            inner,
            shutdown,
            flusher: Mutex::new(Some(flusher)),
        }
    }

    /// Records a widget-state write in memory and arms its debounce
    /// window. A pending entry for the same `(session, key)` is
    /// coalesced under the engine's conflict strategy; nothing touches
    /// the database here.
    #[allow(clippy::too_many_arguments)]
    pub fn schedule_write(
        &self,
        session_id: &str,
        key: &str,
        value: Value,
        type_tag: &str,
        is_valid: bool,
        errors: Vec<String>,
        warnings: Vec<String>,
    ) {
        let mut record = WidgetStateRecord::new(session_id, key, value).with_type_tag(type_tag);
        record.is_valid = is_valid;
        record.errors = errors;
        record.warnings = warnings;

        let now = Instant::now();
        let mut pending = self.inner.lock_pending();
        match pending.entry((session_id.to_owned(), key.to_owned())) {
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                record.version = existing.record.version;
                existing.record = resolve(&existing.record, &record, &self.inner.strategy);
                existing.last_write = now;
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(Pending {
                    record,
                    first_seen: now,
                    last_write: now,
                    retried: false,
                });
            }
        }
        drop(pending);
        // Re-arm the flusher's sleep; the new entry may carry the
        // earliest deadline, or may have just filled the batch.
        self.inner.wake.notify_one();
    }

    /// Flushes everything pending right now. Entries that fail their
    /// re-queue attempt are dropped and surfaced as
    /// [`StoreError::PersistenceFlush`].
    ///
    /// # Errors
    ///
    /// [`StoreError::PersistenceFlush`] when entries were dropped;
    /// other [`StoreError`] values when the flush cannot run at all.
    pub async fn flush(&self) -> Result<FlushReport, StoreError> {
        let report = self.inner.flush_all().await?;
        if report.dropped > 0 {
            let keys = report
                .dropped_keys
                .iter()
                .map(|(session, key)| format!("{session}/{key}"))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(StoreError::PersistenceFlush {
                dropped: usize::try_from(report.dropped).unwrap_or(usize::MAX),
                detail: format!(
                    "{} written, {} re-queued; dropped: {keys}",
                    report.written, report.requeued
                ),
            });
        }
        Ok(report)
    }

    /// Loads every widget state for a session, keyed by widget key.
    /// Pending writes for any session are flushed first so the result
    /// reflects the latest scheduled values.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the flush, the query, or row
    /// decoding fails.
    pub async fn recover(
        &self,
        session_id: &str,
    ) -> Result<BTreeMap<String, WidgetStateRecord>, StoreError> {
        self.inner.flush_all().await?;
        let mut session = self.inner.manager.acquire_session().await?;
        let rows: Vec<WidgetStateRow> = sqlx::query_as(
            "SELECT session_id, key, value, type_tag, is_valid, errors, warnings, \
             updated_at, version FROM widget_states WHERE session_id = ?1",
        )
        .bind(session_id)
        .fetch_all(&mut *session)
        .await?;
        rows.into_iter()
            .map(|row| {
                let record = row.into_record()?;
                Ok((record.key.clone(), record))
            })
            .collect()
    }

    /// Deletes widget rows untouched for longer than `older_than`.
    /// Returns how many rows were removed.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when no connection can be acquired or
    /// the delete fails.
    pub async fn purge_stale(&self, older_than: chrono::Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - older_than;
        let mut session = self.inner.manager.acquire_session().await?;
        let result = sqlx::query("DELETE FROM widget_states WHERE updated_at < ?1")
            .bind(cutoff)
            .execute(&mut *session)
            .await?;
        let purged = result.rows_affected();
        if purged > 0 {
            tracing::info!(purged, %cutoff, "purged stale widget states");
        }
        Ok(purged)
    }

    /// Number of writes waiting to be flushed.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.inner.lock_pending().len()
    }

    /// Stops the flusher task and performs one final flush of whatever
    /// is still pending.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the final flush cannot run.
    pub async fn shutdown(&self) -> Result<FlushReport, StoreError> {
        let _ = self.shutdown.send(true);
        let handle = {
            let mut slot = match self.flusher.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.take()
        };
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "persistence flusher ended abnormally");
        }
        let report = self.inner.flush_all().await?;
        tracing::info!(written = report.written, "persistence engine stopped");
        Ok(report)
    }
}

impl EngineInner {
    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<PendingKey, Pending>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn deadline(&self, entry: &Pending) -> Instant {
        (entry.first_seen + self.batch_timeout).min(entry.last_write + self.debounce)
    }

    /// Earliest instant at which something becomes due, or `None` when
    /// the map is empty. A full map is due immediately.
    fn next_wake(&self) -> Option<Instant> {
        let pending = self.lock_pending();
        if pending.is_empty() {
            return None;
        }
        if pending.len() >= self.batch_size {
            return Some(Instant::now());
        }
        pending.values().map(|p| self.deadline(p)).min()
    }

    async fn flush_due(&self, now: Instant) -> Result<FlushReport, StoreError> {
        let mut batch: Vec<(PendingKey, WidgetStateRecord, bool)> = Vec::new();
        {
            let mut pending = self.lock_pending();
            let flush_all = pending.len() >= self.batch_size
                || pending
                    .values()
                    .any(|p| now >= p.first_seen + self.batch_timeout);
            pending.retain(|key, entry| {
                if flush_all || now >= self.deadline(entry) {
                    batch.push((key.clone(), entry.record.clone(), entry.retried));
                    false
                } else {
                    true
                }
            });
        }
        self.write_batch(batch).await
    }

    async fn flush_all(&self) -> Result<FlushReport, StoreError> {
        let batch: Vec<(PendingKey, WidgetStateRecord, bool)> = self
            .lock_pending()
            .drain()
            .map(|(k, p)| (k, p.record, p.retried))
            .collect();
        self.write_batch(batch).await
    }

    async fn write_batch(
        &self,
        batch: Vec<(PendingKey, WidgetStateRecord, bool)>,
    ) -> Result<FlushReport, StoreError> {
        if batch.is_empty() {
            return Ok(FlushReport::default());
        }
        let records: Vec<&WidgetStateRecord> = batch.iter().map(|(_, r, _)| r).collect();
        match self.upsert_chunked(&records).await {
            Ok(()) => {
                let written = batch.len() as u64;
                tracing::debug!(written, "flushed widget-state batch");
                Ok(FlushReport {
                    written,
                    ..FlushReport::default()
                })
            }
            Err(batch_err) => {
                tracing::warn!(error = %batch_err, "batch flush failed, retrying per row");
                let mut report = FlushReport::default();
                for (key, record, retried) in batch {
                    match self.upsert_one(&record).await {
                        Ok(()) => report.written += 1,
                        Err(row_err) if retried => {
                            tracing::error!(
                                session_id = %key.0,
                                key = %key.1,
                                error = %row_err,
                                "dropping widget state after failed re-queue"
                            );
                            report.dropped += 1;
                            report.dropped_keys.push(key);
                        }
                        Err(row_err) => {
                            tracing::warn!(
                                session_id = %key.0,
                                key = %key.1,
                                error = %row_err,
                                "re-queueing widget state after flush failure"
                            );
                            self.requeue(key, record);
                            report.requeued += 1;
                        }
                    }
                }
                Ok(report)
            }
        }
    }

    async fn upsert_chunked(&self, records: &[&WidgetStateRecord]) -> Result<(), StoreError> {
        let mut scoped = self.manager.begin().await?;
        for chunk in records.chunks(UPSERT_CHUNK) {
            let mut serialized = Vec::with_capacity(chunk.len());
            for record in chunk {
                serialized.push((
                    *record,
                    serde_json::to_string(&record.value)?,
                    serde_json::to_string(&record.errors)?,
                    serde_json::to_string(&record.warnings)?,
                ));
            }
            let mut qb = QueryBuilder::new(
                "INSERT INTO widget_states \
                 (session_id, key, value, type_tag, is_valid, errors, warnings, \
                  updated_at, version) ",
            );
            qb.push_values(&serialized, |mut b, (record, value, errors, warnings)| {
                b.push_bind(record.session_id.as_str())
                    .push_bind(record.key.as_str())
                    .push_bind(value.as_str())
                    .push_bind(record.type_tag.as_str())
                    .push_bind(record.is_valid)
                    .push_bind(errors.as_str())
                    .push_bind(warnings.as_str())
                    .push_bind(record.updated_at)
                    .push_bind(1_i64);
            });
            qb.push(
                " ON CONFLICT(session_id, key) DO UPDATE SET \
                 value = excluded.value, type_tag = excluded.type_tag, \
                 is_valid = excluded.is_valid, errors = excluded.errors, \
                 warnings = excluded.warnings, updated_at = excluded.updated_at, \
                 version = widget_states.version + 1",
            );
            let tx = scoped
                .tx_mut()
                .ok_or_else(|| StoreError::Database("transaction already completed".into()))?;
            qb.build().execute(&mut **tx).await?;
        }
        scoped.commit().await
    }

    async fn upsert_one(&self, record: &WidgetStateRecord) -> Result<(), StoreError> {
        let mut session = self.manager.acquire_session().await?;
        sqlx::query(
            "INSERT INTO widget_states \
             (session_id, key, value, type_tag, is_valid, errors, warnings, \
              updated_at, version) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1) \
             ON CONFLICT(session_id, key) DO UPDATE SET \
             value = excluded.value, type_tag = excluded.type_tag, \
             is_valid = excluded.is_valid, errors = excluded.errors, \
             warnings = excluded.warnings, updated_at = excluded.updated_at, \
             version = widget_states.version + 1",
        )
        .bind(&record.session_id)
        .bind(&record.key)
        .bind(serde_json::to_string(&record.value)?)
        .bind(&record.type_tag)
        .bind(record.is_valid)
        .bind(serde_json::to_string(&record.errors)?)
        .bind(serde_json::to_string(&record.warnings)?)
        .bind(record.updated_at)
        .execute(&mut *session)
        .await?;
        Ok(())
    }

    fn requeue(&self, key: PendingKey, record: WidgetStateRecord) {
        let now = Instant::now();
        let mut pending = self.lock_pending();
        match pending.entry(key) {
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                // A newer write arrived while this one was failing;
                // coalesce and keep the retry marker.
                let existing = slot.get_mut();
                existing.record = resolve(&record, &existing.record, &self.strategy);
                existing.retried = true;
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(Pending {
                    record,
                    first_seen: now,
                    last_write: now,
                    retried: true,
                });
            }
        }
    }
}

async fn run_flusher(inner: Arc<EngineInner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let next = inner.next_wake();
        let sleep = async {
            match next {
                Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = shutdown.changed() => break,
            () = inner.wake.notified() => {}
            () = sleep => {
                if let Err(e) = inner.flush_due(Instant::now()).await {
                    tracing::error!(error = %e, "widget-state flush failed");
                }
            }
        }
    }
    if let Err(e) = inner.flush_all().await {
        tracing::error!(error = %e, "final widget-state flush failed");
    }
}
