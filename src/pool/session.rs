//! Scoped session and transaction guards.
//!
//! Both guards register with the leak detector on checkout and
//! deregister on `Drop`, so the registry stays accurate on every exit
//! path: normal return, error propagation, and cancellation (a dropped
//! future drops the guard). [`ScopedTransaction`] additionally carries
//! sqlx's rollback-on-drop semantics: a scope that exits without
//! `commit()` rolls back and the connection returns to the pool.

use std::ops::{Deref, DerefMut};
use std::time::Instant;

use sqlx::Sqlite;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::SqliteConnection;
use uuid::Uuid;

use crate::StoreError;
use crate::pool::leak::LeakDetector;

/// Checkout lease: deregisters from the leak registry on drop and
/// records the hold duration into the rolling average.
#[derive(Debug)]
pub(crate) struct Lease {
    detector: LeakDetector,
    id: Option<Uuid>,
    started: Instant,
}

impl Lease {
    pub(crate) fn begin(detector: &LeakDetector, owner: &str) -> Self {
        Self {
            detector: detector.clone(),
            id: detector.checkout(owner),
            started: Instant::now(),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.detector.checkin(id, self.started.elapsed());
        }
    }
}

/// A pooled connection checked out for one logical operation.
///
/// Derefs to the underlying [`SqliteConnection`]; dropping it returns
/// the connection to the pool and deregisters the checkout.
#[derive(Debug)]
pub struct ScopedSession {
    conn: PoolConnection<Sqlite>,
    _lease: Lease,
}

impl ScopedSession {
    pub(crate) fn new(conn: PoolConnection<Sqlite>, lease: Lease) -> Self {
        Self {
            conn,
            _lease: lease,
        }
    }
}

impl Deref for ScopedSession {
    type Target = SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for ScopedSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

/// A transaction-scoped session with guaranteed release.
///
/// Commit on [`ScopedTransaction::commit`], rollback on
/// [`ScopedTransaction::rollback`] **or on drop**, so cancellation of the
/// owning future therefore rolls back rather than leaving the
/// connection held.
#[derive(Debug)]
pub struct ScopedTransaction {
    tx: Option<sqlx::Transaction<'static, Sqlite>>,
    _lease: Lease,
}

impl ScopedTransaction {
    pub(crate) fn new(tx: sqlx::Transaction<'static, Sqlite>, lease: Lease) -> Self {
        Self {
            tx: Some(tx),
            _lease: lease,
        }
    }

    /// Mutable access to the inner transaction for running queries.
    /// `None` only after the transaction has been consumed.
    #[must_use]
    pub fn tx_mut(&mut self) -> Option<&mut sqlx::Transaction<'static, Sqlite>> {
        self.tx.as_mut()
    }

    /// Commits the transaction and returns the connection to the pool.
    ///
    /// # Errors
    ///
    /// Returns a classified [`StoreError`] if the commit fails; the
    /// connection is still released.
    pub async fn commit(mut self) -> Result<(), StoreError> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    /// Rolls back the transaction and returns the connection to the pool.
    ///
    /// # Errors
    ///
    /// Returns a classified [`StoreError`] if the rollback fails; the
    /// connection is still released.
    pub async fn rollback(mut self) -> Result<(), StoreError> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}
