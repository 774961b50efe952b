//! A transaction shared across repositories, with savepoint nesting.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::Mutex;

use super::audit::AuditContext;
use super::entity::Entity;
use super::repository::{Repository, SharedTx};
use crate::error::StoreError;
use crate::pool::{ConnectionManager, ScopedTransaction};

/// Groups operations from any number of repositories into one
/// transaction.
///
/// Repositories obtained through [`repository`] enlist in the shared
/// transaction instead of committing per operation. Nothing is visible
/// to other connections until [`commit`]; dropping the unit of work
/// without committing rolls everything back.
///
/// [`repository`]: Self::repository
/// [`commit`]: Self::commit
#[derive(Debug)]
pub struct UnitOfWork {
    shared: SharedTx,
    ctx: AuditContext,
    savepoint_seq: AtomicU32,
}

impl UnitOfWork {
    /// Opens a transaction on a pooled connection.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when no connection can be acquired or
    /// the transaction cannot be opened.
    pub async fn begin(
        manager: &ConnectionManager,
        ctx: AuditContext,
    ) -> Result<Self, StoreError> {
        let tx = manager.begin().await?;
        Ok(Self {
            shared: Arc::new(Mutex::new(Some(tx))),
            ctx,
            savepoint_seq: AtomicU32::new(0),
        })
    }

    /// A repository for `T` that runs inside this transaction and
    /// inherits this unit of work's audit context.
    #[must_use]
    pub fn repository<T: Entity>(&self) -> Repository<T> {
        Repository::for_unit_of_work(Arc::clone(&self.shared), self.ctx.clone())
    }

    /// Opens a nested savepoint. Rolling the savepoint back undoes only
    /// the work done since it was opened; the outer transaction keeps
    /// its earlier writes.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the transaction has already
    /// completed or the savepoint statement fails.
    pub async fn savepoint(&self) -> Result<Savepoint<'_>, StoreError> {
        let name = format!("sp_{}", self.savepoint_seq.fetch_add(1, Ordering::Relaxed));
        exec(&self.shared, &format!("SAVEPOINT {name}")).await?;
        Ok(Savepoint {
            shared: &self.shared,
            name,
        })
    }

    /// Commits every operation performed through this unit of work.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the transaction has already
    /// completed or the commit fails.
    pub async fn commit(self) -> Result<(), StoreError> {
        let tx = self.take_tx().await?;
        tx.commit().await
    }

    /// Discards every operation performed through this unit of work.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the transaction has already
    /// completed or the rollback fails.
    pub async fn rollback(self) -> Result<(), StoreError> {
        let tx = self.take_tx().await?;
        tx.rollback().await
    }

    async fn take_tx(&self) -> Result<ScopedTransaction, StoreError> {
        self.shared
            .lock()
            .await
            .take()
            .ok_or_else(|| StoreError::Database("transaction already completed".into()))
    }
}

/// An open savepoint inside a [`UnitOfWork`]. Must be resolved with
/// [`release`] or [`rollback`]; an unresolved savepoint simply follows
/// the outer transaction's fate.
///
/// [`release`]: Self::release
/// [`rollback`]: Self::rollback
#[derive(Debug)]
pub struct Savepoint<'a> {
    shared: &'a SharedTx,
    name: String,
}

impl Savepoint<'_> {
    /// Folds the savepoint's work into the outer transaction.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the outer transaction has already
    /// completed or the release statement fails.
    pub async fn release(self) -> Result<(), StoreError> {
        exec(self.shared, &format!("RELEASE SAVEPOINT {}", self.name)).await
    }

    /// Undoes everything since the savepoint was opened.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the outer transaction has already
    /// completed or the rollback statement fails.
    pub async fn rollback(self) -> Result<(), StoreError> {
        exec(
            self.shared,
            &format!("ROLLBACK TO SAVEPOINT {}", self.name),
        )
        .await?;
        exec(self.shared, &format!("RELEASE SAVEPOINT {}", self.name)).await
    }
}

async fn exec(shared: &SharedTx, sql: &str) -> Result<(), StoreError> {
    let mut guard = shared.lock().await;
    let tx = guard
        .as_mut()
        .and_then(ScopedTransaction::tx_mut)
        .ok_or_else(|| StoreError::Database("transaction already completed".into()))?;
    sqlx::query(sql).execute(&mut **tx).await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::config::StoreConfig;
    use crate::repository::Filters;
    use crate::schema;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Order {
        item: String,
        quantity: u32,
    }

    impl Entity for Order {
        const TABLE: &'static str = "orders";
    }

    fn order(item: &str) -> Order {
        Order {
            item: item.to_owned(),
            quantity: 1,
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
        if let Err(e) = schema::ensure_entity_table::<Order>(&manager).await {
            panic!("orders table setup failed: {e}");
        }
        manager
    }

    #[tokio::test]
    async fn committed_work_is_visible_afterwards() {
        let manager = setup("uow_commit").await;
        let uow = match UnitOfWork::begin(&manager, AuditContext::new("tester")).await {
            Ok(uow) => uow,
            Err(e) => panic!("begin failed: {e}"),
        };
        let repo = uow.repository::<Order>();
        let Ok(a) = repo.create(order("bolt")).await else {
            panic!("create failed");
        };
        let Ok(_) = repo.update(a.id, json!({"quantity": 4}), None).await else {
            panic!("update failed");
        };
        assert!(uow.commit().await.is_ok());

        let outside = Repository::<Order>::new(manager);
        let Ok(Some(after)) = outside.get_by_id(a.id, false).await else {
            panic!("committed row missing");
        };
        assert_eq!(after.data.quantity, 4);
        assert_eq!(after.version, 2);
    }

    #[tokio::test]
    async fn rollback_discards_everything() {
        let manager = setup("uow_rollback").await;
        let uow = match UnitOfWork::begin(&manager, AuditContext::new("tester")).await {
            Ok(uow) => uow,
            Err(e) => panic!("begin failed: {e}"),
        };
        let repo = uow.repository::<Order>();
        let Ok(_) = repo.create(order("nut")).await else {
            panic!("create failed");
        };
        let Ok(_) = repo.create(order("washer")).await else {
            panic!("create failed");
        };
        assert!(uow.rollback().await.is_ok());

        let outside = Repository::<Order>::new(manager);
        let Ok(count) = outside.count(&Filters::new()).await else {
            panic!("count failed");
        };
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn dropping_without_commit_rolls_back() {
        let manager = setup("uow_drop").await;
        {
            let uow = match UnitOfWork::begin(&manager, AuditContext::new("tester")).await {
                Ok(uow) => uow,
                Err(e) => panic!("begin failed: {e}"),
            };
            let repo = uow.repository::<Order>();
            let Ok(_) = repo.create(order("gasket")).await else {
                panic!("create failed");
            };
        }
        let outside = Repository::<Order>::new(manager);
        let Ok(count) = outside.count(&Filters::new()).await else {
            panic!("count failed");
        };
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn savepoint_rollback_keeps_outer_writes() {
        let manager = setup("uow_savepoint").await;
        let uow = match UnitOfWork::begin(&manager, AuditContext::new("tester")).await {
            Ok(uow) => uow,
            Err(e) => panic!("begin failed: {e}"),
        };
        let repo = uow.repository::<Order>();
        let Ok(kept) = repo.create(order("keep")).await else {
            panic!("create failed");
        };

        let Ok(sp) = uow.savepoint().await else {
            panic!("savepoint failed");
        };
        let Ok(_) = repo.create(order("discard")).await else {
            panic!("create failed");
        };
        assert!(sp.rollback().await.is_ok());

        let Ok(sp2) = uow.savepoint().await else {
            panic!("savepoint failed");
        };
        let Ok(also_kept) = repo.create(order("also-keep")).await else {
            panic!("create failed");
        };
        assert!(sp2.release().await.is_ok());
        assert!(uow.commit().await.is_ok());

        let outside = Repository::<Order>::new(manager);
        let Ok(all) = outside.get_all(None, None, false).await else {
            panic!("get_all failed");
        };
        let items: Vec<&str> = all.iter().map(|s| s.data.item.as_str()).collect();
        assert!(items.contains(&"keep"));
        assert!(items.contains(&"also-keep"));
        assert!(!items.contains(&"discard"));
        assert!(matches!(outside.get_by_id(kept.id, false).await, Ok(Some(_))));
        assert!(matches!(
            outside.get_by_id(also_kept.id, false).await,
            Ok(Some(_))
        ));
    }

    #[tokio::test]
    async fn repository_after_commit_reports_completed_transaction() {
        let manager = setup("uow_completed").await;
        let uow = match UnitOfWork::begin(&manager, AuditContext::new("tester")).await {
            Ok(uow) => uow,
            Err(e) => panic!("begin failed: {e}"),
        };
        let repo = uow.repository::<Order>();
        assert!(uow.commit().await.is_ok());
        let Err(StoreError::Database(msg)) = repo.create(order("late")).await else {
            panic!("expected completed-transaction error");
        };
        assert!(msg.contains("already completed"));
    }
}
