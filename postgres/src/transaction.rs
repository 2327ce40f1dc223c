//! Task-local transactions.
//!
//! [`PostgresTransactionManager::in_transaction`] opens a transaction and
//! runs the unit of work with it installed in a task-local slot. Every store
//! of this crate executes its statements in that transaction while the slot
//! is set, so a handler's checkpoint, idempotency record and (through
//! [`PostgresTransactionManager::with_transaction`]) its own writes commit or
//! roll back together.
//!
//! Nested units of work join the outer transaction. Tasks spawned by the
//! work do not inherit the slot.

use eventstore_tools_core::BoxError;
use eventstore_tools_core::transaction::{TransactionError, TransactionManager};
use futures::future::BoxFuture;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use std::sync::Arc;
use tokio::sync::Mutex;

type Slot = Arc<Mutex<Option<Transaction<'static, Postgres>>>>;

tokio::task_local! {
    static CURRENT: Slot;
}

pub(crate) fn current_transaction() -> Option<Slot> {
    CURRENT.try_with(Arc::clone).ok()
}

/// Transaction manager over a connection pool.
#[derive(Clone, Debug)]
pub struct PostgresTransactionManager {
    pool: PgPool,
}

impl PostgresTransactionManager {
    /// Manager opening transactions on `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run `f` on the connection of the current transaction.
    ///
    /// Returns `None` when called outside a unit of work.
    ///
    /// # Errors
    ///
    /// Returns the error of `f`.
    pub async fn with_transaction<T, F>(f: F) -> Option<Result<T, sqlx::Error>>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, sqlx::Error>>,
    {
        let slot = current_transaction()?;
        let mut guard = slot.lock().await;
        let transaction = guard.as_mut()?;
        Some(f(&mut **transaction).await)
    }
}

impl TransactionManager for PostgresTransactionManager {
    fn in_transaction<'a>(
        &'a self,
        work: BoxFuture<'a, Result<(), BoxError>>,
    ) -> BoxFuture<'a, Result<(), TransactionError>> {
        Box::pin(async move {
            if current_transaction().is_some() {
                return work.await.map_err(TransactionError::Aborted);
            }

            let transaction = self
                .pool
                .begin()
                .await
                .map_err(|e| TransactionError::Begin(e.to_string()))?;
            let slot: Slot = Arc::new(Mutex::new(Some(transaction)));
            let result = CURRENT.scope(Arc::clone(&slot), work).await;

            let Some(transaction) = slot.lock().await.take() else {
                return Err(TransactionError::Commit("transaction is gone".to_string()));
            };
            match result {
                Ok(()) => transaction
                    .commit()
                    .await
                    .map_err(|e| TransactionError::Commit(e.to_string())),
                Err(cause) => match transaction.rollback().await {
                    Ok(()) => Err(TransactionError::Aborted(cause)),
                    Err(e) => {
                        tracing::error!(error = %e, cause = %cause, "Failed to roll back transaction");
                        Err(TransactionError::Rollback {
                            message: e.to_string(),
                            cause,
                        })
                    }
                },
            }
        })
    }
}
