//! Transaction boundary contract.
//!
//! Stores that take part in a transaction discover it through ambient context
//! (for example a task-local in the Postgres implementation). The manager only
//! scopes a unit of work: commit when it succeeds, roll back when it fails.

use crate::error::BoxError;
use futures::future::BoxFuture;
use thiserror::Error;

/// Failure of a transactional unit of work.
#[derive(Error, Debug)]
pub enum TransactionError {
    /// The work itself failed; the transaction was rolled back.
    #[error("{0}")]
    Aborted(#[source] BoxError),

    /// The transaction could not be started.
    #[error("Failed to begin transaction: {0}")]
    Begin(String),

    /// The work succeeded but the commit failed.
    #[error("Failed to commit transaction: {0}")]
    Commit(String),

    /// The work failed and the rollback failed too.
    #[error("Failed to roll back transaction: {message}")]
    Rollback {
        /// Rollback failure.
        message: String,
        /// Error of the work that triggered the rollback.
        #[source]
        cause: BoxError,
    },
}

impl TransactionError {
    /// Recover the error of the work when the transaction itself was fine.
    ///
    /// # Errors
    ///
    /// Returns `self` unchanged when the failure came from the transaction.
    pub fn into_aborted(self) -> Result<BoxError, Self> {
        match self {
            Self::Aborted(error) => Ok(error),
            other => Err(other),
        }
    }
}

/// Runs units of work inside a transaction.
pub trait TransactionManager: Send + Sync {
    /// Run `work` in a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::Aborted`] with the work's error when the
    /// work fails, or another variant when the transaction itself fails.
    fn in_transaction<'a>(
        &'a self,
        work: BoxFuture<'a, Result<(), BoxError>>,
    ) -> BoxFuture<'a, Result<(), TransactionError>>;
}

/// Transaction manager for deployments without a relational store; runs the
/// work directly.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoTransaction;

impl TransactionManager for NoTransaction {
    fn in_transaction<'a>(
        &'a self,
        work: BoxFuture<'a, Result<(), BoxError>>,
    ) -> BoxFuture<'a, Result<(), TransactionError>> {
        Box::pin(async move { work.await.map_err(TransactionError::Aborted) })
    }
}
