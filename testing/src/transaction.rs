//! Transaction manager that counts outcomes.

use eventstore_tools_core::BoxError;
use eventstore_tools_core::transaction::{TransactionError, TransactionManager};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Runs each unit of work directly and records whether it would have been
/// committed or rolled back.
///
/// Stores are not rolled back; tests assert on the counters.
#[derive(Clone, Debug, Default)]
pub struct RecordingTransactionManager {
    committed: Arc<AtomicUsize>,
    rolled_back: Arc<AtomicUsize>,
    fail_commits: Arc<AtomicBool>,
}

impl RecordingTransactionManager {
    /// Create a manager with zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Units of work that succeeded.
    #[must_use]
    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::SeqCst)
    }

    /// Units of work that failed.
    #[must_use]
    pub fn rolled_back(&self) -> usize {
        self.rolled_back.load(Ordering::SeqCst)
    }

    /// Fail every commit while `fail` is set.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }
}

impl TransactionManager for RecordingTransactionManager {
    fn in_transaction<'a>(
        &'a self,
        work: BoxFuture<'a, Result<(), BoxError>>,
    ) -> BoxFuture<'a, Result<(), TransactionError>> {
        Box::pin(async move {
            match work.await {
                Ok(()) if self.fail_commits.load(Ordering::SeqCst) => {
                    self.rolled_back.fetch_add(1, Ordering::SeqCst);
                    Err(TransactionError::Commit("commit rejected".into()))
                }
                Ok(()) => {
                    self.committed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                Err(err) => {
                    self.rolled_back.fetch_add(1, Ordering::SeqCst);
                    Err(TransactionError::Aborted(err))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_outcomes() {
        let manager = RecordingTransactionManager::new();
        assert!(manager.in_transaction(Box::pin(async { Ok(()) })).await.is_ok());
        let failed = manager
            .in_transaction(Box::pin(async { Err::<(), BoxError>("boom".into()) }))
            .await;

        assert!(matches!(failed, Err(TransactionError::Aborted(_))));
        assert_eq!(manager.committed(), 1);
        assert_eq!(manager.rolled_back(), 1);
    }
}
