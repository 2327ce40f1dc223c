//! Per-record features wrapped around method dispatch.
//!
//! Features run once per delivered record, outside the per-method
//! extensions. They are listed outermost first and composed with a fold:
//!
//! - catch-up: [`InTransaction`] → [`StoreCheckpoint`] → [`EventIdempotency`]
//! - persistent: [`InTransaction`] → [`EventIdempotency`]
//!
//! so the checkpoint write and the idempotency insert commit or roll back
//! together with the handler's own writes.

use crate::error::DispatchError;
use crate::idempotency::{EventIdempotencyStorage, StoreOutcome};
use crate::metrics::DispatchMetrics;
use eventstore_tools_core::BoxError;
use eventstore_tools_core::checkpoint::CheckpointStore;
use eventstore_tools_core::record::StreamRecord;
use eventstore_tools_core::store::stored_sequence;
use eventstore_tools_core::transaction::{TransactionError, TransactionManager};
use futures::future::BoxFuture;
use std::sync::Arc;

/// Future of the dispatch of one record.
pub type DispatchFuture<'a> = BoxFuture<'a, Result<(), DispatchError>>;

/// What a feature knows about the record it wraps.
#[derive(Debug, Clone, Copy)]
pub struct RecordContext<'a> {
    /// Handler name.
    pub handler: &'a str,
    /// Stream the handler subscribes to.
    pub stream_name: &'a str,
    /// Consumer group.
    pub group_name: &'a str,
    /// Resolved record.
    pub record: &'a StreamRecord,
    /// Position in the subscribed stream, the link's when the record was
    /// delivered through one.
    pub original_sequence: u64,
}

/// Cross-cutting behaviour around the dispatch of one record.
pub trait Feature: Send + Sync {
    /// Wrap `next`, the remaining chain. Call it only after this feature's
    /// own work succeeded.
    fn wrap<'a>(&'a self, ctx: &'a RecordContext<'a>, next: DispatchFuture<'a>) -> DispatchFuture<'a>;
}

/// Wrap `endpoint` in `features`, the first one outermost.
pub fn compose<'a>(
    features: &'a [Arc<dyn Feature>],
    ctx: &'a RecordContext<'a>,
    endpoint: DispatchFuture<'a>,
) -> DispatchFuture<'a> {
    features
        .iter()
        .rev()
        .fold(endpoint, |next, feature| feature.wrap(ctx, next))
}

/// Runs the rest of the chain in one transaction.
pub struct InTransaction {
    manager: Arc<dyn TransactionManager>,
}

impl InTransaction {
    /// Use `manager` as the transaction boundary.
    #[must_use]
    pub fn new(manager: Arc<dyn TransactionManager>) -> Self {
        Self { manager }
    }
}

impl Feature for InTransaction {
    fn wrap<'a>(&'a self, _ctx: &'a RecordContext<'a>, next: DispatchFuture<'a>) -> DispatchFuture<'a> {
        Box::pin(async move {
            let work: BoxFuture<'a, Result<(), BoxError>> =
                Box::pin(async move { next.await.map_err(|err| Box::new(err) as BoxError) });

            match self.manager.in_transaction(work).await {
                Ok(()) => Ok(()),
                Err(err) => Err(unwrap_aborted(err)),
            }
        })
    }
}

fn unwrap_aborted(err: TransactionError) -> DispatchError {
    match err.into_aborted() {
        Ok(aborted) => match aborted.downcast::<DispatchError>() {
            Ok(dispatch) => *dispatch,
            Err(other) => DispatchError::Transaction(TransactionError::Aborted(other)),
        },
        Err(other) => DispatchError::Transaction(other),
    }
}

/// Advances the group's checkpoint to the record before handling it.
///
/// The store only accepts strictly greater values. A rejected write means
/// another consumer got there first and fails the dispatch with
/// [`DispatchError::CheckpointOutdated`].
pub struct StoreCheckpoint {
    store: Arc<dyn CheckpointStore>,
}

impl StoreCheckpoint {
    /// Write checkpoints to `store`.
    #[must_use]
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }
}

impl Feature for StoreCheckpoint {
    fn wrap<'a>(&'a self, ctx: &'a RecordContext<'a>, next: DispatchFuture<'a>) -> DispatchFuture<'a> {
        Box::pin(async move {
            let sequence = stored_sequence(ctx.original_sequence)?;
            let updated = self
                .store
                .increment_if_greater(ctx.group_name, ctx.stream_name, sequence)
                .await?;

            if updated == 0 {
                tracing::error!(
                    handler = ctx.handler,
                    group_name = ctx.group_name,
                    stream_name = ctx.stream_name,
                    sequence,
                    "Checkpoint is outdated, another consumer is active for this group"
                );
                return Err(DispatchError::CheckpointOutdated {
                    group_name: ctx.group_name.to_string(),
                    stream_name: ctx.stream_name.to_string(),
                    sequence,
                });
            }

            tracing::trace!(
                group_name = ctx.group_name,
                stream_name = ctx.stream_name,
                sequence,
                "Checkpoint advanced"
            );
            next.await
        })
    }
}

/// Skips records the group already handled.
pub struct EventIdempotency {
    storage: EventIdempotencyStorage,
}

impl EventIdempotency {
    /// Gate records through `storage`.
    #[must_use]
    pub const fn new(storage: EventIdempotencyStorage) -> Self {
        Self { storage }
    }
}

impl Feature for EventIdempotency {
    fn wrap<'a>(&'a self, ctx: &'a RecordContext<'a>, next: DispatchFuture<'a>) -> DispatchFuture<'a> {
        Box::pin(async move {
            let outcome = self
                .storage
                .store_record(ctx.stream_name, ctx.group_name, ctx.record)
                .await?;

            match outcome {
                StoreOutcome::Stored => next.await,
                StoreOutcome::AlreadyHandled => {
                    tracing::warn!(
                        handler = ctx.handler,
                        event_id = %ctx.record.event_ids().effective(),
                        event_type = %ctx.record.event_type,
                        stream_id = %ctx.record.stream_id,
                        group_name = ctx.group_name,
                        "Event already handled, skipping"
                    );
                    DispatchMetrics::record_duplicate(ctx.handler);
                    Ok(())
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use eventstore_tools_core::store::StoreError;
    use eventstore_tools_core::stream::StreamId;
    use eventstore_tools_testing::{
        InMemoryCheckpointStore, InMemoryIdempotencyStore, RecordingTransactionManager,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn record(sequence: u64) -> StreamRecord {
        StreamRecord {
            event_id: Uuid::new_v4(),
            stream_id: StreamId::new("Order-1"),
            sequence,
            event_type: "OrderPlaced".to_string(),
            data: b"{}".to_vec(),
            metadata: Vec::new(),
            created: Utc::now(),
        }
    }

    fn ctx(record: &StreamRecord) -> RecordContext<'_> {
        RecordContext {
            handler: "orders",
            stream_name: "Order-1",
            group_name: "group",
            record,
            original_sequence: record.sequence,
        }
    }

    fn counting(calls: &AtomicUsize) -> DispatchFuture<'_> {
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[tokio::test]
    async fn checkpoint_advances_then_rejects_older_records() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        store.create_if_not_exists("group", "Order-1", None).await.unwrap();
        let features: Vec<Arc<dyn Feature>> = vec![Arc::new(StoreCheckpoint::new(store.clone()))];
        let calls = AtomicUsize::new(0);

        let second = record(5);
        compose(&features, &ctx(&second), counting(&calls)).await.unwrap();

        let first = record(3);
        let result = compose(&features, &ctx(&first), counting(&calls)).await;

        assert!(matches!(result, Err(DispatchError::CheckpointOutdated { sequence: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let current = store.current("group", "Order-1").await.unwrap().unwrap();
        assert_eq!(current.checkpoint, Some(5));
    }

    #[tokio::test]
    async fn sequence_beyond_the_column_fails_instead_of_saturating() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        store.create_if_not_exists("group", "Order-1", None).await.unwrap();
        let features: Vec<Arc<dyn Feature>> = vec![Arc::new(StoreCheckpoint::new(store.clone()))];
        let calls = AtomicUsize::new(0);

        let huge = record(u64::MAX);
        let result = compose(&features, &ctx(&huge), counting(&calls)).await;

        assert!(matches!(
            result,
            Err(DispatchError::Store(StoreError::SequenceOutOfRange(u64::MAX)))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let current = store.current("group", "Order-1").await.unwrap().unwrap();
        assert_eq!(current.checkpoint, None);
    }

    #[tokio::test]
    async fn duplicate_record_skips_next() {
        let storage = EventIdempotencyStorage::new(Arc::new(InMemoryIdempotencyStore::new()));
        let features: Vec<Arc<dyn Feature>> = vec![Arc::new(EventIdempotency::new(storage))];
        let calls = AtomicUsize::new(0);
        let record = record(0);

        compose(&features, &ctx(&record), counting(&calls)).await.unwrap();
        compose(&features, &ctx(&record), counting(&calls)).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_inside_transaction_rolls_back_and_keeps_error() {
        let transactions = Arc::new(RecordingTransactionManager::new());
        let features: Vec<Arc<dyn Feature>> = vec![Arc::new(InTransaction::new(transactions.clone()))];
        let record = record(0);

        let failing: DispatchFuture<'_> = Box::pin(async {
            Err(DispatchError::Handler {
                method: "on_placed".into(),
                source: "boom".into(),
            })
        });
        let result = compose(&features, &ctx(&record), failing).await;

        assert!(matches!(result, Err(DispatchError::Handler { .. })));
        assert_eq!(transactions.committed(), 0);
        assert_eq!(transactions.rolled_back(), 1);
    }
}
