//! Lifecycle shared by the catch-up and persistent subscription managers.
//!
//! Per handler:
//!
//! ```text
//! Uninitialized -> Ensuring -> Subscribed -> Resubscribing | Dropped
//! ```
//!
//! A closed subscription is classified with
//! [`classify_failure`](crate::error::classify_failure). Client errors
//! resubscribe after a delay for as long as nobody else restarted or dropped
//! the handler; unexpected errors drop the handler for good.

use crate::config::SubscriptionProperties;
use crate::error::{FailureType, SubscriptionError, classify_failure};
use crate::handler::RegisteredHandler;
use crate::idempotency::EventIdempotencyStorage;
use crate::metrics::SubscriptionMetrics;
use crate::subscription_state::{Generation, SubscriptionState};
use eventstore_tools_core::BoxError;
use eventstore_tools_core::checkpoint::{CheckpointStore, InitialPositionStore};
use eventstore_tools_core::event_log::{EventLogClient, SubscriptionDropReason};
use eventstore_tools_core::transaction::{TransactionError, TransactionManager};
use futures::future::{BoxFuture, join_all};
use std::error::Error;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;

/// Collaborators shared by the subscription managers.
#[derive(Clone)]
pub struct SubscriptionContext {
    /// Event log client.
    pub client: Arc<dyn EventLogClient>,
    /// Checkpoint rows.
    pub checkpoints: Arc<dyn CheckpointStore>,
    /// Initial position rows.
    pub initial_positions: Arc<dyn InitialPositionStore>,
    /// Idempotency gate.
    pub idempotency: EventIdempotencyStorage,
    /// Transaction boundary for bookkeeping and dispatch.
    pub transactions: Arc<dyn TransactionManager>,
    /// Settings.
    pub properties: SubscriptionProperties,
}

/// Start and stop all subscriptions of a manager.
pub trait SubscriptionManager: Send + Sync {
    /// Ensure and start a subscription for every handler.
    ///
    /// Does nothing while subscriptions are disabled (or, for catch-up
    /// subscriptions, while this instance is not leader).
    fn start_subscriptions(&self) -> BoxFuture<'_, Result<(), SubscriptionError>>;

    /// Stop every live subscription. Safe to call repeatedly.
    fn drop_subscriptions(&self) -> BoxFuture<'_, ()>;

    /// Registered handlers.
    fn handlers(&self) -> Vec<Arc<RegisteredHandler>>;
}

/// A handler and its subscription cell.
pub(crate) struct HandlerEntry {
    pub(crate) handler: Arc<RegisteredHandler>,
    pub(crate) state: SubscriptionState,
}

/// What the shared lifecycle needs from a manager.
pub(crate) trait ManagerCore: Send + Sync + Sized + 'static {
    /// Short label for logs.
    const KIND: &'static str;

    fn entries(&self) -> &[HandlerEntry];

    fn properties(&self) -> &SubscriptionProperties;

    /// Whether subscriptions may run right now.
    fn may_start(&self) -> bool;

    fn ensure(&self, index: usize) -> BoxFuture<'_, Result<(), SubscriptionError>>;

    fn start<'a>(self: &'a Arc<Self>, index: usize) -> BoxFuture<'a, Result<(), SubscriptionError>>;
}

pub(crate) async fn start_all<M: ManagerCore>(manager: &Arc<M>) -> Result<(), SubscriptionError> {
    if !manager.properties().enabled {
        tracing::info!(kind = M::KIND, "Subscriptions are disabled, not starting");
        return Ok(());
    }
    if !manager.may_start() {
        tracing::debug!(kind = M::KIND, "Not starting subscriptions");
        return Ok(());
    }

    for index in 0..manager.entries().len() {
        if !manager.may_start() {
            tracing::info!(kind = M::KIND, "Stopped starting subscriptions");
            return Ok(());
        }
        manager.ensure(index).await?;
        start_one(manager, index).await?;
    }
    Ok(())
}

/// Start the subscription of `index`. A subscription installed after the
/// manager lost the right to run is dropped again.
async fn start_one<M: ManagerCore>(manager: &Arc<M>, index: usize) -> Result<(), SubscriptionError> {
    manager.start(index).await?;
    if !manager.may_start() {
        if let Some(entry) = manager.entries().get(index) {
            tracing::info!(
                handler = entry.handler.name(),
                kind = M::KIND,
                "No longer allowed to run, dropping the new subscription"
            );
            entry.state.drop_subscription().await;
        }
    }
    Ok(())
}

pub(crate) async fn drop_all<M: ManagerCore>(manager: &M) {
    join_all(
        manager
            .entries()
            .iter()
            .map(|entry| entry.state.drop_subscription()),
    )
    .await;
}

/// Listener-side view of the manager that started it.
pub(crate) struct ListenerScope<M> {
    pub(crate) manager: Weak<M>,
    pub(crate) index: usize,
    pub(crate) generation: Generation,
    pub(crate) runtime: Handle,
}

impl<M: ManagerCore> ListenerScope<M> {
    pub(crate) fn new(manager: &Arc<M>, index: usize, generation: Generation) -> Self {
        Self {
            manager: Arc::downgrade(manager),
            index,
            generation,
            runtime: Handle::current(),
        }
    }

    /// React to the subscription closing.
    pub(crate) fn closed(&self, reason: SubscriptionDropReason, error: Option<BoxError>) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let Some(entry) = manager.entries().get(self.index) else {
            return;
        };
        let handler = entry.handler.name();

        let Some(next_generation) = entry.state.close(self.generation) else {
            tracing::debug!(
                handler,
                %reason,
                "Ignoring close of a superseded subscription"
            );
            return;
        };

        let error: Option<&(dyn Error + 'static)> =
            error.as_deref().map(|err| err as &(dyn Error + 'static));
        let failure = classify_failure(reason, error);
        match error {
            Some(err) => tracing::error!(
                handler,
                kind = M::KIND,
                %reason,
                error = %err,
                ?failure,
                "Subscription closed"
            ),
            None => tracing::error!(
                handler,
                kind = M::KIND,
                %reason,
                ?failure,
                "Subscription closed"
            ),
        }

        self.runtime
            .spawn(recover(manager, self.index, next_generation, failure));
    }
}

/// Act on a closed subscription.
pub(crate) async fn recover<M: ManagerCore>(
    manager: Arc<M>,
    index: usize,
    mut generation: Generation,
    failure: FailureType,
) {
    let Some(entry) = manager.entries().get(index) else {
        return;
    };
    let handler = entry.handler.name();

    if failure == FailureType::UnexpectedError {
        tracing::error!(
            handler,
            kind = M::KIND,
            "Unexpected error, handler will not be resubscribed"
        );
        return;
    }

    tracing::info!(handler, kind = M::KIND, "Resubscribing");
    loop {
        tokio::time::sleep(manager.properties().resubscribe_delay()).await;

        if entry.state.generation() != generation {
            tracing::debug!(handler, "Subscription restarted or dropped meanwhile");
            return;
        }
        if !manager.properties().enabled || !manager.may_start() {
            tracing::info!(handler, "Subscriptions stopped, not resubscribing");
            return;
        }

        SubscriptionMetrics::record_resubscribe(handler);
        match start_one(&manager, index).await {
            Ok(()) => return,
            Err(err) => {
                tracing::error!(handler, error = %err, "Resubscription failed, retrying");
                generation = entry.state.generation();
            }
        }
    }
}

/// Recover the bookkeeping error that aborted a transaction.
pub(crate) fn subscription_error(err: TransactionError) -> SubscriptionError {
    match err.into_aborted() {
        Ok(aborted) => match aborted.downcast::<SubscriptionError>() {
            Ok(error) => *error,
            Err(other) => SubscriptionError::Transaction(TransactionError::Aborted(other)),
        },
        Err(other) => SubscriptionError::Transaction(other),
    }
}

pub(crate) fn boxed(error: impl Into<SubscriptionError>) -> BoxError {
    Box::new(error.into())
}
