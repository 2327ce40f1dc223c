//! Catch-up subscriptions with locally stored checkpoints.
//!
//! The client tracks the position; this manager keeps it durable. Each
//! delivered record advances the group's checkpoint in the same transaction
//! as the handler's writes, and a restarted subscription resumes after the
//! stored checkpoint.
//!
//! With leader election enabled only the leader runs catch-up subscriptions.
//! Revoking leadership drops them all; the monotonic checkpoint fences off a
//! former leader that is slow to stop.

use crate::config::SubscriptionProperties;
use crate::dispatcher::Dispatcher;
use crate::error::SubscriptionError;
use crate::feature::{EventIdempotency, Feature, InTransaction, StoreCheckpoint};
use crate::handler::RegisteredHandler;
use crate::subscription_state::{ConnectionGauge, SubscriptionState};
use crate::subscriptions::{
    self, HandlerEntry, ListenerScope, ManagerCore, SubscriptionContext, SubscriptionManager,
    boxed, subscription_error,
};
use eventstore_tools_core::BoxError;
use eventstore_tools_core::checkpoint::InitialPositionRecord;
use eventstore_tools_core::event_log::{CatchUpListener, SubscriptionDropReason};
use eventstore_tools_core::leadership::{LeadershipContext, LeadershipEvent};
use eventstore_tools_core::position::InitialPosition;
use eventstore_tools_core::record::ResolvedRecord;
use eventstore_tools_core::store::stored_sequence;
use eventstore_tools_core::stream::StreamId;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Catch-up subscription manager.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CatchUpSubscriptions {
    inner: Arc<CatchUpInner>,
}

struct CatchUpInner {
    context: SubscriptionContext,
    entries: Vec<HandlerEntry>,
    features: Vec<Arc<dyn Feature>>,
    leadership: Option<Arc<dyn LeadershipContext>>,
    leader: AtomicBool,
    leadership_changes: tokio::sync::Mutex<()>,
}

impl CatchUpSubscriptions {
    /// Manager for `handlers`. `leadership` is yielded when starting after a
    /// grant fails.
    #[must_use]
    pub fn new(
        context: SubscriptionContext,
        handlers: Vec<RegisteredHandler>,
        leadership: Option<Arc<dyn LeadershipContext>>,
    ) -> Self {
        let stop_timeout = context.properties.stop_timeout();
        let entries = handlers
            .into_iter()
            .map(|handler| {
                let gauge = ConnectionGauge::new(
                    handler.name(),
                    handler.group_name(),
                    handler.stream_name(),
                );
                HandlerEntry {
                    state: SubscriptionState::new(handler.name(), stop_timeout).with_gauge(gauge),
                    handler: Arc::new(handler),
                }
            })
            .collect();

        let features: Vec<Arc<dyn Feature>> = vec![
            Arc::new(InTransaction::new(Arc::clone(&context.transactions))),
            Arc::new(StoreCheckpoint::new(Arc::clone(&context.checkpoints))),
            Arc::new(EventIdempotency::new(context.idempotency.clone())),
        ];
        let leader = !context.properties.enable_catchup_subscription_leader_election;

        Self {
            inner: Arc::new(CatchUpInner {
                context,
                entries,
                features,
                leadership,
                leader: AtomicBool::new(leader),
                leadership_changes: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Whether this instance currently runs catch-up subscriptions.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.inner.leader.load(Ordering::SeqCst)
    }

    /// Whether the named handler holds a live subscription.
    #[must_use]
    pub fn is_active(&self, handler: &str) -> bool {
        self.inner
            .entries
            .iter()
            .any(|entry| entry.handler.name() == handler && entry.state.is_active())
    }

    /// React to a signal of the election component.
    pub async fn on_leadership(&self, event: LeadershipEvent) {
        match event {
            LeadershipEvent::Granted => self.on_leadership_granted().await,
            LeadershipEvent::Revoked => self.on_leadership_revoked().await,
        }
    }

    /// Become leader and start every subscription. Leadership is yielded
    /// again when starting fails.
    pub async fn on_leadership_granted(&self) {
        let result = {
            let _guard = self.inner.leadership_changes.lock().await;
            tracing::info!("Leadership granted, starting catch-up subscriptions");
            self.inner.leader.store(true, Ordering::SeqCst);
            subscriptions::start_all(&self.inner).await
        };

        if let Err(err) = result {
            tracing::error!(error = %err, "Failed to start catch-up subscriptions, yielding leadership");
            if let Some(leadership) = &self.inner.leadership {
                leadership.yield_leadership().await;
            }
        }
    }

    /// Become follower and drop every subscription.
    pub async fn on_leadership_revoked(&self) {
        let _guard = self.inner.leadership_changes.lock().await;
        tracing::info!("Leadership revoked, dropping catch-up subscriptions");
        self.inner.leader.store(false, Ordering::SeqCst);
        subscriptions::drop_all(self.inner.as_ref()).await;
    }
}

impl SubscriptionManager for CatchUpSubscriptions {
    fn start_subscriptions(&self) -> BoxFuture<'_, Result<(), SubscriptionError>> {
        Box::pin(async move {
            let _guard = self.inner.leadership_changes.lock().await;
            subscriptions::start_all(&self.inner).await
        })
    }

    fn drop_subscriptions(&self) -> BoxFuture<'_, ()> {
        Box::pin(subscriptions::drop_all(self.inner.as_ref()))
    }

    fn handlers(&self) -> Vec<Arc<RegisteredHandler>> {
        self.inner
            .entries
            .iter()
            .map(|entry| Arc::clone(&entry.handler))
            .collect()
    }
}

impl CatchUpInner {
    async fn ensure_subscription(&self, index: usize) -> Result<(), SubscriptionError> {
        let Some(entry) = self.entries.get(index) else {
            return Ok(());
        };
        let handler = &entry.handler;
        let client = self.context.client.as_ref();
        let position = handler.initial_position();

        let start = position.start_subscription_from(client).await?;
        let replay_until = position.replay_events_until(client).await?;
        let checkpoint = Some(stored_sequence(start)? - 1).filter(|c| *c >= 0);
        let initial_position = match position {
            InitialPosition::FromBeginning => None,
            _ => Some(InitialPositionRecord {
                group_name: handler.group_name().to_string(),
                stream_name: handler.stream_name().to_string(),
                initial_position: stored_sequence(replay_until)?,
            }),
        };

        let checkpoints = self.context.checkpoints.as_ref();
        let initial_positions = self.context.initial_positions.as_ref();
        let work: BoxFuture<'_, Result<(), BoxError>> = Box::pin(async move {
            checkpoints
                .create_if_not_exists(handler.group_name(), handler.stream_name(), checkpoint)
                .await
                .map_err(boxed)?;
            if let Some(record) = &initial_position {
                initial_positions
                    .create_if_not_exists(record)
                    .await
                    .map_err(boxed)?;
            }
            Ok(())
        });
        self.context
            .transactions
            .in_transaction(work)
            .await
            .map_err(subscription_error)?;

        tracing::info!(
            handler = handler.name(),
            group_name = handler.group_name(),
            stream_name = handler.stream_name(),
            %position,
            start,
            replay_until,
            "Ensured catch-up subscription"
        );
        Ok(())
    }

    async fn replay_boundary(&self, handler: &RegisteredHandler) -> Result<u64, SubscriptionError> {
        if matches!(handler.initial_position(), InitialPosition::FromBeginning) {
            return Ok(0);
        }
        let stored = self
            .context
            .initial_positions
            .find(handler.group_name(), handler.stream_name())
            .await?;
        match stored {
            Some(record) => Ok(record.replay_until()),
            None => Ok(handler
                .initial_position()
                .replay_events_until(self.context.client.as_ref())
                .await?),
        }
    }

    async fn start_subscription(self: &Arc<Self>, index: usize) -> Result<(), SubscriptionError> {
        let Some(entry) = self.entries.get(index) else {
            return Ok(());
        };
        let handler = &entry.handler;
        let generation = entry.state.begin().await;

        let checkpoint = self
            .context
            .checkpoints
            .current(handler.group_name(), handler.stream_name())
            .await?;
        let after = checkpoint.as_ref().and_then(|c| c.resume_after());
        let replay_until = self.replay_boundary(handler).await?;

        let listener = Arc::new(CatchUpHandlerListener {
            dispatcher: Dispatcher::new(Arc::clone(handler), replay_until, self.features.clone()),
            scope: ListenerScope::new(self, index, generation),
        });
        let handle = self
            .context
            .client
            .subscribe_catch_up(StreamId::new(handler.stream_name()), after, listener)
            .await?;

        if entry.state.update(generation, handle).await {
            tracing::info!(
                handler = handler.name(),
                group_name = handler.group_name(),
                stream_name = handler.stream_name(),
                after = ?after,
                replay_until,
                "Started catch-up subscription"
            );
        }
        Ok(())
    }
}

impl ManagerCore for CatchUpInner {
    const KIND: &'static str = "catch-up";

    fn entries(&self) -> &[HandlerEntry] {
        &self.entries
    }

    fn properties(&self) -> &SubscriptionProperties {
        &self.context.properties
    }

    fn may_start(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    fn ensure(&self, index: usize) -> BoxFuture<'_, Result<(), SubscriptionError>> {
        Box::pin(self.ensure_subscription(index))
    }

    fn start<'a>(self: &'a Arc<Self>, index: usize) -> BoxFuture<'a, Result<(), SubscriptionError>> {
        Box::pin(self.start_subscription(index))
    }
}

struct CatchUpHandlerListener {
    dispatcher: Dispatcher,
    scope: ListenerScope<CatchUpInner>,
}

impl CatchUpListener for CatchUpHandlerListener {
    fn on_event(&self, record: ResolvedRecord) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin(self.dispatcher.on_event(record))
    }

    fn on_live_processing_started(&self) {
        tracing::debug!(
            handler = self.dispatcher.handler().name(),
            generation = self.scope.generation,
            "Catch-up subscription is live"
        );
    }

    fn on_close(&self, reason: SubscriptionDropReason, error: Option<BoxError>) {
        self.scope.closed(reason, error);
    }
}
