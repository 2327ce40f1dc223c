//! Persistent (server-managed) subscriptions.
//!
//! The server tracks the group's position and redelivers records that are
//! not acknowledged in time. Each record is acknowledged only after it was
//! dispatched, so a crash between the two leads to a redelivery that the
//! idempotency gate absorbs.

use crate::config::SubscriptionProperties;
use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, FailureType, SubscriptionError};
use crate::feature::{EventIdempotency, Feature, InTransaction};
use crate::handler::RegisteredHandler;
use crate::subscription_state::SubscriptionState;
use crate::subscriptions::{
    self, HandlerEntry, ListenerScope, ManagerCore, SubscriptionContext, SubscriptionManager,
    boxed, subscription_error,
};
use eventstore_tools_core::BoxError;
use eventstore_tools_core::checkpoint::InitialPositionRecord;
use eventstore_tools_core::event_log::{
    EventLogError, PersistentListener, PersistentSubscriptionAck, SubscriptionDropReason,
};
use eventstore_tools_core::record::ResolvedRecord;
use eventstore_tools_core::store::stored_sequence;
use eventstore_tools_core::stream::StreamId;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Persistent subscription manager.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct PersistentSubscriptions {
    inner: Arc<PersistentInner>,
}

struct PersistentInner {
    context: SubscriptionContext,
    entries: Vec<HandlerEntry>,
    features: Vec<Arc<dyn Feature>>,
}

impl PersistentSubscriptions {
    /// Manager for `handlers`.
    #[must_use]
    pub fn new(context: SubscriptionContext, handlers: Vec<RegisteredHandler>) -> Self {
        let stop_timeout = context.properties.stop_timeout();
        let entries = handlers
            .into_iter()
            .map(|handler| HandlerEntry {
                state: SubscriptionState::new(handler.name(), stop_timeout),
                handler: Arc::new(handler),
            })
            .collect();

        let features: Vec<Arc<dyn Feature>> = vec![
            Arc::new(InTransaction::new(Arc::clone(&context.transactions))),
            Arc::new(EventIdempotency::new(context.idempotency.clone())),
        ];

        Self {
            inner: Arc::new(PersistentInner {
                context,
                entries,
                features,
            }),
        }
    }

    /// Whether the named handler holds a live subscription.
    #[must_use]
    pub fn is_active(&self, handler: &str) -> bool {
        self.inner
            .entries
            .iter()
            .any(|entry| entry.handler.name() == handler && entry.state.is_active())
    }
}

impl SubscriptionManager for PersistentSubscriptions {
    fn start_subscriptions(&self) -> BoxFuture<'_, Result<(), SubscriptionError>> {
        Box::pin(subscriptions::start_all(&self.inner))
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

impl PersistentInner {
    async fn ensure_subscription(&self, index: usize) -> Result<(), SubscriptionError> {
        let Some(entry) = self.entries.get(index) else {
            return Ok(());
        };
        let handler = &entry.handler;
        let client = self.context.client.as_ref();
        let position = handler.initial_position();
        let properties = &self.context.properties;

        let start = position.start_subscription_from(client).await?;
        let replay_until = position.replay_events_until(client).await?;
        let settings = properties.persistent_settings(start, handler.consumer_strategy());
        let record = InitialPositionRecord {
            group_name: handler.group_name().to_string(),
            stream_name: handler.stream_name().to_string(),
            initial_position: stored_sequence(replay_until)?,
        };

        let initial_positions = self.context.initial_positions.as_ref();
        let work: BoxFuture<'_, Result<(), BoxError>> = Box::pin(async move {
            initial_positions
                .create_if_not_exists(&record)
                .await
                .map_err(boxed)?;

            let stream_id = StreamId::new(handler.stream_name());
            let group_name = handler.group_name().to_string();
            match client
                .create_persistent_subscription(stream_id.clone(), group_name.clone(), settings.clone())
                .await
            {
                Ok(()) => {
                    tracing::info!(
                        handler = handler.name(),
                        group_name = %group_name,
                        stream_name = %stream_id,
                        start_from = settings.start_from,
                        "Created persistent subscription"
                    );
                }
                Err(EventLogError::SubscriptionAlreadyExists { .. }) if properties.update_enabled => {
                    client
                        .update_persistent_subscription(stream_id.clone(), group_name.clone(), settings)
                        .await
                        .map_err(boxed)?;
                    tracing::info!(
                        handler = handler.name(),
                        group_name = %group_name,
                        stream_name = %stream_id,
                        "Updated persistent subscription"
                    );
                }
                Err(EventLogError::SubscriptionAlreadyExists { .. }) => {
                    tracing::info!(
                        handler = handler.name(),
                        group_name = %group_name,
                        stream_name = %stream_id,
                        "Persistent subscription exists. Updates disabled, doing nothing"
                    );
                }
                Err(err) => return Err(boxed(err)),
            }
            Ok(())
        });

        self.context
            .transactions
            .in_transaction(work)
            .await
            .map_err(subscription_error)
    }

    async fn replay_boundary(&self, handler: &RegisteredHandler) -> Result<u64, SubscriptionError> {
        let stored = self
            .context
            .initial_positions
            .find(handler.group_name(), handler.stream_name())
            .await?;
        Ok(stored.map_or(0, |record| record.replay_until()))
    }

    async fn start_subscription(self: &Arc<Self>, index: usize) -> Result<(), SubscriptionError> {
        let Some(entry) = self.entries.get(index) else {
            return Ok(());
        };
        let handler = &entry.handler;
        let generation = entry.state.begin().await;
        let replay_until = self.replay_boundary(handler).await?;

        let listener = Arc::new(PersistentHandlerListener {
            dispatcher: Dispatcher::new(Arc::clone(handler), replay_until, self.features.clone()),
            scope: ListenerScope::new(self, index, generation),
        });
        let subscribed = self
            .context
            .client
            .subscribe_persistent(
                StreamId::new(handler.stream_name()),
                handler.group_name().to_string(),
                listener,
            )
            .await;

        match subscribed {
            Ok(handle) => {
                if entry.state.update(generation, handle).await {
                    tracing::info!(
                        handler = handler.name(),
                        group_name = handler.group_name(),
                        stream_name = handler.stream_name(),
                        replay_until,
                        "Started persistent subscription"
                    );
                }
            }
            Err(err) => {
                tracing::error!(
                    handler = handler.name(),
                    group_name = handler.group_name(),
                    stream_name = handler.stream_name(),
                    error = %err,
                    "Failed to subscribe to persistent subscription"
                );
                if let Some(next_generation) = entry.state.close(generation) {
                    tokio::spawn(subscriptions::recover(
                        Arc::clone(self),
                        index,
                        next_generation,
                        FailureType::ClientError,
                    ));
                }
            }
        }
        Ok(())
    }
}

impl ManagerCore for PersistentInner {
    const KIND: &'static str = "persistent";

    fn entries(&self) -> &[HandlerEntry] {
        &self.entries
    }

    fn properties(&self) -> &SubscriptionProperties {
        &self.context.properties
    }

    fn may_start(&self) -> bool {
        true
    }

    fn ensure(&self, index: usize) -> BoxFuture<'_, Result<(), SubscriptionError>> {
        Box::pin(self.ensure_subscription(index))
    }

    fn start<'a>(self: &'a Arc<Self>, index: usize) -> BoxFuture<'a, Result<(), SubscriptionError>> {
        Box::pin(self.start_subscription(index))
    }
}

struct PersistentHandlerListener {
    dispatcher: Dispatcher,
    scope: ListenerScope<PersistentInner>,
}

impl PersistentListener for PersistentHandlerListener {
    fn on_event<'a>(
        &'a self,
        subscription: &'a dyn PersistentSubscriptionAck,
        record: ResolvedRecord,
    ) -> BoxFuture<'a, Result<(), BoxError>> {
        Box::pin(async move {
            let event_id = record.original_event_id();
            self.dispatcher.on_event(record).await?;

            let Some(event_id) = event_id else {
                return Ok(());
            };
            if let Err(source) = subscription.acknowledge(event_id).await {
                tracing::error!(
                    handler = self.dispatcher.handler().name(),
                    %event_id,
                    error = %source,
                    "Failed to acknowledge event"
                );
                return Err(Box::new(DispatchError::AcknowledgementFailed { event_id, source }) as BoxError);
            }
            Ok(())
        })
    }

    fn on_close(&self, reason: SubscriptionDropReason, error: Option<BoxError>) {
        self.scope.closed(reason, error);
    }
}
