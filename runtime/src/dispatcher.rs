//! Record dispatch.
//!
//! The dispatcher turns one delivered record into calls of the handler
//! methods registered for its type tag:
//!
//! 1. links whose target is gone are skipped
//! 2. features wrap the whole record (transaction, checkpoint, idempotency)
//! 3. each matching method runs inside its extensions, with its retry policy
//!
//! Methods flagged to skip when replaying are bypassed for records below the
//! replay boundary; the features still run for those records.

use crate::error::DispatchError;
use crate::extension::{MethodContext, MethodFuture, apply_extensions};
use crate::feature::{DispatchFuture, Feature, RecordContext, compose};
use crate::handler::{HandlerMethod, RegisteredHandler};
use crate::metrics::DispatchMetrics;
use crate::retry::retry_with_policy;
use eventstore_tools_core::BoxError;
use eventstore_tools_core::record::{ResolvedRecord, StreamRecord};
use std::sync::Arc;

/// Dispatches the records of one subscription to one handler.
pub struct Dispatcher {
    handler: Arc<RegisteredHandler>,
    replay_until: u64,
    features: Vec<Arc<dyn Feature>>,
}

impl Dispatcher {
    /// Dispatcher for `handler`; records below `replay_until` count as
    /// replayed. `features` are listed outermost first.
    #[must_use]
    pub fn new(
        handler: Arc<RegisteredHandler>,
        replay_until: u64,
        features: Vec<Arc<dyn Feature>>,
    ) -> Self {
        Self {
            handler,
            replay_until,
            features,
        }
    }

    /// Handler records are dispatched to.
    #[must_use]
    pub fn handler(&self) -> &RegisteredHandler {
        &self.handler
    }

    /// First sequence that is not a replay.
    #[must_use]
    pub const fn replay_until(&self) -> u64 {
        self.replay_until
    }

    /// Dispatch `resolved` and log a failure with the record's details.
    ///
    /// # Errors
    ///
    /// Returns the boxed [`DispatchError`] so the subscription closes.
    pub async fn on_event(&self, resolved: ResolvedRecord) -> Result<(), BoxError> {
        let details = resolved.event.as_ref().map(|record| {
            (
                record.event_id,
                record.event_type.clone(),
                record.stream_id.clone(),
                String::from_utf8_lossy(&record.data).into_owned(),
            )
        });

        match self.dispatch(resolved).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Some((event_id, event_type, stream_id, data)) = details {
                    tracing::error!(
                        handler = self.handler.name(),
                        %event_id,
                        %event_type,
                        event_stream_id = %stream_id,
                        %data,
                        error = %err,
                        "Failure on method invocation"
                    );
                }
                Err(Box::new(err))
            }
        }
    }

    /// Dispatch one delivered record.
    ///
    /// # Errors
    ///
    /// Returns the first failure of a feature or a method.
    pub async fn dispatch(&self, resolved: ResolvedRecord) -> Result<(), DispatchError> {
        let Some(record) = resolved.event.as_ref() else {
            tracing::debug!(
                handler = self.handler.name(),
                link = ?resolved.link.as_ref().map(ToString::to_string),
                "Skipping link event whose target is missing"
            );
            return Ok(());
        };
        let original_sequence = resolved.original_sequence().unwrap_or(record.sequence);

        let ctx = RecordContext {
            handler: self.handler.name(),
            stream_name: self.handler.stream_name(),
            group_name: self.handler.group_name(),
            record,
            original_sequence,
        };

        let endpoint: DispatchFuture<'_> = Box::pin(self.invoke_methods(&ctx));
        compose(&self.features, &ctx, endpoint).await
    }

    async fn invoke_methods(&self, ctx: &RecordContext<'_>) -> Result<(), DispatchError> {
        let methods = self.handler.methods_for(&ctx.record.event_type);
        if methods.is_empty() {
            tracing::trace!(
                handler = ctx.handler,
                event_type = %ctx.record.event_type,
                "No handler method for event type"
            );
            return Ok(());
        }
        DispatchMetrics::record_handled(ctx.handler);

        for method in methods {
            if method.config().skips_when_replaying() && ctx.original_sequence < self.replay_until {
                tracing::debug!(
                    handler = ctx.handler,
                    method = method.name(),
                    sequence = ctx.original_sequence,
                    replay_until = self.replay_until,
                    "Skipping method while replaying"
                );
                continue;
            }
            self.invoke_method(method, ctx.record).await?;
        }
        Ok(())
    }

    async fn invoke_method(
        &self,
        method: &HandlerMethod,
        record: &StreamRecord,
    ) -> Result<(), DispatchError> {
        method
            .config()
            .validate()
            .map_err(|reason| DispatchError::UnsupportedMethod {
                method: method.name().to_string(),
                reason,
            })?;

        let ctx = MethodContext {
            handler: self.handler.name(),
            method: method.name(),
            record,
        };
        let attempts: MethodFuture<'_> = Box::pin(async move {
            match method.config().retry() {
                Some(policy) => retry_with_policy(policy, || method.invoke(record)).await,
                None => method.invoke(record).await,
            }
        });

        apply_extensions(self.handler.extensions(), &ctx, attempts)
            .await
            .map_err(|source| match source.downcast::<DispatchError>() {
                Ok(dispatch) => *dispatch,
                Err(source) => DispatchError::Handler {
                    method: method.name().to_string(),
                    source,
                },
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::handler::{EventHandler, HandlerRegistry, MethodConfig};
    use crate::retry::RetryPolicy;
    use chrono::Utc;
    use eventstore_tools_core::event::DomainEvent;
    use eventstore_tools_core::stream::StreamId;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use thiserror::Error;
    use uuid::Uuid;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Tick {
        n: u64,
    }

    impl DomainEvent for Tick {
        const EVENT_TYPE: &'static str = "Tick";
    }

    #[derive(Debug, Error)]
    #[error("flaky")]
    struct Flaky;

    #[derive(Default)]
    struct Ticks {
        always: Mutex<Vec<u64>>,
        live_only: Mutex<Vec<u64>>,
        flaky_calls: AtomicUsize,
    }

    impl EventHandler for Ticks {
        fn stream_name(&self) -> &str {
            "ticks"
        }

        fn group_name(&self) -> &str {
            "ticks-group"
        }

        fn register(registry: &mut HandlerRegistry<Self>) {
            registry
                .on(MethodConfig::new("always"), |h: Arc<Self>, e: Tick| async move {
                    h.always.lock().unwrap().push(e.n);
                    Ok(())
                })
                .on(
                    MethodConfig::new("live_only").skip_when_replaying(),
                    |h: Arc<Self>, e: Tick| async move {
                        h.live_only.lock().unwrap().push(e.n);
                        Ok(())
                    },
                );
        }
    }

    struct FlakyHandler {
        calls: Arc<AtomicUsize>,
        failures: usize,
    }

    impl EventHandler for FlakyHandler {
        fn stream_name(&self) -> &str {
            "ticks"
        }

        fn group_name(&self) -> &str {
            "flaky"
        }

        fn register(registry: &mut HandlerRegistry<Self>) {
            let policy = RetryPolicy::builder()
                .max_attempts(3)
                .backoff(Duration::from_millis(1))
                .retry_on::<Flaky>()
                .build();
            registry.on(
                MethodConfig::new("flaky").with_retry(policy),
                |h: Arc<Self>, _e: Tick| async move {
                    let call = h.calls.fetch_add(1, Ordering::SeqCst);
                    if call < h.failures {
                        Err(Box::new(Flaky) as BoxError)
                    } else {
                        Ok(())
                    }
                },
            );
        }
    }

    fn tick(sequence: u64) -> ResolvedRecord {
        ResolvedRecord::plain(StreamRecord {
            event_id: Uuid::new_v4(),
            stream_id: StreamId::new("ticks"),
            sequence,
            event_type: "Tick".to_string(),
            data: serde_json::to_vec(&Tick { n: sequence }).unwrap(),
            metadata: Vec::new(),
            created: Utc::now(),
        })
    }

    #[tokio::test]
    async fn skip_flagged_methods_only_run_from_replay_boundary() {
        let ticks = Arc::new(Ticks::default());
        let handler = Arc::new(RegisteredHandler::from_arc(Arc::clone(&ticks)));
        let dispatcher = Dispatcher::new(handler, 3, Vec::new());

        for sequence in 0..5 {
            dispatcher.dispatch(tick(sequence)).await.unwrap();
        }

        assert_eq!(*ticks.always.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(*ticks.live_only.lock().unwrap(), vec![3, 4]);
    }

    #[tokio::test]
    async fn empty_link_is_skipped() {
        let ticks = Arc::new(Ticks::default());
        let dispatcher = Dispatcher::new(
            Arc::new(RegisteredHandler::from_arc(Arc::clone(&ticks))),
            0,
            Vec::new(),
        );
        let mut link = tick(7);
        link.link = link.event.take();

        dispatcher.dispatch(link).await.unwrap();
        assert!(ticks.always.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn retryable_failures_are_retried_within_budget() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = FlakyHandler {
            calls: Arc::clone(&calls),
            failures: 2,
        };
        let dispatcher = Dispatcher::new(Arc::new(RegisteredHandler::new(handler)), 0, Vec::new());

        dispatcher.dispatch(tick(0)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_handler_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = FlakyHandler {
            calls: Arc::clone(&calls),
            failures: 10,
        };
        let dispatcher = Dispatcher::new(Arc::new(RegisteredHandler::new(handler)), 0, Vec::new());

        let error = dispatcher.on_event(tick(0)).await.unwrap_err();
        let dispatch = error.downcast::<DispatchError>().unwrap();
        assert!(matches!(*dispatch, DispatchError::Handler { ref method, .. } if method == "flaky"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
