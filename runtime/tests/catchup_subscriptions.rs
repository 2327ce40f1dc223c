//! Catch-up subscriptions against the in-memory event log.

#![allow(clippy::unwrap_used)]

mod common;

use common::{Fixture, OrderPlaced, eventually, properties, settle};
use eventstore_tools_core::checkpoint::{Checkpoint, CheckpointStore};
use eventstore_tools_core::store::StoreError;
use eventstore_tools_core::event_log::{EventLogClient, SubscriptionDropReason};
use eventstore_tools_core::leadership::{LeadershipContext, LeadershipEvent};
use eventstore_tools_core::position::{InitialPosition, persistent_checkpoint_stream};
use eventstore_tools_core::record::{NewRecord, RecordMetadata};
use eventstore_tools_core::stream::{ExpectedVersion, StreamId};
use eventstore_tools_runtime::{
    CatchUpSubscriptions, EventHandler, HandlerRegistry, MethodConfig, RegisteredHandler,
    SubscriptionManager, SubscriptionProperties,
};
use eventstore_tools_testing::{InMemoryCheckpointStore, ScriptedLeadership};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

struct OrderProjection {
    stream: String,
    position: InitialPosition,
    placed: Mutex<Vec<String>>,
    notified: Mutex<Vec<String>>,
}

impl OrderProjection {
    fn new(stream: &str, position: InitialPosition) -> Arc<Self> {
        Arc::new(Self {
            stream: stream.to_string(),
            position,
            placed: Mutex::new(Vec::new()),
            notified: Mutex::new(Vec::new()),
        })
    }

    fn placed(&self) -> Vec<String> {
        self.placed.lock().unwrap().clone()
    }

    fn notified(&self) -> Vec<String> {
        self.notified.lock().unwrap().clone()
    }
}

impl EventHandler for OrderProjection {
    fn stream_name(&self) -> &str {
        &self.stream
    }

    fn group_name(&self) -> &str {
        "order-projection"
    }

    fn initial_position(&self) -> InitialPosition {
        self.position.clone()
    }

    fn register(registry: &mut HandlerRegistry<Self>) {
        registry
            .on(
                MethodConfig::new("on_placed"),
                |h: Arc<Self>, e: OrderPlaced| async move {
                    h.placed.lock().unwrap().push(e.order_id);
                    Ok(())
                },
            )
            .on(
                MethodConfig::new("notify").skip_when_replaying(),
                |h: Arc<Self>, e: OrderPlaced| async move {
                    h.notified.lock().unwrap().push(e.order_id);
                    Ok(())
                },
            );
    }
}

/// Rejects the order with id "bad".
#[derive(Default)]
struct PickyProjection {
    calls: AtomicUsize,
}

impl EventHandler for PickyProjection {
    fn stream_name(&self) -> &str {
        "Orders-7"
    }

    fn group_name(&self) -> &str {
        "picky"
    }

    fn register(registry: &mut HandlerRegistry<Self>) {
        registry.on(
            MethodConfig::new("on_placed"),
            |h: Arc<Self>, e: OrderPlaced| async move {
                h.calls.fetch_add(1, Ordering::SeqCst);
                if e.order_id == "bad" {
                    return Err("order rejected".into());
                }
                Ok(())
            },
        );
    }
}

/// Never finishes handling a record.
#[derive(Default)]
struct StuckProjection {
    entered: AtomicBool,
}

impl EventHandler for StuckProjection {
    fn stream_name(&self) -> &str {
        "Orders-1"
    }

    fn group_name(&self) -> &str {
        "stuck"
    }

    fn register(registry: &mut HandlerRegistry<Self>) {
        registry.on(
            MethodConfig::new("on_placed"),
            |h: Arc<Self>, _e: OrderPlaced| async move {
                h.entered.store(true, Ordering::SeqCst);
                std::future::pending::<()>().await;
                Ok(())
            },
        );
    }
}

/// Checkpoint store whose row creation takes a while.
struct SlowCheckpoints {
    inner: Arc<InMemoryCheckpointStore>,
    delay: Duration,
}

impl CheckpointStore for SlowCheckpoints {
    fn create_if_not_exists<'a>(
        &'a self,
        group_name: &'a str,
        stream_name: &'a str,
        checkpoint: Option<i64>,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            self.inner
                .create_if_not_exists(group_name, stream_name, checkpoint)
                .await
        })
    }

    fn increment_if_greater<'a>(
        &'a self,
        group_name: &'a str,
        stream_name: &'a str,
        checkpoint: i64,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        self.inner.increment_if_greater(group_name, stream_name, checkpoint)
    }

    fn current<'a>(
        &'a self,
        group_name: &'a str,
        stream_name: &'a str,
    ) -> BoxFuture<'a, Result<Option<Checkpoint>, StoreError>> {
        self.inner.current(group_name, stream_name)
    }

    fn delete<'a>(
        &'a self,
        group_name: &'a str,
        stream_name: &'a str,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        self.inner.delete(group_name, stream_name)
    }
}

#[tokio::test]
async fn order_placed_is_handled_once_and_checkpointed() {
    let fx = Fixture::new();
    let e1 = Uuid::new_v4();
    let payload = serde_json::to_vec(&serde_json::json!({ "orderId": "42" })).unwrap();
    fx.log
        .append(
            StreamId::new("Orders-42"),
            ExpectedVersion::Any,
            vec![NewRecord::new("OrderPlaced", payload.clone()).with_id(e1)],
        )
        .await
        .unwrap();

    let projection = OrderProjection::new("Orders-42", InitialPosition::FromBeginning);
    let manager = CatchUpSubscriptions::new(
        fx.context(properties()),
        vec![RegisteredHandler::from_arc(Arc::clone(&projection))],
        None,
    );
    manager.start_subscriptions().await.unwrap();

    eventually(|| projection.placed().len() == 1).await;
    eventually(|| fx.checkpoints.checkpoint("order-projection", "Orders-42") == Some(0)).await;
    assert_eq!(projection.notified(), vec!["42".to_string()]);

    let mut metadata = RecordMetadata::new();
    metadata.insert("overrideEventId".into(), serde_json::json!(e1.to_string()));
    fx.log
        .append(
            StreamId::new("Orders-42"),
            ExpectedVersion::Any,
            vec![
                NewRecord::new("OrderPlaced", payload)
                    .with_id(e1)
                    .with_metadata(&metadata)
                    .unwrap(),
            ],
        )
        .await
        .unwrap();

    eventually(|| fx.checkpoints.checkpoint("order-projection", "Orders-42") == Some(1)).await;
    // Ensure plus one transaction per record.
    eventually(|| fx.transactions.committed() == 3).await;
    assert_eq!(projection.placed(), vec!["42".to_string()]);
    assert_eq!(fx.idempotency.records_for("order-projection").len(), 1);

    manager.drop_subscriptions().await;
    assert!(!manager.is_active("OrderProjection"));
}

#[tokio::test]
async fn resumes_after_stored_checkpoint() {
    let fx = Fixture::new();
    for id in ["1", "2", "3"] {
        fx.place_order("Orders-42", id);
    }
    fx.checkpoints
        .create_if_not_exists("order-projection", "Orders-42", Some(1))
        .await
        .unwrap();

    let projection = OrderProjection::new("Orders-42", InitialPosition::FromBeginning);
    let manager = CatchUpSubscriptions::new(
        fx.context(properties()),
        vec![RegisteredHandler::from_arc(Arc::clone(&projection))],
        None,
    );
    manager.start_subscriptions().await.unwrap();

    eventually(|| fx.checkpoints.checkpoint("order-projection", "Orders-42") == Some(2)).await;
    settle().await;
    assert_eq!(projection.placed(), vec!["3".to_string()]);
    manager.drop_subscriptions().await;
}

#[tokio::test]
async fn from_end_of_stream_ignores_history() {
    let fx = Fixture::new();
    fx.place_order("Orders-42", "old-1");
    fx.place_order("Orders-42", "old-2");

    let projection = OrderProjection::new(
        "Orders-42",
        InitialPosition::FromTheEndOfStream {
            stream_name: "Orders-42".into(),
        },
    );
    let manager = CatchUpSubscriptions::new(
        fx.context(properties()),
        vec![RegisteredHandler::from_arc(Arc::clone(&projection))],
        None,
    );
    manager.start_subscriptions().await.unwrap();
    assert_eq!(fx.checkpoints.checkpoint("order-projection", "Orders-42"), Some(1));
    assert_eq!(fx.initial_positions.len(), 1);

    fx.place_order("Orders-42", "new");
    eventually(|| projection.placed().len() == 1).await;
    assert_eq!(projection.placed(), vec!["new".to_string()]);
    assert_eq!(projection.notified(), vec!["new".to_string()]);
    manager.drop_subscriptions().await;
}

#[tokio::test]
async fn take_over_skips_replayed_notifications() {
    let fx = Fixture::new();
    for id in ["1", "2", "3", "4"] {
        fx.place_order("Orders-42", id);
    }
    // The replaced persistent group acknowledged up to sequence 1.
    fx.log
        .append_json(
            persistent_checkpoint_stream("Orders-42", "legacy").as_str(),
            "$SubscriptionCheckpoint",
            &serde_json::json!(1),
        )
        .unwrap();

    let projection = OrderProjection::new(
        "Orders-42",
        InitialPosition::TakeOverPersistentSubscription {
            stream_name: "Orders-42".into(),
            group_name: "legacy".into(),
        },
    );
    let manager = CatchUpSubscriptions::new(
        fx.context(properties()),
        vec![RegisteredHandler::from_arc(Arc::clone(&projection))],
        None,
    );
    manager.start_subscriptions().await.unwrap();

    eventually(|| projection.placed().len() == 4).await;
    assert_eq!(projection.notified(), vec!["3".to_string(), "4".to_string()]);
    manager.drop_subscriptions().await;
}

#[tokio::test]
async fn failing_handler_is_not_resubscribed() {
    let fx = Fixture::new();
    fx.place_order("Orders-7", "good");
    fx.place_order("Orders-7", "bad");
    fx.place_order("Orders-7", "never");

    let handler = Arc::new(PickyProjection::default());
    let manager = CatchUpSubscriptions::new(
        fx.context(properties()),
        vec![RegisteredHandler::from_arc(Arc::clone(&handler))],
        None,
    );
    manager.start_subscriptions().await.unwrap();

    eventually(|| !manager.is_active("PickyProjection")).await;
    settle().await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    assert_eq!(fx.log.live_subscriptions(), 0);
    assert!(fx.transactions.rolled_back() >= 1);
}

#[tokio::test]
async fn dropped_connection_resubscribes() {
    let fx = Fixture::new();
    fx.place_order("Orders-42", "1");

    let projection = OrderProjection::new("Orders-42", InitialPosition::FromBeginning);
    let manager = CatchUpSubscriptions::new(
        fx.context(SubscriptionProperties {
            resubscribe_delay_millis: 200,
            ..properties()
        }),
        vec![RegisteredHandler::from_arc(Arc::clone(&projection))],
        None,
    );
    manager.start_subscriptions().await.unwrap();
    eventually(|| projection.placed().len() == 1).await;

    fx.log.disconnect_all(SubscriptionDropReason::ConnectionClosed);
    eventually(|| !manager.is_active("OrderProjection")).await;
    eventually(|| manager.is_active("OrderProjection") && fx.log.live_subscriptions() == 1).await;

    fx.place_order("Orders-42", "2");
    eventually(|| projection.placed().len() == 2).await;
    assert_eq!(projection.placed(), vec!["1".to_string(), "2".to_string()]);
    manager.drop_subscriptions().await;
}

#[tokio::test]
async fn followers_do_not_subscribe_until_granted() {
    let fx = Fixture::new();
    fx.place_order("Orders-42", "1");

    let projection = OrderProjection::new("Orders-42", InitialPosition::FromBeginning);
    let manager = CatchUpSubscriptions::new(
        fx.context(SubscriptionProperties {
            enable_catchup_subscription_leader_election: true,
            ..properties()
        }),
        vec![RegisteredHandler::from_arc(Arc::clone(&projection))],
        None,
    );
    manager.start_subscriptions().await.unwrap();
    assert!(!manager.is_leader());
    assert_eq!(fx.log.live_subscriptions(), 0);
    assert!(!fx.checkpoints.contains("order-projection", "Orders-42"));

    manager.on_leadership(LeadershipEvent::Granted).await;
    assert!(manager.is_leader());
    eventually(|| projection.placed().len() == 1).await;
    manager.on_leadership(LeadershipEvent::Revoked).await;
}

#[tokio::test]
async fn revoke_stops_every_handle_even_when_one_hangs() {
    let fx = Fixture::new();
    fx.place_order("Orders-1", "1");

    let projection = OrderProjection::new("Orders-1", InitialPosition::FromBeginning);
    let stuck = Arc::new(StuckProjection::default());
    let manager = CatchUpSubscriptions::new(
        fx.context(SubscriptionProperties {
            enable_catchup_subscription_leader_election: true,
            stop_timeout_millis: 100,
            ..properties()
        }),
        vec![
            RegisteredHandler::from_arc(Arc::clone(&projection)),
            RegisteredHandler::from_arc(Arc::clone(&stuck)),
        ],
        None,
    );

    manager.on_leadership_granted().await;
    eventually(|| projection.placed().len() == 1 && stuck.entered.load(Ordering::SeqCst)).await;
    assert!(manager.is_active("OrderProjection"));
    assert!(manager.is_active("StuckProjection"));

    let revoked = tokio::time::timeout(Duration::from_secs(2), manager.on_leadership_revoked()).await;
    assert!(revoked.is_ok(), "revoke must not wait for the stuck handler");
    assert!(!manager.is_leader());
    assert!(!manager.is_active("OrderProjection"));
    assert!(!manager.is_active("StuckProjection"));
    // Only the stuck delivery task is still around.
    eventually(|| fx.log.live_subscriptions() == 1).await;
}

#[tokio::test]
async fn revoke_during_start_leaves_nothing_running() {
    let fx = Fixture::new();
    fx.place_order("Orders-42", "1");

    let mut context = fx.context(properties());
    context.checkpoints = Arc::new(SlowCheckpoints {
        inner: Arc::clone(&fx.checkpoints),
        delay: Duration::from_millis(200),
    }) as Arc<dyn CheckpointStore>;
    let projection = OrderProjection::new("Orders-42", InitialPosition::FromBeginning);
    let manager = CatchUpSubscriptions::new(
        context,
        vec![RegisteredHandler::from_arc(Arc::clone(&projection))],
        None,
    );
    assert!(manager.is_leader());

    let starting = tokio::spawn({
        let manager = manager.clone();
        async move { manager.start_subscriptions().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.on_leadership_revoked().await;
    starting.await.unwrap().unwrap();

    assert!(!manager.is_leader());
    assert!(!manager.is_active("OrderProjection"));
    eventually(|| fx.log.live_subscriptions() == 0).await;
    settle().await;
    assert!(!manager.is_active("OrderProjection"));
}

#[tokio::test]
async fn failed_grant_yields_leadership() {
    let fx = Fixture::new();
    let leadership = Arc::new(ScriptedLeadership::new());
    let projection = OrderProjection::new("Orders-42", InitialPosition::FromBeginning);
    let manager = CatchUpSubscriptions::new(
        fx.context(SubscriptionProperties {
            enable_catchup_subscription_leader_election: true,
            ..properties()
        }),
        vec![RegisteredHandler::from_arc(projection)],
        Some(Arc::clone(&leadership) as Arc<dyn LeadershipContext>),
    );

    fx.log.fail_next_subscriptions(1);
    manager.on_leadership_granted().await;

    assert_eq!(leadership.yields(), 1);
    assert!(!manager.is_active("OrderProjection"));
}

#[tokio::test]
async fn disabled_subscriptions_do_nothing() {
    let fx = Fixture::new();
    let projection = OrderProjection::new("Orders-42", InitialPosition::FromBeginning);
    let manager = CatchUpSubscriptions::new(
        fx.context(SubscriptionProperties {
            enabled: false,
            ..properties()
        }),
        vec![RegisteredHandler::from_arc(projection)],
        None,
    );

    manager.start_subscriptions().await.unwrap();
    assert_eq!(fx.log.live_subscriptions(), 0);
    assert_eq!(fx.transactions.committed(), 0);
    assert_eq!(manager.handlers().len(), 1);
}
