//! Shared fixture for subscription scenarios.

#![allow(dead_code)]

use eventstore_tools_core::checkpoint::{CheckpointStore, InitialPositionStore};
use eventstore_tools_core::event_log::EventLogClient;
use eventstore_tools_core::idempotency::IdempotencyStore;
use eventstore_tools_core::transaction::TransactionManager;
use eventstore_tools_runtime::{EventIdempotencyStorage, SubscriptionContext, SubscriptionProperties};
use eventstore_tools_testing::{
    InMemoryCheckpointStore, InMemoryEventLog, InMemoryIdempotencyStore,
    InMemoryInitialPositionStore, RecordingTransactionManager, init_tracing, wait_until,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPlaced {
    pub order_id: String,
}

impl eventstore_tools_core::event::DomainEvent for OrderPlaced {
    const EVENT_TYPE: &'static str = "OrderPlaced";
}

pub struct Fixture {
    pub log: Arc<InMemoryEventLog>,
    pub checkpoints: Arc<InMemoryCheckpointStore>,
    pub initial_positions: Arc<InMemoryInitialPositionStore>,
    pub idempotency: Arc<InMemoryIdempotencyStore>,
    pub transactions: Arc<RecordingTransactionManager>,
}

impl Fixture {
    pub fn new() -> Self {
        init_tracing();
        Self {
            log: Arc::new(InMemoryEventLog::new()),
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            initial_positions: Arc::new(InMemoryInitialPositionStore::new()),
            idempotency: Arc::new(InMemoryIdempotencyStore::new()),
            transactions: Arc::new(RecordingTransactionManager::new()),
        }
    }

    pub fn context(&self, properties: SubscriptionProperties) -> SubscriptionContext {
        SubscriptionContext {
            client: Arc::clone(&self.log) as Arc<dyn EventLogClient>,
            checkpoints: Arc::clone(&self.checkpoints) as Arc<dyn CheckpointStore>,
            initial_positions: Arc::clone(&self.initial_positions) as Arc<dyn InitialPositionStore>,
            idempotency: EventIdempotencyStorage::new(
                Arc::clone(&self.idempotency) as Arc<dyn IdempotencyStore>
            ),
            transactions: Arc::clone(&self.transactions) as Arc<dyn TransactionManager>,
            properties,
        }
    }

    pub fn place_order(&self, stream: &str, order_id: &str) {
        self.log
            .append_json(stream, "OrderPlaced", &serde_json::json!({ "orderId": order_id }))
            .unwrap();
    }
}

/// Enabled, no leader election, short delays.
pub fn properties() -> SubscriptionProperties {
    SubscriptionProperties {
        enabled: true,
        enable_catchup_subscription_leader_election: false,
        resubscribe_delay_millis: 20,
        stop_timeout_millis: 200,
        ..SubscriptionProperties::default()
    }
}

pub async fn eventually(condition: impl FnMut() -> bool) {
    assert!(
        wait_until(Duration::from_secs(5), condition).await,
        "condition not met in time"
    );
}

/// Let background tasks run for a while.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}
