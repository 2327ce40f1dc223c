//! Rehydration reproduces the state the aggregate had when it was saved.

#![allow(clippy::unwrap_used)]

use eventstore_tools_core::aggregate::{AggregateChanges, AggregateRoot};
use eventstore_tools_core::event_log::EventLogClient;
use eventstore_tools_core::snapshot::{SnapshotStore, SnapshottableAggregate};
use eventstore_tools_core::stream::ExpectedVersion;
use eventstore_tools_macros::{DomainEvent, EventSet};
use eventstore_tools_runtime::{AggregateRepository, RepositoryError, SnapshottingRepository};
use eventstore_tools_testing::{InMemoryEventLog, InMemorySnapshotStore};
use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(DomainEvent, Serialize, Deserialize, Clone, Debug, PartialEq)]
struct Credited {
    amount: i64,
}

#[derive(DomainEvent, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[domain_event(name = "WalletDebited")]
struct Debited {
    amount: i64,
}

#[derive(EventSet, Clone, Debug, PartialEq)]
enum WalletEvent {
    Credited(Credited),
    Debited(Debited),
}

struct Wallet {
    id: String,
    balance: i64,
    movements: usize,
    changes: AggregateChanges<WalletEvent>,
}

impl Wallet {
    fn book(&mut self, amount: i64) {
        if amount >= 0 {
            self.append_event(Credited { amount }.into());
        } else {
            self.append_event(Debited { amount: -amount }.into());
        }
    }
}

impl AggregateRoot for Wallet {
    type Event = WalletEvent;
    const AGGREGATE_TYPE: &'static str = "Wallet";

    fn new(id: String) -> Self {
        Self {
            id,
            balance: 0,
            movements: 0,
            changes: AggregateChanges::default(),
        }
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn apply(&mut self, event: &WalletEvent) {
        match event {
            WalletEvent::Credited(credit) => self.balance += credit.amount,
            WalletEvent::Debited(debit) => self.balance -= debit.amount,
        }
        self.movements += 1;
    }

    fn changes(&self) -> &AggregateChanges<WalletEvent> {
        &self.changes
    }

    fn changes_mut(&mut self) -> &mut AggregateChanges<WalletEvent> {
        &mut self.changes
    }
}

#[derive(Serialize, Deserialize)]
struct WalletSnapshot {
    balance: i64,
    movements: usize,
}

impl SnapshottableAggregate for Wallet {
    type Snapshot = WalletSnapshot;

    fn create_snapshot(&self) -> WalletSnapshot {
        WalletSnapshot {
            balance: self.balance,
            movements: self.movements,
        }
    }

    fn load_from_snapshot(&mut self, snapshot: WalletSnapshot, _sequence: u64) {
        self.balance = snapshot.balance;
        self.movements = snapshot.movements;
    }

    fn should_create_snapshot(&self) -> bool {
        self.movements % 3 == 0
    }
}

fn repositories() -> (AggregateRepository<Wallet>, SnapshottingRepository<Wallet>) {
    let log = Arc::new(InMemoryEventLog::new());
    let events = AggregateRepository::new(log as Arc<dyn EventLogClient>).with_batch_size(2);
    let snapshots = Arc::new(InMemorySnapshotStore::new()) as Arc<dyn SnapshotStore>;
    (events.clone(), SnapshottingRepository::new(events, snapshots))
}

proptest! {
    #[test]
    fn reloaded_wallet_matches_live_state(
        batches in proptest::collection::vec(proptest::collection::vec(-50i64..50, 1..5), 1..6)
    ) {
        let (events, snapshotting) = repositories();

        let (live, replayed, restored) = tokio_test::block_on(async {
            let mut live = Wallet::new("w-1".into());
            for batch in &batches {
                let mut wallet = snapshotting
                    .find_one("w-1")
                    .await
                    .unwrap()
                    .unwrap_or_else(|| Wallet::new("w-1".into()));
                for amount in batch {
                    wallet.book(*amount);
                    live.book(*amount);
                }
                snapshotting.save(&mut wallet).await.unwrap();
            }
            let replayed = events.find_one("w-1").await.unwrap().unwrap();
            let restored = snapshotting.find_one("w-1").await.unwrap().unwrap();
            (live, replayed, restored)
        });

        let total: usize = batches.iter().map(Vec::len).sum();
        prop_assert_eq!(replayed.balance, live.balance);
        prop_assert_eq!(restored.balance, live.balance);
        prop_assert_eq!(replayed.movements, total);
        prop_assert_eq!(restored.movements, total);
        prop_assert_eq!(replayed.expected_version(), restored.expected_version());
        prop_assert_eq!(replayed.expected_version(), ExpectedVersion::Exact(u64::try_from(total).unwrap() - 1));
    }
}

#[tokio::test]
async fn concurrent_writers_cannot_both_win() -> anyhow::Result<()> {
    let (events, _) = repositories();
    let mut wallet = Wallet::new("w-2".into());
    wallet.book(10);
    events.save(&mut wallet).await?;

    let mut first = events.find_one("w-2").await?.unwrap();
    let mut second = events.find_one("w-2").await?.unwrap();
    first.book(-3);
    second.book(-8);
    events.save(&mut first).await?;

    let error = events.save(&mut second).await.unwrap_err();
    assert!(matches!(error, RepositoryError::AggregateBehindStream { .. }));

    let mut retried = events.find_one("w-2").await?.unwrap();
    retried.book(-8);
    events.save(&mut retried).await?;
    assert_eq!(events.find_one("w-2").await?.unwrap().balance, -1);
    Ok(())
}
