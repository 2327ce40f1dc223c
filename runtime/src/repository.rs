//! Aggregate persistence.
//!
//! An aggregate lives in the stream `<AGGREGATE_TYPE>-<id>`. Loading folds
//! every readable record of that stream; saving appends the pending events
//! under the last committed sequence, so two writers racing on one aggregate
//! cannot both win.
//!
//! [`SnapshottingRepository`] additionally restores from a stored snapshot
//! and only folds the records after it. Snapshots never decide correctness:
//! whatever goes wrong with them degrades to a full replay.

use crate::metrics::RepositoryMetrics;
use eventstore_tools_core::aggregate::AggregateRoot;
use eventstore_tools_core::event::{EventError, EventSet};
use eventstore_tools_core::event_log::{EventLogClient, EventLogError};
use eventstore_tools_core::metadata::{EmptyMetadataSource, MetadataSource, merge_metadata};
use eventstore_tools_core::record::NewRecord;
use eventstore_tools_core::snapshot::{
    SnapshotData, SnapshotId, SnapshotStore, SnapshottableAggregate,
};
use eventstore_tools_core::stream::{ExpectedVersion, StreamId};
use futures::StreamExt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Records fetched per read request while rehydrating.
pub const DEFAULT_READ_BATCH_SIZE: usize = 4096;

/// Errors of [`AggregateRepository`].
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// Another writer appended to the stream since the aggregate was loaded.
    /// Reload and retry the command.
    #[error("Aggregate {stream_id} is behind its stream: expected {expected}, stream is at {actual:?}")]
    AggregateBehindStream {
        /// Stream of the aggregate.
        stream_id: StreamId,
        /// Version the save expected.
        expected: ExpectedVersion,
        /// Last sequence of the stream.
        actual: Option<u64>,
    },

    /// The event log failed.
    #[error(transparent)]
    EventLog(#[from] EventLogError),

    /// A stored record could not be decoded.
    #[error("Failed to decode event: {0}")]
    Decode(#[source] EventError),

    /// A pending event could not be encoded.
    #[error("Failed to encode event: {0}")]
    Encode(#[source] EventError),
}

/// Loads and saves aggregates of type `A`.
pub struct AggregateRepository<A> {
    client: Arc<dyn EventLogClient>,
    metadata: Arc<dyn MetadataSource>,
    batch_size: usize,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A> Clone for AggregateRepository<A> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            metadata: Arc::clone(&self.metadata),
            batch_size: self.batch_size,
            _aggregate: PhantomData,
        }
    }
}

impl<A: AggregateRoot> AggregateRepository<A> {
    /// Repository without default metadata.
    #[must_use]
    pub fn new(client: Arc<dyn EventLogClient>) -> Self {
        Self {
            client,
            metadata: Arc::new(EmptyMetadataSource),
            batch_size: DEFAULT_READ_BATCH_SIZE,
            _aggregate: PhantomData,
        }
    }

    /// Attach `source`'s metadata to every saved event.
    #[must_use]
    pub fn with_metadata_source(mut self, source: Arc<dyn MetadataSource>) -> Self {
        self.metadata = source;
        self
    }

    /// Fetch `batch_size` records per read request.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Stream holding the aggregate `id`.
    #[must_use]
    pub fn stream_id(id: &str) -> StreamId {
        StreamId::for_aggregate(A::AGGREGATE_TYPE, id)
    }

    /// Rehydrate the aggregate `id`.
    ///
    /// Returns `None` when its stream does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Decode`] for an undecodable record and
    /// [`RepositoryError::EventLog`] when reading fails.
    pub async fn find_one(&self, id: &str) -> Result<Option<A>, RepositoryError> {
        let started = Instant::now();
        let found = self.rehydrate(A::new(id.to_string()), None).await;
        self.observe(id, started, &found);
        found
    }

    /// Append the pending events of `aggregate` and mark them committed.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::AggregateBehindStream`] when the stream
    /// moved since the aggregate was loaded; the pending events stay pending.
    pub async fn save(&self, aggregate: &mut A) -> Result<(), RepositoryError> {
        let pending = aggregate.uncommitted_events();
        if pending.is_empty() {
            return Ok(());
        }

        let defaults = self.metadata.metadata(aggregate.id());
        let records = pending
            .iter()
            .map(|message| {
                let event_type = message.event.event_type();
                let data = message.event.encode().map_err(RepositoryError::Encode)?;
                NewRecord::new(event_type, data)
                    .with_id(message.event_id)
                    .with_metadata(&merge_metadata(&defaults, &message.metadata))
                    .map_err(|source| {
                        RepositoryError::Encode(EventError::Serialization {
                            event_type: event_type.to_string(),
                            source,
                        })
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let count = records.len();

        let stream_id = Self::stream_id(aggregate.id());
        let expected = aggregate.expected_version();
        match self.client.append(stream_id.clone(), expected, records).await {
            Ok(_) => {}
            Err(EventLogError::VersionConflict { actual, .. }) => {
                tracing::warn!(
                    stream_id = %stream_id,
                    %expected,
                    ?actual,
                    "Aggregate is behind its stream"
                );
                return Err(RepositoryError::AggregateBehindStream {
                    stream_id,
                    expected,
                    actual,
                });
            }
            Err(err) => return Err(err.into()),
        }

        aggregate.mark_committed();
        tracing::debug!(
            stream_id = %stream_id,
            events = count,
            %expected,
            "Saved aggregate"
        );
        Ok(())
    }

    /// Fold the stream into `aggregate`, starting after `restored_at` when
    /// the aggregate was restored from a snapshot.
    async fn rehydrate(
        &self,
        mut aggregate: A,
        restored_at: Option<u64>,
    ) -> Result<Option<A>, RepositoryError> {
        let stream_id = Self::stream_id(aggregate.id());
        let from = match restored_at {
            Some(sequence) => sequence + 1,
            None => match self.client.stream_metadata(stream_id.clone()).await {
                Ok(result) => result.metadata.first_readable_sequence(),
                Err(EventLogError::StreamNotFound(_)) => return Ok(None),
                Err(err) => return Err(err.into()),
            },
        };

        let mut records = self.client.read_forward(stream_id, from, self.batch_size);
        while let Some(record) = records.next().await {
            let record = match record {
                Ok(record) => record,
                Err(EventLogError::StreamNotFound(_)) if restored_at.is_none() => return Ok(None),
                Err(EventLogError::StreamNotFound(_)) => break,
                Err(err) => return Err(err.into()),
            };
            aggregate
                .load_from_history(&record)
                .map_err(RepositoryError::Decode)?;
        }
        Ok(Some(aggregate))
    }

    fn observe(&self, id: &str, started: Instant, found: &Result<Option<A>, RepositoryError>) {
        let elapsed = started.elapsed();
        RepositoryMetrics::record_rehydration(A::AGGREGATE_TYPE, elapsed);
        if let Ok(found) = found {
            tracing::debug!(
                aggregate_type = A::AGGREGATE_TYPE,
                aggregate_id = id,
                found = found.is_some(),
                elapsed_ms = elapsed.as_millis(),
                "Rehydrated aggregate"
            );
        }
    }
}

/// Repository that restores from and writes snapshots.
pub struct SnapshottingRepository<A> {
    events: AggregateRepository<A>,
    snapshots: Arc<dyn SnapshotStore>,
}

impl<A> Clone for SnapshottingRepository<A> {
    fn clone(&self) -> Self {
        Self {
            events: self.events.clone(),
            snapshots: Arc::clone(&self.snapshots),
        }
    }
}

impl<A: SnapshottableAggregate> SnapshottingRepository<A> {
    /// Wrap `events`, keeping snapshots in `snapshots`.
    #[must_use]
    pub fn new(events: AggregateRepository<A>, snapshots: Arc<dyn SnapshotStore>) -> Self {
        Self { events, snapshots }
    }

    /// Key of the snapshot of aggregate `id`.
    #[must_use]
    pub fn snapshot_id(id: &str) -> SnapshotId {
        SnapshotId::new(A::AGGREGATE_TYPE, A::SNAPSHOT_VERSION, id)
    }

    /// Rehydrate the aggregate `id`, starting from its snapshot when one can
    /// be restored.
    ///
    /// # Errors
    ///
    /// See [`AggregateRepository::find_one`].
    pub async fn find_one(&self, id: &str) -> Result<Option<A>, RepositoryError> {
        let started = Instant::now();
        let mut aggregate = A::new(id.to_string());
        let restored_at = self.restore(&mut aggregate).await;
        let found = match restored_at {
            Some(_) => self.events.rehydrate(aggregate, restored_at).await,
            // A failed restore may have touched the state.
            None => self.events.rehydrate(A::new(id.to_string()), None).await,
        };
        self.events.observe(id, started, &found);
        found
    }

    /// Save like [`AggregateRepository::save`], then write a snapshot if
    /// the aggregate asks for one. Snapshot failures are logged and counted,
    /// never returned.
    ///
    /// # Errors
    ///
    /// See [`AggregateRepository::save`].
    pub async fn save(&self, aggregate: &mut A) -> Result<(), RepositoryError> {
        self.events.save(aggregate).await?;
        if aggregate.should_create_snapshot() {
            self.write_snapshot(aggregate).await;
        }
        Ok(())
    }

    /// Apply the stored snapshot to `aggregate`; returns the sequence it
    /// was taken at.
    async fn restore(&self, aggregate: &mut A) -> Option<u64> {
        let id = Self::snapshot_id(aggregate.id());
        let started = Instant::now();
        let stored = match self.snapshots.load(&id).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(snapshot = %id, error = %err, "Failed to load snapshot");
                RepositoryMetrics::record_snapshot_failure(A::AGGREGATE_TYPE);
                return None;
            }
        };

        match bincode::deserialize::<A::Snapshot>(&stored.bytes) {
            Ok(snapshot) => {
                aggregate.load_from_snapshot(snapshot, stored.last_event_sequence);
                aggregate.restore_committed_sequence(stored.last_event_sequence);
                tracing::debug!(
                    snapshot = %id,
                    sequence = stored.last_event_sequence,
                    elapsed_ms = started.elapsed().as_millis(),
                    "Loaded snapshot"
                );
                Some(stored.last_event_sequence)
            }
            Err(err) => {
                tracing::warn!(snapshot = %id, error = %err, "Failed to decode snapshot, replaying stream");
                RepositoryMetrics::record_snapshot_failure(A::AGGREGATE_TYPE);
                None
            }
        }
    }

    async fn write_snapshot(&self, aggregate: &A) {
        let Some(sequence) = aggregate.changes().last_committed_sequence() else {
            return;
        };
        let id = Self::snapshot_id(aggregate.id());
        let started = Instant::now();

        let bytes = match bincode::serialize(&aggregate.create_snapshot()) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(snapshot = %id, error = %err, "Failed to encode snapshot");
                RepositoryMetrics::record_snapshot_failure(A::AGGREGATE_TYPE);
                return;
            }
        };
        let data = SnapshotData {
            bytes,
            last_event_sequence: sequence,
        };
        match self.snapshots.save(&id, data).await {
            Ok(()) => tracing::debug!(
                snapshot = %id,
                sequence,
                elapsed_ms = started.elapsed().as_millis(),
                "Created snapshot"
            ),
            Err(err) => {
                tracing::warn!(snapshot = %id, sequence, error = %err, "Failed to save snapshot");
                RepositoryMetrics::record_snapshot_failure(A::AGGREGATE_TYPE);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use eventstore_tools_core::aggregate::AggregateChanges;
    use eventstore_tools_core::event::DomainEvent;
    use eventstore_tools_core::metadata::AggregateIdMetadataSource;
    use eventstore_tools_core::stream::StreamMetadata;
    use eventstore_tools_core::store::StoreError;
    use eventstore_tools_testing::{InMemoryEventLog, InMemorySnapshotStore};
    use futures::future::BoxFuture;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Deposited {
        amount: i64,
    }

    impl DomainEvent for Deposited {
        const EVENT_TYPE: &'static str = "Deposited";
    }

    #[derive(Clone, Debug, PartialEq)]
    enum AccountEvent {
        Deposited(Deposited),
    }

    impl EventSet for AccountEvent {
        fn event_type(&self) -> &'static str {
            Deposited::EVENT_TYPE
        }

        fn encode(&self) -> Result<Vec<u8>, EventError> {
            let Self::Deposited(event) = self;
            event.to_json()
        }

        fn decode(event_type: &str, data: &[u8]) -> Result<Option<Self>, EventError> {
            if event_type == Deposited::EVENT_TYPE {
                return Deposited::from_json(data).map(|e| Some(Self::Deposited(e)));
            }
            Ok(None)
        }

        fn event_types() -> &'static [&'static str] {
            const TYPES: &[&str] = &[Deposited::EVENT_TYPE];
            TYPES
        }
    }

    struct Account {
        id: String,
        balance: i64,
        applied: usize,
        changes: AggregateChanges<AccountEvent>,
    }

    impl Account {
        fn deposit(&mut self, amount: i64) {
            self.append_event(AccountEvent::Deposited(Deposited { amount }));
        }
    }

    impl AggregateRoot for Account {
        type Event = AccountEvent;
        const AGGREGATE_TYPE: &'static str = "Account";

        fn new(id: String) -> Self {
            Self {
                id,
                balance: 0,
                applied: 0,
                changes: AggregateChanges::default(),
            }
        }

        fn id(&self) -> &str {
            &self.id
        }

        fn apply(&mut self, event: &AccountEvent) {
            let AccountEvent::Deposited(deposit) = event;
            self.balance += deposit.amount;
            self.applied += 1;
        }

        fn changes(&self) -> &AggregateChanges<AccountEvent> {
            &self.changes
        }

        fn changes_mut(&mut self) -> &mut AggregateChanges<AccountEvent> {
            &mut self.changes
        }
    }

    #[derive(Serialize, Deserialize)]
    struct AccountSnapshot {
        balance: i64,
    }

    impl SnapshottableAggregate for Account {
        type Snapshot = AccountSnapshot;

        fn create_snapshot(&self) -> AccountSnapshot {
            AccountSnapshot {
                balance: self.balance,
            }
        }

        fn load_from_snapshot(&mut self, snapshot: AccountSnapshot, _sequence: u64) {
            self.balance = snapshot.balance;
        }

        fn should_create_snapshot(&self) -> bool {
            true
        }
    }

    struct BrokenSnapshots;

    impl SnapshotStore for BrokenSnapshots {
        fn save<'a>(
            &'a self,
            _id: &'a SnapshotId,
            _snapshot: SnapshotData,
        ) -> BoxFuture<'a, Result<(), StoreError>> {
            Box::pin(async { Err(StoreError::Database("snapshot table missing".into())) })
        }

        fn load<'a>(
            &'a self,
            _id: &'a SnapshotId,
        ) -> BoxFuture<'a, Result<Option<SnapshotData>, StoreError>> {
            Box::pin(async { Err(StoreError::Database("snapshot table missing".into())) })
        }
    }

    fn repository(log: &Arc<InMemoryEventLog>) -> AggregateRepository<Account> {
        AggregateRepository::new(Arc::clone(log) as Arc<dyn EventLogClient>)
    }

    #[tokio::test]
    async fn missing_stream_is_absent() {
        let log = Arc::new(InMemoryEventLog::new());
        assert!(repository(&log).find_one("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load_folds_events() {
        let log = Arc::new(InMemoryEventLog::new());
        let repository = repository(&log).with_batch_size(2);

        let mut account = Account::new("a/1".into());
        account.deposit(10);
        account.deposit(5);
        account.deposit(1);
        repository.save(&mut account).await.unwrap();
        assert!(account.uncommitted_events().is_empty());
        assert_eq!(account.expected_version(), ExpectedVersion::Exact(2));

        let loaded = repository.find_one("a/1").await.unwrap().unwrap();
        assert_eq!(loaded.balance, 16);
        assert_eq!(loaded.expected_version(), ExpectedVersion::Exact(2));
    }

    #[tokio::test]
    async fn stale_aggregate_is_behind_stream() {
        let log = Arc::new(InMemoryEventLog::new());
        let repository = repository(&log);

        let mut account = Account::new("1".into());
        account.deposit(10);
        repository.save(&mut account).await.unwrap();

        let mut first = repository.find_one("1").await.unwrap().unwrap();
        let mut second = repository.find_one("1").await.unwrap().unwrap();
        first.deposit(1);
        repository.save(&mut first).await.unwrap();
        second.deposit(2);

        let error = repository.save(&mut second).await.unwrap_err();
        assert!(matches!(
            error,
            RepositoryError::AggregateBehindStream {
                expected: ExpectedVersion::Exact(0),
                actual: Some(1),
                ..
            }
        ));
        assert_eq!(second.uncommitted_events().len(), 1);
    }

    #[tokio::test]
    async fn load_starts_at_truncate_marker() {
        let log = Arc::new(InMemoryEventLog::new());
        let repository = repository(&log);

        let mut account = Account::new("1".into());
        for amount in [1, 2, 4, 8] {
            account.deposit(amount);
        }
        repository.save(&mut account).await.unwrap();
        log.set_stream_metadata(
            AggregateRepository::<Account>::stream_id("1"),
            ExpectedVersion::Any,
            StreamMetadata {
                truncate_before: Some(2),
            },
        )
        .await
        .unwrap();

        let loaded = repository.find_one("1").await.unwrap().unwrap();
        assert_eq!(loaded.balance, 12);
        assert_eq!(loaded.expected_version(), ExpectedVersion::Exact(3));
    }

    #[tokio::test]
    async fn default_metadata_is_merged_into_records() {
        let log = Arc::new(InMemoryEventLog::new());
        let repository = repository(&log).with_metadata_source(Arc::new(AggregateIdMetadataSource));

        let mut account = Account::new("7".into());
        account.deposit(3);
        repository.save(&mut account).await.unwrap();

        let last = log
            .read_last(AggregateRepository::<Account>::stream_id("7"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            last.metadata_map().get("aggregateId"),
            Some(&serde_json::json!("7"))
        );
    }

    #[tokio::test]
    async fn snapshot_shortcuts_replay() {
        let log = Arc::new(InMemoryEventLog::new());
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let repository = SnapshottingRepository::new(repository(&log), snapshots.clone());

        let mut account = Account::new("1".into());
        account.deposit(10);
        account.deposit(20);
        repository.save(&mut account).await.unwrap();

        let mut reloaded = repository.find_one("1").await.unwrap().unwrap();
        assert_eq!(reloaded.balance, 30);
        assert_eq!(reloaded.applied, 0);
        assert_eq!(reloaded.expected_version(), ExpectedVersion::Exact(1));

        reloaded.deposit(5);
        repository.save(&mut reloaded).await.unwrap();
        let stored = snapshots
            .load(&SnapshottingRepository::<Account>::snapshot_id("1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.last_event_sequence, 2);
    }

    #[tokio::test]
    async fn corrupt_snapshot_falls_back_to_replay() {
        let log = Arc::new(InMemoryEventLog::new());
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let repository = SnapshottingRepository::new(repository(&log), snapshots.clone());

        let mut account = Account::new("1".into());
        account.deposit(10);
        account.deposit(20);
        repository.save(&mut account).await.unwrap();
        snapshots
            .save(
                &SnapshottingRepository::<Account>::snapshot_id("1"),
                SnapshotData {
                    bytes: vec![0xff],
                    last_event_sequence: 1,
                },
            )
            .await
            .unwrap();

        let reloaded = repository.find_one("1").await.unwrap().unwrap();
        assert_eq!(reloaded.balance, 30);
        assert_eq!(reloaded.applied, 2);
    }

    #[tokio::test]
    async fn snapshot_store_failures_never_fail_save_or_load() {
        let log = Arc::new(InMemoryEventLog::new());
        let repository = SnapshottingRepository::new(repository(&log), Arc::new(BrokenSnapshots));

        let mut account = Account::new("1".into());
        account.deposit(10);
        repository.save(&mut account).await.unwrap();

        let reloaded = repository.find_one("1").await.unwrap().unwrap();
        assert_eq!(reloaded.balance, 10);
    }
}
