//! In-memory bookkeeping stores.
//!
//! HashMap-backed implementations of the checkpoint, initial-position,
//! idempotency and snapshot contracts. They apply the same row semantics as
//! the relational stores (insert-ignore, monotonic update) but take no part
//! in transactions.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use eventstore_tools_core::checkpoint::{
    Checkpoint, CheckpointStore, InitialPositionRecord, InitialPositionStore,
};
use eventstore_tools_core::idempotency::{IdempotencyKey, IdempotencyRecord, IdempotencyStore};
use eventstore_tools_core::snapshot::{SnapshotData, SnapshotId, SnapshotStore};
use eventstore_tools_core::store::StoreError;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

type GroupKey = (String, String);

fn key(group_name: &str, stream_name: &str) -> GroupKey {
    (group_name.to_string(), stream_name.to_string())
}

/// In-memory checkpoint rows.
///
/// # Example
///
/// ```
/// use eventstore_tools_core::checkpoint::CheckpointStore;
/// use eventstore_tools_testing::InMemoryCheckpointStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryCheckpointStore::new();
/// store.create_if_not_exists("projector", "$ce-Order", None).await?;
/// assert_eq!(store.increment_if_greater("projector", "$ce-Order", 3).await?, 1);
/// assert_eq!(store.increment_if_greater("projector", "$ce-Order", 2).await?, 0);
/// assert_eq!(store.checkpoint("projector", "$ce-Order"), Some(3));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryCheckpointStore {
    rows: Arc<RwLock<HashMap<GroupKey, Option<i64>>>>,
}

impl InMemoryCheckpointStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored checkpoint value; `None` when the row is missing or null.
    #[must_use]
    pub fn checkpoint(&self, group_name: &str, stream_name: &str) -> Option<i64> {
        self.rows
            .read()
            .unwrap()
            .get(&key(group_name, stream_name))
            .copied()
            .flatten()
    }

    /// Whether a row exists.
    #[must_use]
    pub fn contains(&self, group_name: &str, stream_name: &str) -> bool {
        self.rows
            .read()
            .unwrap()
            .contains_key(&key(group_name, stream_name))
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn create_if_not_exists<'a>(
        &'a self,
        group_name: &'a str,
        stream_name: &'a str,
        checkpoint: Option<i64>,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let mut rows = self.rows.write().unwrap();
            let key = key(group_name, stream_name);
            if rows.contains_key(&key) {
                return Ok(0);
            }
            rows.insert(key, checkpoint);
            Ok(1)
        })
    }

    fn increment_if_greater<'a>(
        &'a self,
        group_name: &'a str,
        stream_name: &'a str,
        checkpoint: i64,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let mut rows = self.rows.write().unwrap();
            match rows.get_mut(&key(group_name, stream_name)) {
                Some(current) if current.is_none_or(|value| value < checkpoint) => {
                    *current = Some(checkpoint);
                    Ok(1)
                }
                _ => Ok(0),
            }
        })
    }

    fn current<'a>(
        &'a self,
        group_name: &'a str,
        stream_name: &'a str,
    ) -> BoxFuture<'a, Result<Option<Checkpoint>, StoreError>> {
        Box::pin(async move {
            let rows = self.rows.read().unwrap();
            Ok(rows
                .get(&key(group_name, stream_name))
                .map(|checkpoint| Checkpoint {
                    group_name: group_name.to_string(),
                    stream_name: stream_name.to_string(),
                    checkpoint: *checkpoint,
                }))
        })
    }

    fn delete<'a>(
        &'a self,
        group_name: &'a str,
        stream_name: &'a str,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let removed = self
                .rows
                .write()
                .unwrap()
                .remove(&key(group_name, stream_name));
            Ok(u64::from(removed.is_some()))
        })
    }
}

/// In-memory initial position rows.
#[derive(Clone, Debug, Default)]
pub struct InMemoryInitialPositionStore {
    rows: Arc<RwLock<HashMap<GroupKey, InitialPositionRecord>>>,
}

impl InMemoryInitialPositionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.read().unwrap().len()
    }

    /// Whether no row is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.read().unwrap().is_empty()
    }
}

impl InitialPositionStore for InMemoryInitialPositionStore {
    fn create_if_not_exists<'a>(
        &'a self,
        record: &'a InitialPositionRecord,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let mut rows = self.rows.write().unwrap();
            let key = key(&record.group_name, &record.stream_name);
            if rows.contains_key(&key) {
                return Ok(0);
            }
            rows.insert(key, record.clone());
            Ok(1)
        })
    }

    fn find<'a>(
        &'a self,
        group_name: &'a str,
        stream_name: &'a str,
    ) -> BoxFuture<'a, Result<Option<InitialPositionRecord>, StoreError>> {
        Box::pin(async move {
            Ok(self
                .rows
                .read()
                .unwrap()
                .get(&key(group_name, stream_name))
                .cloned())
        })
    }
}

/// In-memory idempotency records.
#[derive(Clone, Debug, Default)]
pub struct InMemoryIdempotencyStore {
    records: Arc<RwLock<HashMap<IdempotencyKey, IdempotencyRecord>>>,
}

impl InMemoryIdempotencyStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// Whether no record is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().unwrap().is_empty()
    }

    /// Stored records of `group_name`.
    #[must_use]
    pub fn records_for(&self, group_name: &str) -> Vec<IdempotencyRecord> {
        self.records
            .read()
            .unwrap()
            .values()
            .filter(|record| record.group_name == group_name)
            .cloned()
            .collect()
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn insert<'a>(&'a self, record: &'a IdempotencyRecord) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let mut records = self.records.write().unwrap();
            let key = record.key();
            if records.contains_key(&key) {
                return Ok(0);
            }
            records.insert(key, record.clone());
            Ok(1)
        })
    }

    fn find<'a>(
        &'a self,
        key: &'a IdempotencyKey,
    ) -> BoxFuture<'a, Result<Option<IdempotencyRecord>, StoreError>> {
        Box::pin(async move { Ok(self.records.read().unwrap().get(key).cloned()) })
    }
}

/// In-memory snapshots.
#[derive(Clone, Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: Arc<RwLock<HashMap<SnapshotId, SnapshotData>>>,
}

impl InMemorySnapshotStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored snapshots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.read().unwrap().len()
    }

    /// Whether no snapshot is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.read().unwrap().is_empty()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn save<'a>(
        &'a self,
        id: &'a SnapshotId,
        snapshot: SnapshotData,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.snapshots.write().unwrap().insert(id.clone(), snapshot);
            Ok(())
        })
    }

    fn load<'a>(&'a self, id: &'a SnapshotId) -> BoxFuture<'a, Result<Option<SnapshotData>, StoreError>> {
        Box::pin(async move { Ok(self.snapshots.read().unwrap().get(id).cloned()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[tokio::test]
    async fn checkpoint_create_is_insert_ignore() {
        let store = InMemoryCheckpointStore::new();
        assert_eq!(store.create_if_not_exists("g", "s", Some(4)).await.unwrap(), 1);
        assert_eq!(store.create_if_not_exists("g", "s", Some(9)).await.unwrap(), 0);
        assert_eq!(store.checkpoint("g", "s"), Some(4));
    }

    #[tokio::test]
    async fn checkpoint_increment_needs_a_row() {
        let store = InMemoryCheckpointStore::new();
        assert_eq!(store.increment_if_greater("g", "s", 1).await.unwrap(), 0);
        assert!(!store.contains("g", "s"));
    }

    #[tokio::test]
    async fn null_checkpoint_accepts_any_value() {
        let store = InMemoryCheckpointStore::new();
        store.create_if_not_exists("g", "s", None).await.unwrap();
        assert_eq!(store.increment_if_greater("g", "s", -1).await.unwrap(), 1);
        assert_eq!(store.increment_if_greater("g", "s", -1).await.unwrap(), 0);
        assert_eq!(store.increment_if_greater("g", "s", 0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn idempotency_insert_ignores_duplicates() {
        let store = InMemoryIdempotencyStore::new();
        let record = IdempotencyRecord {
            event_id: Uuid::new_v4(),
            stream_name: "$ce-Order".into(),
            event_stream_id: "Order-1".into(),
            group_name: "g".into(),
            event_type: "OrderPlaced".into(),
            created_at: Utc::now(),
        };
        assert_eq!(store.insert(&record).await.unwrap(), 1);
        assert_eq!(store.insert(&record).await.unwrap(), 0);
        assert_eq!(store.records_for("g").len(), 1);
        assert!(store.find(&record.key()).await.unwrap().is_some());
    }
}
