//! Aggregate snapshots.
//!
//! Snapshots only shortcut replay. They are never authoritative: a missing,
//! stale or undecodable snapshot falls back to a full replay.

use crate::aggregate::AggregateRoot;
use crate::store::StoreError;
use futures::future::BoxFuture;
use serde::{Serialize, de::DeserializeOwned};
use std::fmt;

/// Key of a stored snapshot.
///
/// `version` is the snapshot schema version; bumping it invalidates every
/// stored snapshot of the aggregate type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SnapshotId {
    /// Aggregate type name.
    pub aggregate_type: String,
    /// Snapshot schema version.
    pub version: u32,
    /// Aggregate id.
    pub aggregate_id: String,
}

impl SnapshotId {
    /// Build a key.
    #[must_use]
    pub fn new(aggregate_type: impl Into<String>, version: u32, aggregate_id: impl Into<String>) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            version,
            aggregate_id: aggregate_id.into(),
        }
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:v{}:{}", self.aggregate_type, self.version, self.aggregate_id)
    }
}

/// Stored snapshot bytes and the sequence of the last event they include.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotData {
    /// Serialized snapshot.
    pub bytes: Vec<u8>,
    /// Sequence of the last event folded into the snapshot.
    pub last_event_sequence: u64,
}

/// Durable snapshot storage.
pub trait SnapshotStore: Send + Sync {
    /// Store (or replace) a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn save<'a>(
        &'a self,
        id: &'a SnapshotId,
        snapshot: SnapshotData,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Load a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    fn load<'a>(&'a self, id: &'a SnapshotId) -> BoxFuture<'a, Result<Option<SnapshotData>, StoreError>>;
}

/// Store that keeps nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSnapshots;

impl SnapshotStore for NoSnapshots {
    fn save<'a>(
        &'a self,
        _id: &'a SnapshotId,
        _snapshot: SnapshotData,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async { Ok(()) })
    }

    fn load<'a>(&'a self, _id: &'a SnapshotId) -> BoxFuture<'a, Result<Option<SnapshotData>, StoreError>> {
        Box::pin(async { Ok(None) })
    }
}

/// Aggregate that can be captured and restored.
pub trait SnapshottableAggregate: AggregateRoot {
    /// Captured state.
    type Snapshot: Serialize + DeserializeOwned + Send;

    /// Snapshot schema version; increment on breaking changes to the
    /// snapshot shape or to event application logic.
    const SNAPSHOT_VERSION: u32 = 1;

    /// Capture the current state.
    fn create_snapshot(&self) -> Self::Snapshot;

    /// Restore the state captured at `sequence`.
    fn load_from_snapshot(&mut self, snapshot: Self::Snapshot, sequence: u64);

    /// Whether a snapshot should be written after the current save.
    fn should_create_snapshot(&self) -> bool;
}
