//! Subscription bookkeeping rows: checkpoints and initial positions.
//!
//! Both are keyed by `(group_name, stream_name)`. Checkpoint values are signed
//! to match the relational column type; the domain only ever stores
//! non-negative sequences, but the monotonic update must behave for any value.

use crate::store::StoreError;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

/// Last fully processed position of a consumer group on a stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Consumer group.
    pub group_name: String,
    /// Subscribed stream.
    pub stream_name: String,
    /// Last processed sequence, `None` before anything was processed.
    pub checkpoint: Option<i64>,
}

impl Checkpoint {
    /// Position a catch-up subscription resumes after, `None` meaning the
    /// start of the stream.
    #[must_use]
    pub fn resume_after(&self) -> Option<u64> {
        self.checkpoint.and_then(|value| u64::try_from(value).ok())
    }
}

/// Durable checkpoint rows.
///
/// `increment_if_greater` is the fencing primitive: it must only write when
/// the new value is strictly greater than the stored one, treating an absent
/// value as `-1`, and report the number of affected rows.
pub trait CheckpointStore: Send + Sync {
    /// Insert the row unless it exists. Returns affected rows (0 or 1).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the statement fails.
    fn create_if_not_exists<'a>(
        &'a self,
        group_name: &'a str,
        stream_name: &'a str,
        checkpoint: Option<i64>,
    ) -> BoxFuture<'a, Result<u64, StoreError>>;

    /// Advance the checkpoint if `checkpoint` is strictly greater than the
    /// stored value. Returns affected rows (0 means no advance).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the statement fails.
    fn increment_if_greater<'a>(
        &'a self,
        group_name: &'a str,
        stream_name: &'a str,
        checkpoint: i64,
    ) -> BoxFuture<'a, Result<u64, StoreError>>;

    /// Read the row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    fn current<'a>(
        &'a self,
        group_name: &'a str,
        stream_name: &'a str,
    ) -> BoxFuture<'a, Result<Option<Checkpoint>, StoreError>>;

    /// Remove the row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the statement fails.
    fn delete<'a>(
        &'a self,
        group_name: &'a str,
        stream_name: &'a str,
    ) -> BoxFuture<'a, Result<u64, StoreError>>;
}

/// Replay boundary recorded when a subscription was first set up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialPositionRecord {
    /// Consumer group.
    pub group_name: String,
    /// Subscribed stream.
    pub stream_name: String,
    /// Records below this sequence count as replayed.
    pub initial_position: i64,
}

impl InitialPositionRecord {
    /// The stored boundary as a stream sequence.
    #[must_use]
    pub fn replay_until(&self) -> u64 {
        u64::try_from(self.initial_position).unwrap_or(0)
    }
}

/// Durable initial-position rows.
///
/// The first write wins: later setups of the same subscription must not move
/// the replay boundary.
pub trait InitialPositionStore: Send + Sync {
    /// Insert the row unless it exists. Returns affected rows.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the statement fails.
    fn create_if_not_exists<'a>(
        &'a self,
        record: &'a InitialPositionRecord,
    ) -> BoxFuture<'a, Result<u64, StoreError>>;

    /// Read the row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    fn find<'a>(
        &'a self,
        group_name: &'a str,
        stream_name: &'a str,
    ) -> BoxFuture<'a, Result<Option<InitialPositionRecord>, StoreError>>;
}
