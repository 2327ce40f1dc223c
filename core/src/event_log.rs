//! Event log client contract.
//!
//! The event log is an external append-only store with per-stream optimistic
//! versioning, per-stream metadata and two subscription primitives:
//!
//! - **catch-up**: client driven; the subscriber names the position to start
//!   after and the client pushes every later record, then live ones.
//! - **persistent**: server managed; the server tracks the group position and
//!   redelivers any record that is not acknowledged in time.
//!
//! The transport behind this trait is not part of this crate.
//! `eventstore-tools-testing` ships an in-memory implementation.
//!
//! # Delivery contract
//!
//! Listener callbacks for one subscription are invoked sequentially: the next
//! record is delivered only after the future returned by `on_event` resolves.
//! If `on_event` fails, the client stops the subscription and calls
//! `on_close` with [`SubscriptionDropReason::EventHandlerException`] and the
//! error. `on_close` is called at most once per subscription and is also
//! called, with [`SubscriptionDropReason::UserInitiated`], after
//! [`SubscriptionHandle::stop`].

use crate::error::BoxError;
use crate::record::{AppendResult, NewRecord, ResolvedRecord, StreamRecord};
use crate::stream::{ExpectedVersion, StreamId, StreamMetadata, StreamMetadataResult};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors reported by the event log client.
#[derive(Error, Debug)]
pub enum EventLogError {
    /// The stream is not at the expected version.
    #[error("Version conflict on {stream_id}: expected {expected}, found {actual:?}")]
    VersionConflict {
        /// Stream the append targeted.
        stream_id: StreamId,
        /// Precondition sent with the append.
        expected: ExpectedVersion,
        /// Last sequence of the stream, `None` if it does not exist.
        actual: Option<u64>,
    },

    /// The stream does not exist.
    #[error("Stream not found: {0}")]
    StreamNotFound(StreamId),

    /// The stream was hard deleted.
    #[error("Stream deleted: {0}")]
    StreamDeleted(StreamId),

    /// A persistent subscription with this group already exists.
    #[error("Persistent subscription {group_name} on {stream_id} already exists")]
    SubscriptionAlreadyExists {
        /// Subscribed stream.
        stream_id: StreamId,
        /// Consumer group.
        group_name: String,
    },

    /// No persistent subscription with this group exists.
    #[error("Persistent subscription {group_name} on {stream_id} not found")]
    SubscriptionNotFound {
        /// Subscribed stream.
        stream_id: StreamId,
        /// Consumer group.
        group_name: String,
    },

    /// Connection to the log was lost or could not be established.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The log reported an internal failure.
    #[error("Server error: {0}")]
    Server(String),

    /// The operation did not complete in time.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// A payload or metadata document could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Why a subscription stopped delivering.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionDropReason {
    /// Stopped through its handle.
    UserInitiated,
    /// Credentials rejected.
    NotAuthenticated,
    /// Credentials lack permission for the stream.
    AccessDenied,
    /// The subscribe request itself failed.
    SubscribingError,
    /// The server reported an error.
    ServerError,
    /// The connection was closed.
    ConnectionClosed,
    /// Reading history for a catch-up subscription failed.
    CatchUpError,
    /// The client-side delivery queue overflowed.
    ProcessingQueueOverflow,
    /// The listener's `on_event` failed.
    EventHandlerException,
    /// The persistent group has no free consumer slot.
    MaxSubscribersReached,
    /// The persistent group was deleted on the server.
    PersistentSubscriptionDeleted,
    /// The persistent group does not exist.
    NotFound,
    /// Unclassified.
    Unknown,
}

impl SubscriptionDropReason {
    /// Infrastructure-level reasons after which resubscribing is expected to
    /// recover.
    #[must_use]
    pub const fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed
                | Self::ServerError
                | Self::SubscribingError
                | Self::UserInitiated
                | Self::ProcessingQueueOverflow
                | Self::Unknown
        )
    }
}

impl fmt::Display for SubscriptionDropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a persistent subscription spreads records across its consumers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsumerStrategy {
    /// Everything goes to one consumer, the others are standby.
    DispatchToSingle,
    /// Records rotate across consumers.
    #[default]
    RoundRobin,
    /// Records of one originating stream stick to one consumer.
    Pinned,
}

/// Settings used when creating or updating a persistent subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistentSubscriptionSettings {
    /// Sequence the group starts at (inclusive).
    pub start_from: u64,
    /// Consumer balancing.
    pub consumer_strategy: ConsumerStrategy,
    /// Time after which an unacknowledged record is redelivered.
    pub message_timeout: Duration,
    /// Deliveries of one record before it is parked.
    pub max_retry_count: u32,
    /// Acknowledgements the server batches before writing its checkpoint.
    pub min_checkpoint_count: u32,
    /// Whether links are resolved to their targets.
    pub resolve_link_tos: bool,
}

impl Default for PersistentSubscriptionSettings {
    fn default() -> Self {
        Self {
            start_from: 0,
            consumer_strategy: ConsumerStrategy::default(),
            message_timeout: Duration::from_secs(30),
            max_retry_count: 10,
            min_checkpoint_count: 10,
            resolve_link_tos: true,
        }
    }
}

/// A live subscription.
pub trait SubscriptionHandle: Send + Sync {
    /// Ask the subscription to stop and resolve once it has.
    ///
    /// The listener receives `on_close(UserInitiated, None)` unless it was
    /// already closed.
    fn stop(self: Box<Self>) -> BoxFuture<'static, ()>;
}

/// Receiver of a catch-up subscription.
pub trait CatchUpListener: Send + Sync {
    /// Handle one delivered record.
    ///
    /// # Errors
    ///
    /// Any error closes the subscription with
    /// [`SubscriptionDropReason::EventHandlerException`].
    fn on_event(&self, record: ResolvedRecord) -> BoxFuture<'_, Result<(), BoxError>>;

    /// History has been read; further records are live.
    fn on_live_processing_started(&self) {}

    /// The subscription stopped.
    fn on_close(&self, reason: SubscriptionDropReason, error: Option<BoxError>);
}

/// Acknowledgement channel of a persistent subscription.
pub trait PersistentSubscriptionAck: Send + Sync {
    /// Tell the server this record was processed.
    ///
    /// # Errors
    ///
    /// Returns an error if the acknowledgement could not be delivered.
    fn acknowledge(&self, event_id: Uuid) -> BoxFuture<'_, Result<(), EventLogError>>;
}

/// Receiver of a persistent subscription.
pub trait PersistentListener: Send + Sync {
    /// Handle one delivered record and acknowledge it through `subscription`.
    ///
    /// # Errors
    ///
    /// Any error closes the subscription with
    /// [`SubscriptionDropReason::EventHandlerException`]; the record stays
    /// unacknowledged and is redelivered by the server.
    fn on_event<'a>(
        &'a self,
        subscription: &'a dyn PersistentSubscriptionAck,
        record: ResolvedRecord,
    ) -> BoxFuture<'a, Result<(), BoxError>>;

    /// The subscription stopped.
    fn on_close(&self, reason: SubscriptionDropReason, error: Option<BoxError>);
}

/// Client of the external event log.
///
/// Uses boxed futures instead of `async fn` so it can be shared as
/// `Arc<dyn EventLogClient>`.
pub trait EventLogClient: Send + Sync {
    /// Append records to a stream.
    ///
    /// # Errors
    ///
    /// - `VersionConflict` when the stream is not at `expected_version`
    /// - `Connection`/`Server` on transport failures
    fn append(
        &self,
        stream_id: StreamId,
        expected_version: ExpectedVersion,
        records: Vec<NewRecord>,
    ) -> BoxFuture<'_, Result<AppendResult, EventLogError>>;

    /// Read a stream forwards starting at `from` (inclusive), fetching
    /// `batch_size` records per round trip.
    ///
    /// A missing stream yields a single `StreamNotFound` error item.
    fn read_forward(
        &self,
        stream_id: StreamId,
        from: u64,
        batch_size: usize,
    ) -> BoxStream<'_, Result<StreamRecord, EventLogError>>;

    /// Read the last record of a stream, resolving links.
    ///
    /// Returns `Ok(None)` for an existing stream without readable records.
    ///
    /// # Errors
    ///
    /// Returns `StreamNotFound` if the stream does not exist.
    fn read_last(
        &self,
        stream_id: StreamId,
    ) -> BoxFuture<'_, Result<Option<StreamRecord>, EventLogError>>;

    /// Read the metadata of a stream. Never written metadata reads as the
    /// default.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failures.
    fn stream_metadata(
        &self,
        stream_id: StreamId,
    ) -> BoxFuture<'_, Result<StreamMetadataResult, EventLogError>>;

    /// Replace the metadata of a stream.
    ///
    /// # Errors
    ///
    /// Returns `VersionConflict` when the metadata is not at
    /// `expected_meta_version`.
    fn set_stream_metadata(
        &self,
        stream_id: StreamId,
        expected_meta_version: ExpectedVersion,
        metadata: StreamMetadata,
    ) -> BoxFuture<'_, Result<(), EventLogError>>;

    /// Open a catch-up subscription delivering every record after `after`
    /// (exclusive; `None` means from the first record).
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be opened.
    fn subscribe_catch_up(
        &self,
        stream_id: StreamId,
        after: Option<u64>,
        listener: Arc<dyn CatchUpListener>,
    ) -> BoxFuture<'_, Result<Box<dyn SubscriptionHandle>, EventLogError>>;

    /// Connect to an existing persistent subscription group.
    ///
    /// # Errors
    ///
    /// Returns `SubscriptionNotFound` if the group was never created.
    fn subscribe_persistent(
        &self,
        stream_id: StreamId,
        group_name: String,
        listener: Arc<dyn PersistentListener>,
    ) -> BoxFuture<'_, Result<Box<dyn SubscriptionHandle>, EventLogError>>;

    /// Create a persistent subscription group.
    ///
    /// # Errors
    ///
    /// Returns `SubscriptionAlreadyExists` if the group exists.
    fn create_persistent_subscription(
        &self,
        stream_id: StreamId,
        group_name: String,
        settings: PersistentSubscriptionSettings,
    ) -> BoxFuture<'_, Result<(), EventLogError>>;

    /// Replace the settings of an existing persistent subscription group.
    ///
    /// # Errors
    ///
    /// Returns `SubscriptionNotFound` if the group does not exist.
    fn update_persistent_subscription(
        &self,
        stream_id: StreamId,
        group_name: String,
        settings: PersistentSubscriptionSettings,
    ) -> BoxFuture<'_, Result<(), EventLogError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_reasons() {
        for reason in [
            SubscriptionDropReason::ConnectionClosed,
            SubscriptionDropReason::ServerError,
            SubscriptionDropReason::SubscribingError,
            SubscriptionDropReason::UserInitiated,
            SubscriptionDropReason::ProcessingQueueOverflow,
            SubscriptionDropReason::Unknown,
        ] {
            assert!(reason.is_recoverable(), "{reason} should be recoverable");
        }
    }

    #[test]
    fn handler_failures_are_not_recoverable() {
        assert!(!SubscriptionDropReason::EventHandlerException.is_recoverable());
        assert!(!SubscriptionDropReason::AccessDenied.is_recoverable());
        assert!(!SubscriptionDropReason::PersistentSubscriptionDeleted.is_recoverable());
    }

    #[test]
    fn version_conflict_display() {
        let error = EventLogError::VersionConflict {
            stream_id: StreamId::new("Order-42"),
            expected: ExpectedVersion::Exact(5),
            actual: Some(7),
        };
        let display = error.to_string();
        assert!(display.contains("Order-42"));
        assert!(display.contains("expected 5"));
    }
}
