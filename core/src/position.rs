//! Where a new subscription starts and which records count as replayed.
//!
//! Every policy yields two sequences:
//!
//! - `start_subscription_from`: first sequence the subscription consumes.
//! - `replay_events_until`: records below it are *replayed*; handler methods
//!   flagged to skip on replay are not invoked for them.
//!
//! | policy | start | replay until |
//! |---|---|---|
//! | `FromBeginning` | 0 | 0 (nothing is a replay) |
//! | `TakeOverPersistentSubscription` | 0 | sibling's last acked + 1 |
//! | `FromTheEndOfStream` | tail | tail |
//!
//! The tail is the sequence the next appended record will get. A stream that
//! does not exist resolves to 0.

use crate::event_log::{EventLogClient, EventLogError};
use crate::stream::StreamId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Starting policy of a subscription.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InitialPosition {
    /// Consume the whole stream; nothing is a replay.
    #[default]
    FromBeginning,
    /// Replace a persistent subscription: consume the whole stream but treat
    /// everything the old group already acknowledged as a replay.
    TakeOverPersistentSubscription {
        /// Stream of the persistent subscription being replaced.
        stream_name: String,
        /// Group of the persistent subscription being replaced.
        group_name: String,
    },
    /// Ignore history: start at the current tail of `stream_name`.
    FromTheEndOfStream {
        /// Stream whose tail is used (usually the subscribed stream).
        stream_name: String,
    },
}

impl InitialPosition {
    /// First sequence the subscription should consume.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the log fails for a reason other than a
    /// missing stream.
    pub async fn start_subscription_from(
        &self,
        client: &dyn EventLogClient,
    ) -> Result<u64, EventLogError> {
        match self {
            Self::FromBeginning | Self::TakeOverPersistentSubscription { .. } => Ok(0),
            Self::FromTheEndOfStream { stream_name } => {
                tail_of(client, StreamId::new(stream_name.clone())).await
            }
        }
    }

    /// Sequence below which records count as replayed.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the log fails for a reason other than a
    /// missing stream.
    pub async fn replay_events_until(
        &self,
        client: &dyn EventLogClient,
    ) -> Result<u64, EventLogError> {
        match self {
            Self::FromBeginning => Ok(0),
            Self::TakeOverPersistentSubscription {
                stream_name,
                group_name,
            } => last_acknowledged_position(client, stream_name, group_name).await,
            Self::FromTheEndOfStream { stream_name } => {
                tail_of(client, StreamId::new(stream_name.clone())).await
            }
        }
    }
}

impl fmt::Display for InitialPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FromBeginning => write!(f, "FromBeginning"),
            Self::TakeOverPersistentSubscription {
                stream_name,
                group_name,
            } => write!(f, "TakeOverPersistentSubscription({stream_name}::{group_name})"),
            Self::FromTheEndOfStream { stream_name } => {
                write!(f, "FromTheEndOfStream({stream_name})")
            }
        }
    }
}

/// Stream in which the log keeps a persistent group's acknowledged position.
#[must_use]
pub fn persistent_checkpoint_stream(stream_name: &str, group_name: &str) -> StreamId {
    StreamId::new(format!(
        "$persistentsubscription-{stream_name}::{group_name}-checkpoint"
    ))
}

/// Sequence the next record of `stream_id` will get.
async fn tail_of(client: &dyn EventLogClient, stream_id: StreamId) -> Result<u64, EventLogError> {
    match client.read_last(stream_id).await {
        Ok(Some(record)) => Ok(record.sequence + 1),
        Ok(None) | Err(EventLogError::StreamNotFound(_)) => Ok(0),
        Err(err) => Err(err),
    }
}

/// Position after the last record a persistent group acknowledged.
///
/// The checkpoint stream holds JSON numbers; the last one wins.
async fn last_acknowledged_position(
    client: &dyn EventLogClient,
    stream_name: &str,
    group_name: &str,
) -> Result<u64, EventLogError> {
    let checkpoint_stream = persistent_checkpoint_stream(stream_name, group_name);
    let last = match client.read_last(checkpoint_stream).await {
        Ok(last) => last,
        Err(EventLogError::StreamNotFound(_)) => None,
        Err(err) => return Err(err),
    };

    let Some(record) = last else {
        return Ok(0);
    };
    let acknowledged: u64 = serde_json::from_slice(&record.data)
        .map_err(|e| EventLogError::Serialization(format!("persistent checkpoint: {e}")))?;
    Ok(acknowledged + 1)
}
