//! Records stored in and delivered from the event log.

use crate::stream::StreamId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Metadata key holding the id that idempotency checks should use instead of
/// the record's own id (set when a record is a copy of an older one).
pub const OVERRIDE_EVENT_ID_KEY: &str = "overrideEventId";

/// Key-value metadata attached to a record.
pub type RecordMetadata = Map<String, Value>;

/// An immutable entry of a stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecord {
    /// Globally unique record id.
    pub event_id: Uuid,
    /// Stream the record was appended to.
    pub stream_id: StreamId,
    /// Stream-local, zero based position.
    pub sequence: u64,
    /// Type tag used to select handler methods and decode the payload.
    pub event_type: String,
    /// Opaque payload (JSON for domain events).
    pub data: Vec<u8>,
    /// Opaque metadata (a JSON object when present).
    pub metadata: Vec<u8>,
    /// Creation time assigned by the log.
    pub created: DateTime<Utc>,
}

impl StreamRecord {
    /// Metadata parsed as a JSON object.
    ///
    /// Empty or malformed metadata yields an empty map; metadata is advisory
    /// and never fails dispatch on its own.
    #[must_use]
    pub fn metadata_map(&self) -> RecordMetadata {
        if self.metadata.is_empty() {
            return RecordMetadata::new();
        }
        serde_json::from_slice::<RecordMetadata>(&self.metadata).unwrap_or_default()
    }

    /// The id an upstream copy asked idempotency checks to use, if any.
    #[must_use]
    pub fn overridden_event_id(&self) -> Option<Uuid> {
        self.metadata_map()
            .get(OVERRIDE_EVENT_ID_KEY)
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok())
    }

    /// Current and overridden ids of this record.
    #[must_use]
    pub fn event_ids(&self) -> EventIds {
        EventIds {
            current: self.event_id,
            overridden: self.overridden_event_id(),
        }
    }
}

impl fmt::Display for StreamRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}#{} ({})",
            self.event_type, self.stream_id, self.sequence, self.event_id
        )
    }
}

/// A record as delivered by a subscription.
///
/// Subscriptions over projection streams deliver links; `event` is the
/// resolved target and `link` the pointer record. A link whose target was
/// deleted arrives with `event == None`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedRecord {
    /// The resolved record, absent for dangling links.
    pub event: Option<StreamRecord>,
    /// The link record when the subscription stream holds links.
    pub link: Option<StreamRecord>,
}

impl ResolvedRecord {
    /// Wrap a plain (non-link) record.
    #[must_use]
    pub const fn plain(event: StreamRecord) -> Self {
        Self {
            event: Some(event),
            link: None,
        }
    }

    /// Position of this delivery in the subscribed stream.
    ///
    /// For links that is the link's sequence, otherwise the record's own.
    #[must_use]
    pub fn original_sequence(&self) -> Option<u64> {
        self.link
            .as_ref()
            .or(self.event.as_ref())
            .map(|record| record.sequence)
    }

    /// Id of the record that was actually delivered (the link when present).
    #[must_use]
    pub fn original_event_id(&self) -> Option<Uuid> {
        self.link
            .as_ref()
            .or(self.event.as_ref())
            .map(|record| record.event_id)
    }
}

/// A record to append.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewRecord {
    /// Id of the new record; appends are idempotent on it.
    pub event_id: Uuid,
    /// Type tag.
    pub event_type: String,
    /// JSON payload.
    pub data: Vec<u8>,
    /// JSON metadata object, may be empty.
    pub metadata: Vec<u8>,
}

impl NewRecord {
    /// Build a record with a fresh id and empty metadata.
    #[must_use]
    pub fn new(event_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            data,
            metadata: Vec::new(),
        }
    }

    /// Use a specific record id.
    #[must_use]
    pub const fn with_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    /// Attach metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the map cannot be serialized.
    pub fn with_metadata(mut self, metadata: &RecordMetadata) -> Result<Self, serde_json::Error> {
        self.metadata = serde_json::to_vec(metadata)?;
        Ok(self)
    }
}

/// Identifiers a handler method may ask for next to the decoded event.
///
/// `overridden` is set when the record is a derivative of an older record and
/// idempotency must be keyed on the older id.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventIds {
    /// Id the idempotency check should use instead of `current`.
    pub overridden: Option<Uuid>,
    /// Id of the delivered record.
    pub current: Uuid,
}

impl EventIds {
    /// The id used for deduplication.
    #[must_use]
    pub fn effective(&self) -> Uuid {
        self.overridden.unwrap_or(self.current)
    }
}

/// Result of a successful append.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AppendResult {
    /// Sequence of the last appended record.
    pub next_expected_version: u64,
}
