//! Aggregate roots.
//!
//! An aggregate's state is the fold of its stream. Implementors supply the
//! fold (`apply`) and embed an [`AggregateChanges`] that tracks what has been
//! committed and what is pending; the provided methods do the bookkeeping.
//!
//! # Example
//!
//! ```ignore
//! impl AggregateRoot for Order {
//!     type Event = OrderEvent;
//!     const AGGREGATE_TYPE: &'static str = "Order";
//!
//!     fn new(id: String) -> Self {
//!         Self { id, status: Status::Draft, changes: AggregateChanges::default() }
//!     }
//!     fn id(&self) -> &str { &self.id }
//!     fn changes(&self) -> &AggregateChanges<OrderEvent> { &self.changes }
//!     fn changes_mut(&mut self) -> &mut AggregateChanges<OrderEvent> { &mut self.changes }
//!
//!     fn apply(&mut self, event: &OrderEvent) {
//!         match event {
//!             OrderEvent::Placed(_) => self.status = Status::Placed,
//!             OrderEvent::Shipped(_) => self.status = Status::Shipped,
//!         }
//!     }
//! }
//! ```

use crate::event::{EventError, EventSet};
use crate::record::{RecordMetadata, StreamRecord};
use crate::stream::ExpectedVersion;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A pending event together with its per-event metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct EventMessage<E> {
    /// Id the record will be appended with.
    pub event_id: Uuid,
    /// The event.
    pub event: E,
    /// When the event was raised.
    pub timestamp: DateTime<Utc>,
    /// Metadata merged over the repository defaults on save.
    pub metadata: RecordMetadata,
}

/// Commit bookkeeping embedded in every aggregate.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregateChanges<E> {
    last_committed_sequence: Option<u64>,
    uncommitted: Vec<EventMessage<E>>,
    loading_from_history: bool,
}

impl<E> Default for AggregateChanges<E> {
    fn default() -> Self {
        Self {
            last_committed_sequence: None,
            uncommitted: Vec::new(),
            loading_from_history: false,
        }
    }
}

impl<E> AggregateChanges<E> {
    /// Sequence of the last persisted event, `None` for a new aggregate.
    #[must_use]
    pub const fn last_committed_sequence(&self) -> Option<u64> {
        self.last_committed_sequence
    }

    /// Pending events in append order.
    #[must_use]
    pub fn uncommitted(&self) -> &[EventMessage<E>] {
        &self.uncommitted
    }

    /// Whether the aggregate is currently replaying persisted events.
    #[must_use]
    pub const fn is_loading_from_history(&self) -> bool {
        self.loading_from_history
    }
}

/// A domain entity whose state is the fold of its stream.
pub trait AggregateRoot: Send + Sync + Sized + 'static {
    /// Events this aggregate emits and applies.
    type Event: EventSet + Clone;

    /// Type name used for the stream prefix and snapshot keys.
    const AGGREGATE_TYPE: &'static str;

    /// Blank aggregate for `id`, before any event has been applied.
    fn new(id: String) -> Self;

    /// Aggregate id.
    fn id(&self) -> &str;

    /// Fold one event into the state. Must not fail; validation belongs in
    /// command methods before `append_event`.
    fn apply(&mut self, event: &Self::Event);

    /// Embedded commit bookkeeping.
    fn changes(&self) -> &AggregateChanges<Self::Event>;

    /// Embedded commit bookkeeping, mutable.
    fn changes_mut(&mut self) -> &mut AggregateChanges<Self::Event>;

    /// Record a new event and fold it into the state immediately.
    fn append_event(&mut self, event: Self::Event) {
        self.append_event_with_metadata(event, RecordMetadata::new());
    }

    /// Record a new event with per-event metadata.
    fn append_event_with_metadata(&mut self, event: Self::Event, metadata: RecordMetadata) {
        self.apply(&event);
        self.changes_mut().uncommitted.push(EventMessage {
            event_id: Uuid::new_v4(),
            event,
            timestamp: Utc::now(),
            metadata,
        });
    }

    /// Fold an already persisted record.
    ///
    /// Records whose tag is not part of [`AggregateRoot::Event`] still move
    /// the committed sequence, since they count towards the stream version.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Deserialization`] if the payload of a known tag
    /// cannot be decoded.
    fn load_from_history(&mut self, record: &StreamRecord) -> Result<(), EventError> {
        let decoded = Self::Event::decode(&record.event_type, &record.data)?;
        self.changes_mut().loading_from_history = true;
        if let Some(event) = decoded {
            self.apply(&event);
        }
        let changes = self.changes_mut();
        changes.loading_from_history = false;
        changes.last_committed_sequence = Some(record.sequence);
        Ok(())
    }

    /// Mark the state as restored up to `sequence` (snapshot load).
    fn restore_committed_sequence(&mut self, sequence: u64) {
        self.changes_mut().last_committed_sequence = Some(sequence);
    }

    /// Precondition for committing the pending events.
    fn expected_version(&self) -> ExpectedVersion {
        ExpectedVersion::from_last(self.changes().last_committed_sequence)
    }

    /// Pending events in append order.
    fn uncommitted_events(&self) -> &[EventMessage<Self::Event>] {
        self.changes().uncommitted()
    }

    /// Advance the committed sequence past the pending events and clear them.
    fn mark_committed(&mut self) {
        let changes = self.changes_mut();
        let appended = changes.uncommitted.len() as u64;
        if appended > 0 {
            changes.last_committed_sequence = Some(match changes.last_committed_sequence {
                Some(last) => last + appended,
                None => appended - 1,
            });
        }
        changes.uncommitted.clear();
    }
}
