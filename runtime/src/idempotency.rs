//! Idempotency gate for delivered records.

use eventstore_tools_core::environment::{Clock, SystemClock};
use eventstore_tools_core::idempotency::{IdempotencyRecord, IdempotencyStore};
use eventstore_tools_core::record::StreamRecord;
use eventstore_tools_core::store::StoreError;
use std::sync::Arc;

/// Result of passing a record through the gate.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StoreOutcome {
    /// First delivery for this group; handle it.
    Stored,
    /// A record with the same key was stored before; skip it.
    AlreadyHandled,
}

/// Builds idempotency records and inserts them as the dedup gate.
///
/// The key uses the record's effective id, so a copy carrying an
/// `overrideEventId` collides with the record it was copied from.
#[derive(Clone)]
pub struct EventIdempotencyStorage {
    store: Arc<dyn IdempotencyStore>,
    clock: Arc<dyn Clock>,
}

impl EventIdempotencyStorage {
    /// Gate backed by `store`, stamped with the system clock.
    #[must_use]
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Gate backed by `store`, stamped with `clock`.
    #[must_use]
    pub fn with_clock(store: Arc<dyn IdempotencyStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Record that `group_name` handles `record` delivered from `stream_name`.
    ///
    /// # Errors
    ///
    /// Returns the store's error when the insert fails for any reason other
    /// than a duplicate key.
    pub async fn store_record(
        &self,
        stream_name: &str,
        group_name: &str,
        record: &StreamRecord,
    ) -> Result<StoreOutcome, StoreError> {
        let entry = IdempotencyRecord {
            event_id: record.event_ids().effective(),
            stream_name: stream_name.to_string(),
            event_stream_id: record.stream_id.to_string(),
            group_name: group_name.to_string(),
            event_type: record.event_type.clone(),
            created_at: self.clock.now(),
        };

        let inserted = self.store.insert(&entry).await?;
        if inserted == 0 {
            Ok(StoreOutcome::AlreadyHandled)
        } else {
            Ok(StoreOutcome::Stored)
        }
    }

    /// Insert a prepared record, for manual skips.
    ///
    /// # Errors
    ///
    /// Returns the store's error when the insert fails.
    pub async fn insert(&self, record: &IdempotencyRecord) -> Result<StoreOutcome, StoreError> {
        let inserted = self.store.insert(record).await?;
        Ok(if inserted == 0 {
            StoreOutcome::AlreadyHandled
        } else {
            StoreOutcome::Stored
        })
    }

    /// Time source used for new records.
    #[must_use]
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }
}
