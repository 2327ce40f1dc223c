//! Deduplication records for handled events.

use crate::store::StoreError;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Proof that a consumer group handled a record.
///
/// Unique on `(event_id, stream_name, group_name, event_type)`. Records are
/// never deleted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Effective id of the handled record (the override when one is set).
    pub event_id: Uuid,
    /// Stream the consumer group subscribes to.
    pub stream_name: String,
    /// Stream the record was originally appended to.
    pub event_stream_id: String,
    /// Consumer group.
    pub group_name: String,
    /// Type tag of the record.
    pub event_type: String,
    /// When the record was handled.
    pub created_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Unique key of this record.
    #[must_use]
    pub fn key(&self) -> IdempotencyKey {
        IdempotencyKey {
            event_id: self.event_id,
            stream_name: self.stream_name.clone(),
            group_name: self.group_name.clone(),
            event_type: self.event_type.clone(),
        }
    }
}

/// Unique key of an [`IdempotencyRecord`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    /// Effective record id.
    pub event_id: Uuid,
    /// Subscribed stream.
    pub stream_name: String,
    /// Consumer group.
    pub group_name: String,
    /// Type tag.
    pub event_type: String,
}

/// Durable idempotency records.
pub trait IdempotencyStore: Send + Sync {
    /// Insert the record, ignoring duplicates. Returns affected rows: `0`
    /// means the record already existed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the statement fails.
    fn insert<'a>(&'a self, record: &'a IdempotencyRecord) -> BoxFuture<'a, Result<u64, StoreError>>;

    /// Look a record up by its unique key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    fn find<'a>(&'a self, key: &'a IdempotencyKey) -> BoxFuture<'a, Result<Option<IdempotencyRecord>, StoreError>>;
}
