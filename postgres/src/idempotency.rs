//! Idempotency records in `eventstore_subscription_processed_event`.

use crate::database_error;
use crate::executor::{execute, fetch_optional};
use chrono::{DateTime, Utc};
use eventstore_tools_core::idempotency::{IdempotencyKey, IdempotencyRecord, IdempotencyStore};
use eventstore_tools_core::store::StoreError;
use futures::future::BoxFuture;
use sqlx::PgPool;
use uuid::Uuid;

/// `PostgreSQL` idempotency records.
///
/// The primary key is `(event_id, stream_name, group_name, event_type)`; an
/// insert hitting it affects zero rows, which callers read as "already
/// handled". Inside a unit of work the insert is rolled back with the
/// handler's writes, so a failed record is delivered again.
#[derive(Clone, Debug)]
pub struct PostgresIdempotencyStore {
    pool: PgPool,
}

impl PostgresIdempotencyStore {
    /// Store over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

type Row = (Uuid, String, String, String, String, DateTime<Utc>);

impl IdempotencyStore for PostgresIdempotencyStore {
    fn insert<'a>(&'a self, record: &'a IdempotencyRecord) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let query = sqlx::query(
                r"
                INSERT INTO eventstore_subscription_processed_event (
                    event_id, stream_name, event_stream_id, group_name, event_type, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT DO NOTHING
                ",
            )
            .bind(record.event_id)
            .bind(&record.stream_name)
            .bind(&record.event_stream_id)
            .bind(&record.group_name)
            .bind(&record.event_type)
            .bind(record.created_at);

            let result = execute(&self.pool, query)
                .await
                .map_err(|e| database_error(&e))?;
            Ok(result.rows_affected())
        })
    }

    fn find<'a>(
        &'a self,
        key: &'a IdempotencyKey,
    ) -> BoxFuture<'a, Result<Option<IdempotencyRecord>, StoreError>> {
        Box::pin(async move {
            let query = sqlx::query_as::<_, Row>(
                r"
                SELECT event_id, stream_name, event_stream_id, group_name, event_type, created_at
                  FROM eventstore_subscription_processed_event
                 WHERE event_id = $1
                   AND stream_name = $2
                   AND group_name = $3
                   AND event_type = $4
                ",
            )
            .bind(key.event_id)
            .bind(&key.stream_name)
            .bind(&key.group_name)
            .bind(&key.event_type);

            let row = fetch_optional(&self.pool, query)
                .await
                .map_err(|e| database_error(&e))?;
            Ok(row.map(
                |(event_id, stream_name, event_stream_id, group_name, event_type, created_at)| {
                    IdempotencyRecord {
                        event_id,
                        stream_name,
                        event_stream_id,
                        group_name,
                        event_type,
                        created_at,
                    }
                },
            ))
        })
    }
}
