//! Aggregate snapshots in `eventstore_aggregate_snapshot`.

use crate::database_error;
use crate::executor::{execute, fetch_optional};
use eventstore_tools_core::snapshot::{SnapshotData, SnapshotId, SnapshotStore};
use eventstore_tools_core::store::{StoreError, stored_sequence};
use futures::future::BoxFuture;
use sqlx::PgPool;

/// `PostgreSQL` snapshot store; one row per aggregate and schema version.
#[derive(Clone, Debug)]
pub struct PostgresSnapshotStore {
    pool: PgPool,
}

impl PostgresSnapshotStore {
    /// Store over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn version_column(id: &SnapshotId) -> Result<i32, StoreError> {
    i32::try_from(id.version)
        .map_err(|_| StoreError::Serialization(format!("snapshot version {} out of range", id.version)))
}

impl SnapshotStore for PostgresSnapshotStore {
    fn save<'a>(
        &'a self,
        id: &'a SnapshotId,
        snapshot: SnapshotData,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let version = version_column(id)?;
            let sequence = stored_sequence(snapshot.last_event_sequence)?;
            let query = sqlx::query(
                r"
                INSERT INTO eventstore_aggregate_snapshot (
                    aggregate_type, version, aggregate_id, last_event_sequence, data, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, now())
                ON CONFLICT (aggregate_type, version, aggregate_id) DO UPDATE
                   SET last_event_sequence = EXCLUDED.last_event_sequence,
                       data = EXCLUDED.data,
                       updated_at = EXCLUDED.updated_at
                 WHERE eventstore_aggregate_snapshot.last_event_sequence <= EXCLUDED.last_event_sequence
                ",
            )
            .bind(&id.aggregate_type)
            .bind(version)
            .bind(&id.aggregate_id)
            .bind(sequence)
            .bind(snapshot.bytes);

            execute(&self.pool, query)
                .await
                .map_err(|e| database_error(&e))?;
            tracing::debug!(snapshot = %id, sequence, "Saved snapshot");
            Ok(())
        })
    }

    fn load<'a>(&'a self, id: &'a SnapshotId) -> BoxFuture<'a, Result<Option<SnapshotData>, StoreError>> {
        Box::pin(async move {
            let version = version_column(id)?;
            let query = sqlx::query_as::<_, (Vec<u8>, i64)>(
                r"
                SELECT data, last_event_sequence
                  FROM eventstore_aggregate_snapshot
                 WHERE aggregate_type = $1 AND version = $2 AND aggregate_id = $3
                ",
            )
            .bind(&id.aggregate_type)
            .bind(version)
            .bind(&id.aggregate_id);

            let row = fetch_optional(&self.pool, query)
                .await
                .map_err(|e| database_error(&e))?;
            row.map(|(bytes, sequence)| {
                let last_event_sequence = u64::try_from(sequence).map_err(|_| {
                    StoreError::Serialization(format!("negative snapshot sequence {sequence}"))
                })?;
                Ok(SnapshotData {
                    bytes,
                    last_event_sequence,
                })
            })
            .transpose()
        })
    }
}
