//! Checkpoint and initial-position rows.

use crate::database_error;
use crate::executor::{execute, fetch_optional};
use eventstore_tools_core::checkpoint::{
    Checkpoint, CheckpointStore, InitialPositionRecord, InitialPositionStore,
};
use eventstore_tools_core::store::StoreError;
use futures::future::BoxFuture;
use sqlx::PgPool;

/// `PostgreSQL` checkpoint rows in `eventstore_subscription_checkpoint`.
///
/// The update only moves forward: `coalesce(checkpoint, -1) < $3` is part of
/// the `WHERE` clause, so two instances that both believe they lead cannot
/// move the checkpoint backwards, and the slower one sees zero affected rows.
#[derive(Clone, Debug)]
pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    /// Store over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl CheckpointStore for PostgresCheckpointStore {
    fn create_if_not_exists<'a>(
        &'a self,
        group_name: &'a str,
        stream_name: &'a str,
        checkpoint: Option<i64>,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let query = sqlx::query(
                r"
                INSERT INTO eventstore_subscription_checkpoint (group_name, stream_name, checkpoint)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                ",
            )
            .bind(group_name)
            .bind(stream_name)
            .bind(checkpoint);

            let result = execute(&self.pool, query)
                .await
                .map_err(|e| database_error(&e))?;
            Ok(result.rows_affected())
        })
    }

    fn increment_if_greater<'a>(
        &'a self,
        group_name: &'a str,
        stream_name: &'a str,
        checkpoint: i64,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let query = sqlx::query(
                r"
                UPDATE eventstore_subscription_checkpoint
                   SET checkpoint = $3
                 WHERE group_name = $1
                   AND stream_name = $2
                   AND coalesce(checkpoint, -1) < $3
                ",
            )
            .bind(group_name)
            .bind(stream_name)
            .bind(checkpoint);

            let result = execute(&self.pool, query)
                .await
                .map_err(|e| database_error(&e))?;
            if result.rows_affected() == 0 {
                tracing::debug!(
                    group_name,
                    stream_name,
                    checkpoint,
                    "Checkpoint not advanced"
                );
            }
            Ok(result.rows_affected())
        })
    }

    fn current<'a>(
        &'a self,
        group_name: &'a str,
        stream_name: &'a str,
    ) -> BoxFuture<'a, Result<Option<Checkpoint>, StoreError>> {
        Box::pin(async move {
            let query = sqlx::query_as::<_, (Option<i64>,)>(
                r"
                SELECT checkpoint
                  FROM eventstore_subscription_checkpoint
                 WHERE group_name = $1 AND stream_name = $2
                ",
            )
            .bind(group_name)
            .bind(stream_name);

            let row = fetch_optional(&self.pool, query)
                .await
                .map_err(|e| database_error(&e))?;
            Ok(row.map(|(checkpoint,)| Checkpoint {
                group_name: group_name.to_string(),
                stream_name: stream_name.to_string(),
                checkpoint,
            }))
        })
    }

    fn delete<'a>(
        &'a self,
        group_name: &'a str,
        stream_name: &'a str,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let query = sqlx::query(
                r"
                DELETE FROM eventstore_subscription_checkpoint
                 WHERE group_name = $1 AND stream_name = $2
                ",
            )
            .bind(group_name)
            .bind(stream_name);

            let result = execute(&self.pool, query)
                .await
                .map_err(|e| database_error(&e))?;
            Ok(result.rows_affected())
        })
    }
}

/// `PostgreSQL` initial-position rows in
/// `eventstore_subscription_initial_position`.
#[derive(Clone, Debug)]
pub struct PostgresInitialPositionStore {
    pool: PgPool,
}

impl PostgresInitialPositionStore {
    /// Store over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl InitialPositionStore for PostgresInitialPositionStore {
    fn create_if_not_exists<'a>(
        &'a self,
        record: &'a InitialPositionRecord,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let query = sqlx::query(
                r"
                INSERT INTO eventstore_subscription_initial_position (group_name, stream_name, initial_position)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                ",
            )
            .bind(&record.group_name)
            .bind(&record.stream_name)
            .bind(record.initial_position);

            let result = execute(&self.pool, query)
                .await
                .map_err(|e| database_error(&e))?;
            Ok(result.rows_affected())
        })
    }

    fn find<'a>(
        &'a self,
        group_name: &'a str,
        stream_name: &'a str,
    ) -> BoxFuture<'a, Result<Option<InitialPositionRecord>, StoreError>> {
        Box::pin(async move {
            let query = sqlx::query_as::<_, (i64,)>(
                r"
                SELECT initial_position
                  FROM eventstore_subscription_initial_position
                 WHERE group_name = $1 AND stream_name = $2
                ",
            )
            .bind(group_name)
            .bind(stream_name);

            let row = fetch_optional(&self.pool, query)
                .await
                .map_err(|e| database_error(&e))?;
            Ok(row.map(|(initial_position,)| InitialPositionRecord {
                group_name: group_name.to_string(),
                stream_name: stream_name.to_string(),
                initial_position,
            }))
        })
    }
}
