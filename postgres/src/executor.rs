//! Statement execution that joins the ambient transaction, if any.

use crate::transaction::current_transaction;
use sqlx::postgres::{PgArguments, PgQueryResult, PgRow};
use sqlx::query::{Query, QueryAs};
use sqlx::{FromRow, PgPool, Postgres};

/// Execute `query` inside the current task's transaction, or on `pool`
/// when there is none.
pub(crate) async fn execute<'q>(
    pool: &PgPool,
    query: Query<'q, Postgres, PgArguments>,
) -> Result<PgQueryResult, sqlx::Error> {
    if let Some(slot) = current_transaction() {
        let mut guard = slot.lock().await;
        if let Some(transaction) = guard.as_mut() {
            return query.execute(&mut **transaction).await;
        }
    }
    query.execute(pool).await
}

/// Fetch at most one row, joining the current task's transaction like
/// [`execute`].
pub(crate) async fn fetch_optional<'q, T>(
    pool: &PgPool,
    query: QueryAs<'q, Postgres, T, PgArguments>,
) -> Result<Option<T>, sqlx::Error>
where
    T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
{
    if let Some(slot) = current_transaction() {
        let mut guard = slot.lock().await;
        if let Some(transaction) = guard.as_mut() {
            return query.fetch_optional(&mut **transaction).await;
        }
    }
    query.fetch_optional(pool).await
}
