use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction, query_as};
use uuid::Uuid;

use crate::models::OutboxEvent;

/// Scan position within one dispatch cycle: the `(created_at, id)` pair of
/// the last row already handed to the broker.
pub type PageCursor = (DateTime<Utc>, Uuid);

/// Stores an event row from inside the caller's transaction, so the row
/// commits or rolls back together with the caller's own writes.
///
/// A duplicate id is ignored: retrying the same write stores one row.
pub async fn insert_event(
    tx: &mut Transaction<'_, Postgres>,
    event: &OutboxEvent,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO outbox (id, aggregate_type, aggregate_id, event_type, payload, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(event.id)
    .bind(&event.aggregate_type)
    .bind(&event.aggregate_id)
    .bind(&event.event_type)
    .bind(&event.payload)
    .bind(event.created_at)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Fetches the next page of pending events in insertion order.
///
/// Pagination is keyset based: pass the last row of the previous page to
/// continue the scan. Rows are not re-read mid cycle even though nothing
/// has been deleted yet.
pub async fn fetch_page(
    pool: &PgPool,
    limit: i64,
    after: Option<PageCursor>,
) -> Result<Vec<OutboxEvent>, sqlx::Error> {
    let events = match after {
        None => {
            query_as::<_, OutboxEvent>(
                r#"
                SELECT id, aggregate_type, aggregate_id, event_type, payload, created_at
                FROM outbox
                ORDER BY created_at, id
                LIMIT $1
                "#,
            )
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        Some((created_at, id)) => {
            query_as::<_, OutboxEvent>(
                r#"
                SELECT id, aggregate_type, aggregate_id, event_type, payload, created_at
                FROM outbox
                WHERE (created_at, id) > ($1, $2)
                ORDER BY created_at, id
                LIMIT $3
                "#,
            )
            .bind(created_at)
            .bind(id)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };

    Ok(events)
}

/// Deletes confirmed events, `chunk_size` ids at a time, and returns how
/// many rows went away.
pub async fn delete_batch(
    pool: &PgPool,
    event_ids: &[Uuid],
    chunk_size: usize,
) -> Result<u64, sqlx::Error> {
    let mut deleted = 0;
    for chunk in event_ids.chunks(chunk_size.max(1)) {
        let result = sqlx::query(
            r#"
            DELETE FROM outbox
            WHERE id = Any($1)
            "#,
        )
        .bind(chunk)
        .execute(pool)
        .await?;
        deleted += result.rows_affected();
    }

    Ok(deleted)
}

/// Number of events currently waiting for dispatch.
pub async fn pending_count(pool: &PgPool) -> Result<i64, sqlx::Error> {
    let row: (i64,) = query_as("SELECT COUNT(*) FROM outbox")
        .fetch_one(pool)
        .await?;

    Ok(row.0)
}
