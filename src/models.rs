use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// One undelivered event, exactly as stored in the outbox table.
///
/// Rows are inserted by the write path and deleted once the broker
/// confirms delivery; they are never updated in between.
#[derive(Debug, FromRow)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// The singleton dispatcher lease row.
#[derive(Debug, FromRow)]
pub struct DispatchLease {
    pub id: i32,
    pub held: bool,
    pub held_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}
