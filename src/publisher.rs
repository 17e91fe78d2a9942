use std::sync::Arc;

use chrono::Utc;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::encoder::{EventEncoder, SchemaRegistry};
use crate::error::OutboxError;
use crate::events::{AGGREGATE_TYPE, DomainEvent};
use crate::metrics::EventCounters;
use crate::models::OutboxEvent;
use crate::outbox;

/// Stores domain events in the outbox from inside the caller's
/// transaction.
///
/// This is the whole publishing API the service layer sees: the event row
/// commits or rolls back together with the state change that raised it,
/// and a background dispatcher ships whatever committed. Any failure is
/// returned so the caller's transaction aborts.
pub struct OutboxPublisher<R: SchemaRegistry> {
    encoder: EventEncoder<R>,
    counters: Arc<EventCounters>,
}

impl<R: SchemaRegistry> OutboxPublisher<R> {
    pub fn new(registry: R, counters: Arc<EventCounters>) -> Self {
        OutboxPublisher {
            encoder: EventEncoder::new(registry),
            counters,
        }
    }

    /// Stores `event` under a fresh id and returns that id.
    pub async fn publish(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &DomainEvent,
    ) -> Result<Uuid, OutboxError> {
        self.publish_with_id(tx, Uuid::new_v4(), event).await
    }

    /// Stores `event` under a caller supplied id.
    ///
    /// Publishing the same id twice leaves a single row, so callers that
    /// carry their own idempotency token can retry safely.
    pub async fn publish_with_id(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        event: &DomainEvent,
    ) -> Result<Uuid, OutboxError> {
        let payload = self.encoder.encode(event).await?;

        let row = OutboxEvent {
            id,
            aggregate_type: AGGREGATE_TYPE.to_string(),
            aggregate_id: event.aggregate_id(),
            event_type: event.event_type().to_string(),
            payload,
            created_at: Utc::now(),
        };
        outbox::insert_event(tx, &row).await?;

        self.counters.record(event);
        Ok(id)
    }
}
