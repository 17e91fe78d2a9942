use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::error::BrokerError;
use crate::models::OutboxEvent;

/// Delivery report for one submitted event.
#[derive(Debug)]
pub struct Delivery {
    pub event_id: Uuid,
    pub outcome: DeliveryOutcome,
}

#[derive(Debug)]
pub enum DeliveryOutcome {
    Delivered,
    Failed(String),
}

/// A broker that takes event submissions and reports delivery
/// asynchronously.
///
/// `submit` returning `Ok` is a promise that exactly one [`Delivery`] for
/// the event will arrive on `confirmations`; returning `Err` means nothing
/// was enqueued and no report will follow. The dispatcher relies on this
/// contract to know when a cycle's reports are complete.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn submit(
        &self,
        topic: &str,
        event: &OutboxEvent,
        confirmations: mpsc::Sender<Delivery>,
    ) -> Result<(), BrokerError>;
}

/// Kafka implementation over a [`FutureProducer`].
///
/// The message is keyed by the aggregate id, so all events of one
/// restaurant land on one partition in order. The delivery future is
/// forwarded onto the confirmation channel by a spawned task; the
/// producer's `message.timeout.ms` bounds how long that can take.
pub struct KafkaBroker {
    producer: FutureProducer,
}

impl KafkaBroker {
    pub fn new(producer: FutureProducer) -> Self {
        KafkaBroker { producer }
    }
}

#[async_trait]
impl BrokerClient for KafkaBroker {
    async fn submit(
        &self,
        topic: &str,
        event: &OutboxEvent,
        confirmations: mpsc::Sender<Delivery>,
    ) -> Result<(), BrokerError> {
        let record = FutureRecord::to(topic)
            .key(&event.aggregate_id)
            .payload(&event.payload);

        let delivery_future = self
            .producer
            .send_result(record)
            .map_err(|(err, _)| BrokerError::Submit(err))?;

        let event_id = event.id;
        tokio::spawn(async move {
            let outcome = match delivery_future.await {
                Ok(Ok(_)) => DeliveryOutcome::Delivered,
                Ok(Err((err, _))) => DeliveryOutcome::Failed(err.to_string()),
                Err(_) => {
                    DeliveryOutcome::Failed("producer closed before the delivery report".to_string())
                }
            };

            if confirmations
                .send(Delivery { event_id, outcome })
                .await
                .is_err()
            {
                warn!(%event_id, "Confirmation channel closed before the delivery report arrived.");
            }
        });

        Ok(())
    }
}
