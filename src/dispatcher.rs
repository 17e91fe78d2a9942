use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::{mpsc, watch};
use tokio::time;
use tracing::{Span, debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::broker::{BrokerClient, Delivery, DeliveryOutcome};
use crate::encoder::topic_for_event_type;
use crate::lease::LeaseManager;
use crate::metrics::DispatchMetrics;
use crate::outbox::{self, PageCursor};

/// Tunables for the dispatch loop.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Pause between dispatch cycles.
    pub poll_interval: Duration,
    /// Rows fetched per page while scanning the outbox.
    pub fetch_page_size: i64,
    /// Ids per DELETE statement when clearing confirmed events.
    pub delete_batch_size: usize,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        DispatcherSettings {
            poll_interval: Duration::from_millis(3000),
            fetch_page_size: 100,
            delete_batch_size: 100,
        }
    }
}

/// Counts for one dispatch cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    /// Events handed to the broker.
    pub submitted: usize,
    /// Events confirmed delivered and deleted.
    pub delivered: usize,
    /// Events whose delivery report came back failed.
    pub failed: usize,
}

/// Background process that drains the outbox to the broker.
///
/// Each cycle takes the storage backed lease, scans the pending events in
/// insertion order, submits them, waits for every delivery report, deletes
/// the confirmed ones and releases the lease. Nothing in a cycle is fatal:
/// whatever could not be delivered or deleted stays queued for the next
/// cycle, which is where the at-least-once guarantee comes from.
pub struct Dispatcher<B: BrokerClient> {
    pool: PgPool,
    broker: B,
    lease: LeaseManager,
    metrics: Arc<DispatchMetrics>,
    settings: DispatcherSettings,
}

impl<B: BrokerClient> Dispatcher<B> {
    pub fn new(
        pool: PgPool,
        broker: B,
        lease: LeaseManager,
        metrics: Arc<DispatchMetrics>,
        settings: DispatcherSettings,
    ) -> Self {
        Dispatcher {
            pool,
            broker,
            lease,
            metrics,
            settings,
        }
    }

    /// Runs dispatch cycles until `shutdown` flips to true. A cycle in
    /// flight is finished before the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval(self.settings.poll_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.dispatch_once().await;
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Dispatcher loop stopping.");
                        return;
                    }
                }
            }
        }
    }

    /// Runs one lease guarded dispatch attempt.
    pub async fn dispatch_once(&self) {
        match self.lease.acquire().await {
            Ok(true) => {}
            Ok(false) => {
                self.metrics.lease_busy.fetch_add(1, Ordering::Relaxed);
                debug!("The dispatch lease is busy, skipping this cycle.");
                return;
            }
            Err(e) => {
                error!("Error acquiring the dispatch lease: {}", e);
                return;
            }
        }

        let stats = self.run_cycle().await;
        info!(
            submitted = stats.submitted,
            delivered = stats.delivered,
            failed = stats.failed,
            "Dispatch cycle complete."
        );

        if let Err(e) = self.lease.release().await {
            // An unreleased lease expires on its own.
            error!("Error releasing the dispatch lease: {}", e);
        }
    }

    #[instrument(skip_all, fields(submitted = 0, delivered = 0, failed = 0))]
    async fn run_cycle(&self) -> CycleStats {
        // The channel is sized to one fetch page; a slow broker
        // backpressures submission.
        let (confirmations, reports) =
            mpsc::channel::<Delivery>(self.settings.fetch_page_size.max(1) as usize);
        let collector = tokio::spawn(collect_confirmations(
            reports,
            Arc::clone(&self.metrics),
        ));

        let mut submitted = 0usize;
        let mut cursor: Option<PageCursor> = None;

        loop {
            let page =
                match outbox::fetch_page(&self.pool, self.settings.fetch_page_size, cursor).await {
                    Ok(page) => page,
                    Err(e) => {
                        error!("Error fetching outbox events: {}. Ending the scan.", e);
                        break;
                    }
                };

            let Some(last) = page.last() else { break };
            cursor = Some((last.created_at, last.id));

            debug!(page_len = page.len(), "Submitting events to the broker.");
            for event in &page {
                let topic = topic_for_event_type(&event.event_type);
                match self.broker.submit(&topic, event, confirmations.clone()).await {
                    Ok(()) => submitted += 1,
                    Err(e) => {
                        // The event stays in the outbox and is picked up
                        // again on a later cycle.
                        error!(event_id = %event.id, "Error submitting event: {}", e);
                    }
                }
            }

            if page.len() < self.settings.fetch_page_size as usize {
                break;
            }
        }

        // Every successful submission holds a sender clone until its report
        // is forwarded; dropping ours closes the channel once they are all
        // in, which is what ends the collector.
        drop(confirmations);

        let (delivered, failed) = match collector.await {
            Ok(tally) => tally,
            Err(e) => {
                error!("Confirmation collector failed: {}", e);
                (Vec::new(), 0)
            }
        };

        let stats = CycleStats {
            submitted,
            delivered: delivered.len(),
            failed,
        };

        if !delivered.is_empty() {
            debug!(count = delivered.len(), "Deleting delivered events.");
            if let Err(e) =
                outbox::delete_batch(&self.pool, &delivered, self.settings.delete_batch_size).await
            {
                error!("Error deleting delivered events: {}. They WILL be re-sent.", e);
            }
        }

        let span = Span::current();
        span.record("submitted", stats.submitted);
        span.record("delivered", stats.delivered);
        span.record("failed", stats.failed);

        stats
    }
}

/// Drains delivery reports until every sender is gone, keeping the ids
/// that may now be deleted.
async fn collect_confirmations(
    mut reports: mpsc::Receiver<Delivery>,
    metrics: Arc<DispatchMetrics>,
) -> (Vec<Uuid>, usize) {
    let mut delivered = Vec::new();
    let mut failed = 0usize;

    while let Some(delivery) = reports.recv().await {
        match delivery.outcome {
            DeliveryOutcome::Delivered => {
                metrics.delivered.fetch_add(1, Ordering::Relaxed);
                delivered.push(delivery.event_id);
            }
            DeliveryOutcome::Failed(reason) => {
                metrics.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event_id = %delivery.event_id,
                    "Delivery failed: {}. The event stays queued.", reason
                );
                failed += 1;
            }
        }
    }

    (delivered, failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerError;
    use crate::models::OutboxEvent;
    use chrono::Utc;
    use rdkafka::error::KafkaError;
    use sqlx::Executor;
    use std::collections::HashSet;
    use std::sync::Mutex;

    async fn apply_schema(pool: &PgPool) {
        let schema_sql = include_str!("../schema.sql");
        pool.execute(schema_sql)
            .await
            .expect("Failed to create schema");
    }

    // Broker double: acks everything unless told to nack or refuse an id.
    #[derive(Clone, Default)]
    struct StubBroker {
        refuse: Arc<Mutex<HashSet<Uuid>>>,
        nack: Arc<Mutex<HashSet<Uuid>>>,
        submitted: Arc<Mutex<Vec<(String, String, Uuid)>>>,
    }

    impl StubBroker {
        fn submitted_ids(&self) -> Vec<Uuid> {
            self.submitted.lock().unwrap().iter().map(|s| s.2).collect()
        }
    }

    #[async_trait::async_trait]
    impl BrokerClient for StubBroker {
        async fn submit(
            &self,
            topic: &str,
            event: &OutboxEvent,
            confirmations: mpsc::Sender<Delivery>,
        ) -> Result<(), BrokerError> {
            if self.refuse.lock().unwrap().contains(&event.id) {
                return Err(BrokerError::Submit(KafkaError::Canceled));
            }

            self.submitted.lock().unwrap().push((
                topic.to_string(),
                event.aggregate_id.clone(),
                event.id,
            ));

            let outcome = if self.nack.lock().unwrap().contains(&event.id) {
                DeliveryOutcome::Failed("stub nack".to_string())
            } else {
                DeliveryOutcome::Delivered
            };
            confirmations
                .send(Delivery {
                    event_id: event.id,
                    outcome,
                })
                .await
                .expect("Confirmation channel closed early");

            Ok(())
        }
    }

    async fn seed_event(pool: &PgPool, aggregate_id: &str, event_type: &str, seq: i64) -> Uuid {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO outbox (id, aggregate_type, aggregate_id, event_type, payload, created_at)
            VALUES ($1, 'Restaurant', $2, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(aggregate_id)
        .bind(event_type)
        .bind(vec![0u8, 0, 0, 0, 42])
        .bind(Utc::now() + chrono::Duration::milliseconds(seq))
        .execute(pool)
        .await
        .expect("Failed to insert test event");

        id
    }

    fn dispatcher(
        pool: &PgPool,
        broker: StubBroker,
        settings: DispatcherSettings,
    ) -> (Dispatcher<StubBroker>, Arc<DispatchMetrics>) {
        let metrics = Arc::new(DispatchMetrics::default());
        let lease = LeaseManager::new(pool.clone(), chrono::Duration::seconds(30));
        let dispatcher = Dispatcher::new(
            pool.clone(),
            broker,
            lease,
            Arc::clone(&metrics),
            settings,
        );
        (dispatcher, metrics)
    }

    #[sqlx::test(migrations = false)]
    async fn dispatch_delivers_in_order_and_empties_the_outbox(pool: PgPool) {
        // --- ARRANGE ---
        apply_schema(&pool).await;
        let mut ids = Vec::new();
        for seq in 0..3 {
            ids.push(seed_event(&pool, "A", "RestaurantCreated", seq).await);
        }

        let broker = StubBroker::default();
        let (dispatcher, metrics) =
            dispatcher(&pool, broker.clone(), DispatcherSettings::default());

        // --- ACT ---
        dispatcher.dispatch_once().await;

        // --- ASSERT ---
        let count = outbox::pending_count(&pool).await.unwrap();
        assert_eq!(count, 0, "Confirmed events must be deleted");
        assert_eq!(metrics.delivered.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.failed.load(Ordering::Relaxed), 0);

        // Submission order for one aggregate is the insertion order.
        assert_eq!(broker.submitted_ids(), ids);
        let submissions = broker.submitted.lock().unwrap();
        assert!(
            submissions
                .iter()
                .all(|(topic, key, _)| topic == "outbox-restaurant-created" && key == "A")
        );
        drop(submissions);

        // The lease is free again after the cycle.
        let (held,): (bool,) = sqlx::query_as("SELECT held FROM outbox_lease WHERE id = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!(!held, "Lease must be released after the cycle");
    }

    #[sqlx::test(migrations = false)]
    async fn failed_delivery_keeps_the_event_queued(pool: PgPool) {
        // --- ARRANGE ---
        apply_schema(&pool).await;
        seed_event(&pool, "A", "RestaurantCreated", 0).await;
        let nacked = seed_event(&pool, "A", "RestaurantMenuUpdated", 1).await;
        seed_event(&pool, "B", "RestaurantDeleted", 2).await;

        let broker = StubBroker::default();
        broker.nack.lock().unwrap().insert(nacked);
        let (dispatcher, metrics) =
            dispatcher(&pool, broker.clone(), DispatcherSettings::default());

        // --- ACT ---
        dispatcher.dispatch_once().await;

        // --- ASSERT ---
        let remaining = outbox::fetch_page(&pool, 10, None).await.unwrap();
        assert_eq!(remaining.len(), 1, "Only the nacked event may remain");
        assert_eq!(remaining[0].id, nacked);
        assert_eq!(metrics.delivered.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.failed.load(Ordering::Relaxed), 1);
    }

    #[sqlx::test(migrations = false)]
    async fn submission_error_keeps_the_event_without_a_failure_report(pool: PgPool) {
        // --- ARRANGE ---
        apply_schema(&pool).await;
        let refused = seed_event(&pool, "A", "RestaurantCreated", 0).await;
        seed_event(&pool, "B", "RestaurantCreated", 1).await;

        let broker = StubBroker::default();
        broker.refuse.lock().unwrap().insert(refused);
        let (dispatcher, metrics) =
            dispatcher(&pool, broker.clone(), DispatcherSettings::default());

        // --- ACT ---
        dispatcher.dispatch_once().await;

        // --- ASSERT ---
        let remaining = outbox::fetch_page(&pool, 10, None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, refused, "The refused event must stay");
        // A refused submission is not a delivery failure.
        assert_eq!(metrics.failed.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.delivered.load(Ordering::Relaxed), 1);
    }

    #[sqlx::test(migrations = false)]
    async fn a_backlog_larger_than_one_page_is_drained(pool: PgPool) {
        // --- ARRANGE ---
        apply_schema(&pool).await;
        let mut ids = Vec::new();
        for seq in 0..5 {
            ids.push(seed_event(&pool, "A", "RestaurantCreated", seq).await);
        }

        let broker = StubBroker::default();
        let settings = DispatcherSettings {
            fetch_page_size: 2,
            delete_batch_size: 2,
            ..DispatcherSettings::default()
        };
        let (dispatcher, metrics) = dispatcher(&pool, broker.clone(), settings);

        // --- ACT ---
        dispatcher.dispatch_once().await;

        // --- ASSERT ---
        let count = outbox::pending_count(&pool).await.unwrap();
        assert_eq!(count, 0, "The whole backlog must be drained in one cycle");
        assert_eq!(metrics.delivered.load(Ordering::Relaxed), 5);
        assert_eq!(broker.submitted_ids(), ids, "Scan order must be preserved");
    }

    #[sqlx::test(migrations = false)]
    async fn a_busy_lease_skips_the_cycle(pool: PgPool) {
        // --- ARRANGE ---
        apply_schema(&pool).await;
        seed_event(&pool, "A", "RestaurantCreated", 0).await;

        // Another dispatcher is mid cycle.
        let other = LeaseManager::new(pool.clone(), chrono::Duration::seconds(30));
        assert!(other.acquire().await.unwrap());

        let broker = StubBroker::default();
        let (dispatcher, metrics) =
            dispatcher(&pool, broker.clone(), DispatcherSettings::default());

        // --- ACT ---
        dispatcher.dispatch_once().await;

        // --- ASSERT ---
        assert!(broker.submitted_ids().is_empty(), "Nothing may be submitted");
        let count = outbox::pending_count(&pool).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(metrics.lease_busy.load(Ordering::Relaxed), 1);
    }

    #[sqlx::test(migrations = false)]
    async fn run_stops_on_the_shutdown_signal(pool: PgPool) {
        apply_schema(&pool).await;

        let broker = StubBroker::default();
        let settings = DispatcherSettings {
            poll_interval: Duration::from_millis(10),
            ..DispatcherSettings::default()
        };
        let (dispatcher, _metrics) = dispatcher(&pool, broker, settings);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { dispatcher.run(shutdown_rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).expect("Failed to signal shutdown");

        handle.await.expect("Dispatcher task panicked");
    }
}
