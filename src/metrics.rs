use std::sync::atomic::{AtomicU64, Ordering};

use crate::events::DomainEvent;

/// Counters kept by the dispatcher. Shared with the host process through
/// an `Arc`; there is no exposition endpoint here.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    /// Events confirmed delivered and removed from the outbox.
    pub delivered: AtomicU64,
    /// Delivery reports that came back failed.
    pub failed: AtomicU64,
    /// Cycles skipped because another dispatcher held the lease.
    pub lease_busy: AtomicU64,
}

/// Per event type counters for the write path.
#[derive(Debug, Default)]
pub struct EventCounters {
    pub restaurant_created: AtomicU64,
    pub restaurant_deleted: AtomicU64,
    pub restaurant_menu_updated: AtomicU64,
}

impl EventCounters {
    /// Bumps the counter matching `event`.
    pub fn record(&self, event: &DomainEvent) {
        let counter = match event {
            DomainEvent::RestaurantCreated(_) => &self.restaurant_created,
            DomainEvent::RestaurantDeleted { .. } => &self.restaurant_deleted,
            DomainEvent::RestaurantMenuUpdated { .. } => &self.restaurant_menu_updated,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_bumps_the_matching_counter() {
        let counters = EventCounters::default();

        counters.record(&DomainEvent::RestaurantDeleted { restaurant_id: 1 });
        counters.record(&DomainEvent::RestaurantDeleted { restaurant_id: 2 });

        assert_eq!(counters.restaurant_deleted.load(Ordering::Relaxed), 2);
        assert_eq!(counters.restaurant_created.load(Ordering::Relaxed), 0);
    }
}
