//! Transactional outbox for the restaurant service.
//!
//! Domain events are stored in the same database transaction as the state
//! change that raised them ([`OutboxPublisher`]), and a background
//! dispatcher later ships them to Kafka, deleting each row only after the
//! broker confirms delivery ([`Dispatcher`]). At most one dispatcher
//! processes at a time, guarded by a storage backed lease
//! ([`LeaseManager`]). Delivery is at least once; consumers deduplicate by
//! event id.

pub mod broker;
pub mod clients;
pub mod config;
pub mod dispatcher;
pub mod encoder;
pub mod error;
pub mod events;
pub mod lease;
pub mod metrics;
pub mod models;
pub mod outbox;
pub mod publisher;

pub use broker::{BrokerClient, Delivery, DeliveryOutcome, KafkaBroker};
pub use config::Config;
pub use dispatcher::{CycleStats, Dispatcher, DispatcherSettings};
pub use encoder::{
    EventEncoder, HttpSchemaRegistry, SchemaRegistry, StaticSchemaRegistry, topic_for_event_type,
};
pub use error::{BrokerError, EncodeError, OutboxError};
pub use events::{AGGREGATE_TYPE, Address, DomainEvent, Menu, MenuItem, Restaurant};
pub use lease::LeaseManager;
pub use metrics::{DispatchMetrics, EventCounters};
pub use models::{DispatchLease, OutboxEvent};
pub use publisher::OutboxPublisher;
