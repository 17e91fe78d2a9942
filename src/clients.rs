use rdkafka::ClientConfig;
use rdkafka::producer::FutureProducer;
use sqlx::{PgPool, postgres::PgPoolOptions};

use crate::config::Config;
use crate::encoder::HttpSchemaRegistry;

/// Creates and returns a new database connection pool.
pub async fn setup_db_pool(config: &Config) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url())
        .await
}

/// Creates and returns the Kafka producer used by the dispatcher.
///
/// The producer is idempotent and waits for acks from all replicas, so a
/// confirmed delivery really is durable. `message.timeout.ms` bounds how
/// long a delivery report can take, which in turn bounds a dispatch cycle.
pub fn setup_kafka_producer(config: &Config) -> Result<FutureProducer, rdkafka::error::KafkaError> {
    ClientConfig::new()
        .set("bootstrap.servers", &config.kafka_bootstrap_servers)
        .set("linger.ms", "500")
        .set("batch.size", "102400")
        .set("compression.type", "lz4")
        .set("acks", "all")
        .set("enable.idempotence", "true")
        .set("message.timeout.ms", "30000")
        .create()
}

/// Creates and returns the schema registry client for the write path.
pub fn setup_schema_registry(config: &Config) -> HttpSchemaRegistry {
    HttpSchemaRegistry::new(config.schema_registry_url.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kafka_producer_builds_from_config() {
        let config = Config::load_test().expect("Failed to load config for test");

        // create() validates the property names; a typo above fails here.
        setup_kafka_producer(&config).expect("Failed to create Kafka producer");
    }
}
