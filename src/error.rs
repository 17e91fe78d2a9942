use thiserror::Error;

/// Errors surfaced to callers of the outbox write path.
///
/// Returning an error makes the caller's surrounding transaction abort, so
/// no event row outlives a failed business operation.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// The event could not be encoded for the wire.
    #[error("encoding event: {0}")]
    Encode(#[from] EncodeError),

    /// The event row could not be stored.
    #[error("storing event: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors raised while producing a wire payload.
#[derive(Error, Debug)]
pub enum EncodeError {
    /// The schema registry could not be reached.
    #[error("schema registry request failed: {0}")]
    Registry(#[from] reqwest::Error),

    /// The schema registry answered with a non-success status.
    #[error("schema registry rejected subject {subject}: {status}")]
    Rejected {
        subject: String,
        status: reqwest::StatusCode,
    },

    /// The payload body could not be serialized.
    #[error("serializing payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors raised when handing an event to the broker.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The producer refused the message before queueing it. Nothing was
    /// sent and no delivery report will follow.
    #[error("submitting to the broker: {0}")]
    Submit(#[from] rdkafka::error::KafkaError),
}
