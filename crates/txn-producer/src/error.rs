//! Error types for the transactional producer.

use thiserror::Error;

/// Failures reported by a protocol client.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("Delivery canceled before an acknowledgement arrived")]
    Canceled,

    #[error("Blocking client task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Rejected by broker: {0}")]
    Rejected(String),
}

/// Errors that end a produce run.
///
/// Offset mismatches are not errors: they are reported through the epoch
/// outcome and the status counters.
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Error creating Kafka client: {0}")]
    ClientConstruction(#[source] ClientError),

    #[error("Error reading end offsets: {0}")]
    EndOffsets(#[source] ClientError),

    #[error("Couldn't start a transaction: {0}")]
    BeginTransaction(#[source] ClientError),

    #[error("Produce failed on partition {partition}: {reason}")]
    Delivery { partition: i32, reason: String },

    #[error("Error writing offset map: {0}")]
    Ledger(#[from] offset_ledger::Error),

    #[error("Status serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Concurrency gate closed")]
    ConcurrencyGateClosed,

    #[error("Shutdown requested with {remaining} messages still to produce")]
    Cancelled { remaining: i64 },
}

pub type Result<T> = std::result::Result<T, ProducerError>;
