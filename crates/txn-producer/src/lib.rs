//! Transactional produce workload.
//!
//! Produces a fixed number of messages to a topic inside Kafka transactions,
//! predicting the offset every message will land at. Acknowledgements that
//! match the prediction are recorded in an [`offset_ledger`] so a consumer can
//! later check that it read exactly the committed records. Transactions can
//! be aborted at random; records written in them carry a key prefix that a
//! consumer must never observe.
//!
//! The broker is reached through the [`TransactionalClient`] and
//! [`ClientFactory`] traits. [`kafka`] implements them with librdkafka and
//! [`testing`] with an in-memory broker.

pub mod client;
pub mod config;
pub mod error;
pub mod kafka;
pub mod latency;
pub mod offsets;
pub mod record;
pub mod status;
pub mod testing;
pub mod worker;

pub use client::{
    Acknowledged, ClientFactory, DeliveryFuture, ProduceRecord, SessionOptions,
    TransactionOutcome, TransactionalClient,
};
pub use config::{TransactionalProducerConfig, WorkerConfig};
pub use error::{ClientError, ProducerError, Result};
pub use kafka::{KafkaClientFactory, KafkaTransactionalClient};
pub use latency::HistogramSummary;
pub use offsets::{ControlRecordMode, ControlRecordPolicy, ExpectedOffsets};
pub use record::{classify_key, KeyKind, ABORTED_KEY_PREFIX};
pub use status::{BadOffset, StatusSnapshot, WorkerStatus};
pub use worker::{EpochOutcome, TransactionalProducerWorker};
