//! Protocol client capability consumed by the worker.
//!
//! The worker never talks to a broker directly. It asks a [`ClientFactory`]
//! for a fresh [`TransactionalClient`] per epoch, which lets the same epoch
//! logic run against librdkafka (see [`crate::kafka`]) or the in-memory
//! broker in [`crate::testing`].

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::time::Duration;

use crate::error::ClientError;

/// How a transaction is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Commit,
    Abort,
}

impl TransactionOutcome {
    pub fn from_abort(will_abort: bool) -> Self {
        if will_abort {
            Self::Abort
        } else {
            Self::Commit
        }
    }
}

impl std::fmt::Display for TransactionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionOutcome::Commit => write!(f, "commit"),
            TransactionOutcome::Abort => write!(f, "abort"),
        }
    }
}

/// Per-session client settings.
///
/// Acks from all in-sync replicas, no batch compression and caller-assigned
/// partitions are not configurable: every implementation must apply them.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub topic: String,
    pub transactional_id: String,
    pub transaction_timeout: Duration,
}

/// A record ready for dispatch, with its partition already chosen.
#[derive(Debug, Clone)]
pub struct ProduceRecord {
    pub partition: i32,
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
    /// Explicit timestamp; `None` lets the client stamp the send time.
    pub timestamp_ms: Option<i64>,
}

/// Where the broker placed an acknowledged record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledged {
    pub partition: i32,
    pub offset: i64,
}

/// Completion of a single produce.
pub type DeliveryFuture = BoxFuture<'static, Result<Acknowledged, ClientError>>;

/// One transactional session against the broker.
#[async_trait]
pub trait TransactionalClient: Send + Sync {
    /// High-water mark of each partition `0..partitions`.
    async fn end_offsets(&self, topic: &str, partitions: i32) -> Result<Vec<i64>, ClientError>;

    async fn begin_transaction(&self) -> Result<(), ClientError>;

    /// Enqueue a record and return a future that resolves once the broker has
    /// acknowledged (or rejected) it. Enqueueing never waits for the broker.
    fn produce(&self, record: ProduceRecord) -> DeliveryFuture;

    /// Wait until every enqueued record has been attempted.
    async fn flush(&self, timeout: Duration) -> Result<(), ClientError>;

    async fn end_transaction(&self, outcome: TransactionOutcome) -> Result<(), ClientError>;
}

/// Creates a new client for each epoch.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    type Client: TransactionalClient + 'static;

    async fn connect(&self, options: &SessionOptions) -> Result<Self::Client, ClientError>;
}
