//! Worker configuration.

use std::time::Duration;

use crate::error::{ProducerError, Result};
use crate::offsets::ControlRecordMode;

/// Default transaction timeout handed to the protocol client.
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(120);

/// Default interval between ledger/status checkpoints.
pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(5);

/// Broker connection settings shared by every worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Kafka brokers (comma-separated list)
    pub brokers: String,
    /// Topic to produce to
    pub topic: String,
    /// Extra librdkafka properties applied to every client
    pub client_properties: Vec<(String, String)>,
    /// Upper bound on begin/end transaction operations
    pub transaction_timeout: Duration,
}

impl WorkerConfig {
    pub fn new(brokers: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            topic: topic.into(),
            client_properties: Vec::new(),
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT,
        }
    }

    pub fn with_client_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.client_properties.push((key.into(), value.into()));
        self
    }

    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }
}

/// Configuration of a [`TransactionalProducerWorker`](crate::TransactionalProducerWorker).
///
/// Created once and never mutated while the worker runs.
#[derive(Debug, Clone)]
pub struct TransactionalProducerConfig {
    pub worker: WorkerConfig,
    /// Worker name used in log lines
    pub name: String,
    pub partitions: i32,
    /// Payload size in bytes
    pub message_size: usize,
    /// Total number of messages to produce successfully
    pub message_count: i64,
    /// Base for synthetic, monotonically increasing record timestamps.
    /// `None` uses wall-clock send time.
    pub fake_timestamp_ms: Option<i64>,
    /// Probability in `[0, 1]` that a transaction is aborted
    pub abort_rate: f64,
    pub msgs_per_transaction: u64,
    pub checkpoint_interval: Duration,
    /// Seed for partition choice and abort decisions; `None` seeds from the OS
    pub seed: Option<u64>,
    /// How the broker spends offsets on transaction control records
    pub control_records: ControlRecordMode,
}

impl TransactionalProducerConfig {
    pub fn new(worker: WorkerConfig, partitions: i32, message_count: i64) -> Self {
        Self {
            worker,
            name: "transactional-producer".to_string(),
            partitions,
            message_size: 16384,
            message_count,
            fake_timestamp_ms: None,
            abort_rate: 0.0,
            msgs_per_transaction: 10,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            seed: None,
            control_records: ControlRecordMode::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_message_size(mut self, message_size: usize) -> Self {
        self.message_size = message_size;
        self
    }

    pub fn with_fake_timestamp_ms(mut self, fake_timestamp_ms: Option<i64>) -> Self {
        self.fake_timestamp_ms = fake_timestamp_ms;
        self
    }

    pub fn with_abort_rate(mut self, abort_rate: f64) -> Self {
        self.abort_rate = abort_rate;
        self
    }

    pub fn with_msgs_per_transaction(mut self, msgs_per_transaction: u64) -> Self {
        self.msgs_per_transaction = msgs_per_transaction;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_control_records(mut self, mode: ControlRecordMode) -> Self {
        self.control_records = mode;
        self
    }

    pub fn topic(&self) -> &str {
        &self.worker.topic
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker.topic.is_empty() {
            return Err(ProducerError::InvalidConfig("topic must not be empty".into()));
        }
        if self.partitions <= 0 {
            return Err(ProducerError::InvalidConfig(format!(
                "partition count must be positive, got {}",
                self.partitions
            )));
        }
        if self.message_count < 0 {
            return Err(ProducerError::InvalidConfig(format!(
                "message count must not be negative, got {}",
                self.message_count
            )));
        }
        if !(0.0..=1.0).contains(&self.abort_rate) {
            return Err(ProducerError::InvalidConfig(format!(
                "abort rate must be within [0, 1], got {}",
                self.abort_rate
            )));
        }
        if self.msgs_per_transaction == 0 {
            return Err(ProducerError::InvalidConfig(
                "messages per transaction must be at least 1".into(),
            ));
        }
        if matches!(self.fake_timestamp_ms, Some(ts) if ts < 0) {
            return Err(ProducerError::InvalidConfig(
                "fake timestamp base must not be negative".into(),
            ));
        }
        Ok(())
    }
}
