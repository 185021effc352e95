//! txn-verifier
//!
//! Drives a transactional produce workload against a Kafka topic and keeps a
//! ledger of every offset that was verifiably written, so a consumer-side
//! validator can check it read exactly the committed records.
//!
//! # CLI Usage
//!
//! ```bash
//! # 100k messages in transactions of 10, aborting one transaction in five
//! txn-verifier --brokers localhost:9092 --topic verifier --partitions 3 \
//!   --count 100000 --abort-rate 0.2 --ledger-dir ./ledger
//!
//! # Brokers that write an abort marker, extra librdkafka settings
//! txn-verifier --brokers localhost:9092 --topic verifier --partitions 3 \
//!   --count 1000 --abort-control-records -X linger.ms=5
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use txn_producer::config::{DEFAULT_CHECKPOINT_INTERVAL, DEFAULT_TRANSACTION_TIMEOUT};
use txn_producer::{ControlRecordMode, TransactionalProducerConfig, WorkerConfig};

pub mod config;

use config::{parse_duration, parse_key_value};

#[derive(Parser, Clone, Debug)]
#[command(name = "txn-verifier")]
#[command(about = "Produce transactionally to Kafka and record verified offsets")]
pub struct ProducerArgs {
    /// Kafka brokers (comma-separated list)
    #[arg(long, default_value = "localhost:9092", env = "KAFKA_BROKERS")]
    pub brokers: String,

    /// Topic to produce to
    #[arg(long, env = "KAFKA_TOPIC")]
    pub topic: String,

    /// Number of partitions of the topic
    #[arg(long, default_value = "1")]
    pub partitions: i32,

    /// Payload size in bytes
    #[arg(long = "msg-size", default_value = "16384")]
    pub message_size: usize,

    /// Number of messages that must land at their predicted offsets
    #[arg(long)]
    pub count: i64,

    /// Use synthetic record timestamps starting at this value (milliseconds)
    #[arg(long)]
    pub fake_timestamp_ms: Option<i64>,

    /// Probability of aborting each transaction, in [0, 1]
    #[arg(long, default_value = "0")]
    pub abort_rate: f64,

    /// Messages per transaction
    #[arg(long, default_value = "10")]
    pub msgs_per_transaction: u64,

    /// Transaction timeout (e.g. "2m", "90s")
    #[arg(long, value_parser = parse_duration, default_value = "2m")]
    pub transaction_timeout: Duration,

    /// Interval between ledger checkpoints (e.g. "5s")
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    pub checkpoint_interval: Duration,

    /// Directory holding the valid offsets ledger
    #[arg(long, default_value = ".", env = "LEDGER_DIR")]
    pub ledger_dir: PathBuf,

    /// Seed for partition choice and abort decisions
    #[arg(long)]
    pub seed: Option<u64>,

    /// The brokers write a control record for aborted transactions
    #[arg(long)]
    pub abort_control_records: bool,

    /// Worker name used in log lines
    #[arg(long, default_value = "transactional-producer")]
    pub name: String,

    /// Extra librdkafka property, repeatable (key=value)
    #[arg(short = 'X', value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub client_properties: Vec<(String, String)>,
}

impl ProducerArgs {
    pub fn to_config(&self) -> TransactionalProducerConfig {
        let mut worker = WorkerConfig::new(&self.brokers, &self.topic)
            .with_transaction_timeout(self.transaction_timeout);
        for (key, value) in &self.client_properties {
            worker = worker.with_client_property(key, value);
        }

        let control_records = if self.abort_control_records {
            ControlRecordMode::AbortWithMarker
        } else {
            ControlRecordMode::AbortWithoutMarker
        };

        TransactionalProducerConfig::new(worker, self.partitions, self.count)
            .with_name(&self.name)
            .with_message_size(self.message_size)
            .with_fake_timestamp_ms(self.fake_timestamp_ms)
            .with_abort_rate(self.abort_rate)
            .with_msgs_per_transaction(self.msgs_per_transaction)
            .with_checkpoint_interval(self.checkpoint_interval)
            .with_seed(self.seed)
            .with_control_records(control_records)
    }
}
