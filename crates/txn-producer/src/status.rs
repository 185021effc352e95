//! Acknowledgement tracking for the transactional producer.
//!
//! All counters and the latency histogram live in one [`WorkerStatus`] behind
//! a single lock, because completions update a counter and the histogram
//! together and a summary must never see one without the other.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::latency::{DecayingHistogram, HistogramSummary};

/// An acknowledgement that did not land at the predicted offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadOffset {
    pub partition: i32,
    pub offset: i64,
}

/// Mutable producer statistics.
#[derive(Debug)]
pub struct WorkerStatus {
    /// How many messages did we try to transmit?
    pub sent: i64,

    /// How many messages were acked by the server at the offset we expected?
    pub acked: i64,

    /// How many messages landed at an unexpected offset?
    pub bad_offsets: i64,

    /// How many failures occurred while trying to begin, abort, commit or
    /// flush a transaction.
    pub failed_transactions: i64,

    /// How many times was the epoch loop restarted?
    pub restarts: i64,

    /// True only while a produce run is in progress.
    pub active: bool,

    latency: DecayingHistogram,
    last_checkpoint: Instant,
}

impl WorkerStatus {
    pub fn new() -> Self {
        Self {
            sent: 0,
            acked: 0,
            bad_offsets: 0,
            failed_transactions: 0,
            restarts: 0,
            active: false,
            latency: DecayingHistogram::default(),
            last_checkpoint: Instant::now(),
        }
    }

    pub fn on_sent(&mut self) {
        self.sent += 1;
    }

    pub fn on_acked(&mut self, latency: Duration) {
        self.acked += 1;
        self.latency
            .update(u64::try_from(latency.as_micros()).unwrap_or(u64::MAX));
    }

    pub fn on_bad_offset(&mut self) {
        self.bad_offsets += 1;
    }

    pub fn on_failed_transaction(&mut self) {
        self.failed_transactions += 1;
    }

    pub fn on_restart(&mut self) {
        self.restarts += 1;
    }

    /// Returns true, and restarts the checkpoint timer, once `interval` has
    /// passed since the previous checkpoint. A zero interval is always due.
    pub fn checkpoint_due(&mut self, interval: Duration) -> bool {
        if self.last_checkpoint.elapsed() >= interval {
            self.last_checkpoint = Instant::now();
            true
        } else {
            false
        }
    }

    /// Public view of the status with the latency summary derived from the
    /// private histogram.
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            sent: self.sent,
            acked: self.acked,
            bad_offsets: self.bad_offsets,
            failed_transactions: self.failed_transactions,
            restarts: self.restarts,
            latency: self.latency.summarize(),
            active: self.active,
        }
    }
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable status, as emitted in checkpoint log lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub sent: i64,
    pub acked: i64,
    pub bad_offsets: i64,
    pub failed_transactions: i64,
    pub restarts: i64,
    pub latency: HistogramSummary,
    pub active: bool,
}
