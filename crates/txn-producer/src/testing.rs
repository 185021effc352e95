//! In-memory transactional broker for exercising the worker without Kafka.
//!
//! The broker assigns offsets the way a partition log does, spends offsets
//! on control records according to its [`ControlRecordMode`], and completes
//! deliveries asynchronously and out of order. Faults are keyed by the
//! 1-based index of the produce, begin or end call across all sessions.

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::client::{
    Acknowledged, ClientFactory, DeliveryFuture, ProduceRecord, SessionOptions,
    TransactionOutcome, TransactionalClient,
};
use crate::error::ClientError;
use crate::offsets::{ControlRecordMode, ControlRecordPolicy};

/// A record as it was appended to the simulated log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedRecord {
    pub partition: i32,
    pub offset: i64,
    pub key: Vec<u8>,
    pub timestamp_ms: Option<i64>,
    pub transactional_id: String,
    /// How the enclosing transaction ended; `None` while it is still open.
    pub outcome: Option<TransactionOutcome>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionCounts {
    pub begun: u64,
    pub committed: u64,
    pub aborted: u64,
}

#[derive(Debug, Default)]
struct Faults {
    fail_connect: bool,
    phantom_before_produce: HashSet<u64>,
    fail_delivery_at: HashSet<u64>,
    fail_begin_at: HashSet<u64>,
    fail_end_at: HashSet<u64>,
}

#[derive(Debug)]
struct BrokerState {
    mode: ControlRecordMode,
    log_end: Vec<i64>,
    records: Vec<SimulatedRecord>,
    sessions: Vec<String>,
    transactions: TransactionCounts,
    produce_calls: u64,
    end_calls: u64,
    begin_calls: u64,
    faults: Faults,
}

/// Shared handle to a simulated broker. Clones observe the same logs.
#[derive(Debug, Clone)]
pub struct SimulatedBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl SimulatedBroker {
    /// A broker with `partitions` empty partitions that leaves no control
    /// record on abort.
    pub fn new(partitions: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                mode: ControlRecordMode::default(),
                log_end: vec![0; partitions],
                records: Vec::new(),
                sessions: Vec::new(),
                transactions: TransactionCounts::default(),
                produce_calls: 0,
                end_calls: 0,
                begin_calls: 0,
                faults: Faults::default(),
            })),
        }
    }

    pub fn with_control_records(self, mode: ControlRecordMode) -> Self {
        self.state().mode = mode;
        self
    }

    /// Start partitions at the given log end offsets instead of zero.
    pub fn with_log_end_offsets(self, offsets: Vec<i64>) -> Self {
        self.state().log_end = offsets;
        self
    }

    /// Append an extra record ahead of the `n`-th produce, so that record
    /// lands one offset later than the producer predicted.
    pub fn phantom_record_before_produce(self, n: u64) -> Self {
        self.state().faults.phantom_before_produce.insert(n);
        self
    }

    /// Fail delivery of the `n`-th produce.
    pub fn fail_delivery_at(self, n: u64) -> Self {
        self.state().faults.fail_delivery_at.insert(n);
        self
    }

    pub fn fail_begin_at(self, n: u64) -> Self {
        self.state().faults.fail_begin_at.insert(n);
        self
    }

    pub fn fail_end_at(self, n: u64) -> Self {
        self.state().faults.fail_end_at.insert(n);
        self
    }

    pub fn fail_connect(self) -> Self {
        self.state().faults.fail_connect = true;
        self
    }

    pub fn records(&self) -> Vec<SimulatedRecord> {
        self.state().records.clone()
    }

    pub fn log_end_offsets(&self) -> Vec<i64> {
        self.state().log_end.clone()
    }

    pub fn transactions(&self) -> TransactionCounts {
        self.state().transactions
    }

    /// Transactional ids of every session opened so far.
    pub fn sessions(&self) -> Vec<String> {
        self.state().sessions.clone()
    }

    pub fn produce_calls(&self) -> u64 {
        self.state().produce_calls
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ClientFactory for SimulatedBroker {
    type Client = SimulatedClient;

    async fn connect(&self, options: &SessionOptions) -> Result<Self::Client, ClientError> {
        let mut state = self.state();
        if state.faults.fail_connect {
            return Err(ClientError::Rejected("simulated connect failure".into()));
        }
        state.sessions.push(options.transactional_id.clone());
        Ok(SimulatedClient {
            broker: self.clone(),
            transactional_id: options.transactional_id.clone(),
            open_records: Mutex::new(Vec::new()),
        })
    }
}

/// One session against a [`SimulatedBroker`].
#[derive(Debug)]
pub struct SimulatedClient {
    broker: SimulatedBroker,
    transactional_id: String,
    /// Indices into the broker's records written by the open transaction.
    open_records: Mutex<Vec<usize>>,
}

impl SimulatedClient {
    fn open_records(&self) -> MutexGuard<'_, Vec<usize>> {
        self.open_records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl TransactionalClient for SimulatedClient {
    async fn end_offsets(&self, _topic: &str, partitions: i32) -> Result<Vec<i64>, ClientError> {
        let state = self.broker.state();
        let wanted = usize::try_from(partitions).unwrap_or(0);
        if wanted > state.log_end.len() {
            return Err(ClientError::Rejected(format!(
                "topic has {} partitions, asked for {partitions}",
                state.log_end.len()
            )));
        }
        Ok(state.log_end[..wanted].to_vec())
    }

    async fn begin_transaction(&self) -> Result<(), ClientError> {
        let mut state = self.broker.state();
        state.begin_calls += 1;
        if state.faults.fail_begin_at.contains(&state.begin_calls) {
            return Err(ClientError::Rejected("simulated begin failure".into()));
        }
        let delta = state.mode.on_begin();
        for end in &mut state.log_end {
            *end += delta;
        }
        state.transactions.begun += 1;
        Ok(())
    }

    fn produce(&self, record: ProduceRecord) -> DeliveryFuture {
        let mut state = self.broker.state();
        state.produce_calls += 1;
        let call = state.produce_calls;

        let Some(partition) = usize::try_from(record.partition)
            .ok()
            .filter(|p| *p < state.log_end.len())
        else {
            let reason = format!("unknown partition {}", record.partition);
            return futures::future::ready(Err(ClientError::Rejected(reason))).boxed();
        };

        if state.faults.fail_delivery_at.contains(&call) {
            return futures::future::ready(Err(ClientError::Rejected(
                "simulated delivery failure".into(),
            )))
            .boxed();
        }
        if state.faults.phantom_before_produce.contains(&call) {
            state.log_end[partition] += 1;
        }

        let offset = state.log_end[partition];
        state.log_end[partition] += 1;
        state.records.push(SimulatedRecord {
            partition: record.partition,
            offset,
            key: record.key,
            timestamp_ms: record.timestamp_ms,
            transactional_id: self.transactional_id.clone(),
            outcome: None,
        });
        let index = state.records.len() - 1;
        drop(state);
        self.open_records().push(index);

        let ack = Acknowledged {
            partition: record.partition,
            offset,
        };
        // Vary completion order between neighbouring records.
        let yields = call % 4;
        async move {
            for _ in 0..yields {
                tokio::task::yield_now().await;
            }
            Ok(ack)
        }
        .boxed()
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), ClientError> {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    async fn end_transaction(&self, outcome: TransactionOutcome) -> Result<(), ClientError> {
        let open: Vec<usize> = std::mem::take(&mut *self.open_records());
        let mut state = self.broker.state();
        state.end_calls += 1;
        if state.faults.fail_end_at.contains(&state.end_calls) {
            // The broker aborts a transaction it could not end cleanly.
            for index in open {
                state.records[index].outcome = Some(TransactionOutcome::Abort);
            }
            return Err(ClientError::Rejected("simulated end transaction failure".into()));
        }

        let delta = state.mode.on_end(outcome);
        for end in &mut state.log_end {
            *end += delta;
        }
        match outcome {
            TransactionOutcome::Commit => state.transactions.committed += 1,
            TransactionOutcome::Abort => state.transactions.aborted += 1,
        }
        for index in open {
            state.records[index].outcome = Some(outcome);
        }
        Ok(())
    }
}
