//! Transactional producer worker.
//!
//! [`TransactionalProducerWorker::wait`] keeps running epochs until the
//! configured number of messages has been produced at the offsets the worker
//! predicted. Each epoch ([`TransactionalProducerWorker::produce_inner`]) uses
//! a brand new transactional id, so a retried epoch never resumes a previous
//! session.
//!
//! ```text
//!  wait ──► produce_inner ──► begin ─► produce × msgs_per_transaction ─► flush/end/begin ─► ...
//!   ▲             │                        │
//!   │             │                        └─► completion tasks: status + ledger
//!   └─────────────┴── remaining > 0 ◄── drain + checkpoint
//! ```

use offset_ledger::TopicOffsetRanges;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::{
    ClientFactory, DeliveryFuture, SessionOptions, TransactionOutcome, TransactionalClient,
};
use crate::config::TransactionalProducerConfig;
use crate::error::{ClientError, ProducerError, Result};
use crate::kafka::KafkaClientFactory;
use crate::offsets::{ControlRecordPolicy, ExpectedOffsets};
use crate::record::{RecordFactory, PRODUCER_ID};
use crate::status::{BadOffset, StatusSnapshot, WorkerStatus};

/// Maximum number of unacknowledged produces per epoch.
pub const MAX_IN_FLIGHT: usize = 4096;

/// Capacity of the per-epoch bad offset queue. Must be at least
/// [`MAX_IN_FLIGHT`] so completions never wait on the queue.
pub const BAD_OFFSET_QUEUE_CAPACITY: usize = 16384;

/// Result of one epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpochOutcome {
    /// Messages produced at their predicted offsets.
    pub produced: i64,
    pub bad_offsets: Vec<BadOffset>,
}

enum Boundary {
    Crossed,
    /// A bad offset or fatal error was seen in the finished transaction.
    Stopped,
    /// Flush, end or begin failed.
    Failed,
}

/// State shared between the dispatch loop and the completion tasks of one
/// epoch.
struct EpochShared {
    status: Arc<Mutex<WorkerStatus>>,
    valid_offsets: Arc<TopicOffsetRanges>,
    bad_offsets: mpsc::Sender<BadOffset>,
    saw_bad_offset: AtomicBool,
    fatal: StdMutex<Option<ProducerError>>,
}

impl EpochShared {
    fn set_fatal(&self, err: ProducerError) {
        let mut fatal = self.fatal.lock().unwrap_or_else(PoisonError::into_inner);
        if fatal.is_none() {
            *fatal = Some(err);
        }
    }

    fn has_fatal(&self) -> bool {
        self.fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn take_fatal(&self) -> Option<ProducerError> {
        self.fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn should_stop(&self) -> bool {
        self.saw_bad_offset.load(Ordering::SeqCst) || self.has_fatal()
    }

    /// Completion handler for one produce.
    async fn complete(
        self: Arc<Self>,
        delivery: DeliveryFuture,
        partition: i32,
        expected_offset: i64,
        sent_at: Instant,
        _permit: OwnedSemaphorePermit,
    ) {
        let result = delivery.await;

        let ack = match result {
            Ok(ack) => ack,
            Err(err) => {
                error!("Produce failed: {err}");
                self.set_fatal(ProducerError::Delivery {
                    partition,
                    reason: err.to_string(),
                });
                return;
            }
        };

        if ack.partition != partition || ack.offset != expected_offset {
            warn!(
                "Produced at unexpected offset {} (expected {}) on partition {}",
                ack.offset, expected_offset, ack.partition
            );
            self.status.lock().await.on_bad_offset();
            let bad = BadOffset {
                partition: ack.partition,
                offset: ack.offset,
            };
            if self.bad_offsets.try_send(bad).is_err() {
                warn!("Bad offset queue full, dropping {bad:?}");
            }
            self.saw_bad_offset.store(true, Ordering::SeqCst);
            return;
        }

        self.status.lock().await.on_acked(sent_at.elapsed());
        debug!("Wrote partition {} at {}", ack.partition, ack.offset);

        if let Err(err) = self.valid_offsets.insert(ack.partition, ack.offset) {
            self.set_fatal(err.into());
        }
    }
}

/// Wait until every dispatched produce has been handled. Completion tasks
/// hold their permit until they are done.
async fn settle(gate: &Semaphore) {
    if let Ok(all) = gate.acquire_many(MAX_IN_FLIGHT as u32).await {
        drop(all);
    }
}

/// Clears the active flag when a run is dropped before it finishes.
struct ActiveGuard {
    status: Arc<Mutex<WorkerStatus>>,
    armed: bool,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(mut status) = self.status.try_lock() {
            status.active = false;
        } else if let Ok(handle) = tokio::runtime::Handle::try_current() {
            // A completion task still holds the lock.
            let status = Arc::clone(&self.status);
            handle.spawn(async move {
                status.lock().await.active = false;
            });
        }
    }
}

/// Produces messages in transactions and records which offsets were
/// verifiably written.
pub struct TransactionalProducerWorker<F: ClientFactory = KafkaClientFactory> {
    config: TransactionalProducerConfig,
    factory: F,
    status: Arc<Mutex<WorkerStatus>>,
    valid_offsets: Arc<TopicOffsetRanges>,
    records: RecordFactory,
    policy: Arc<dyn ControlRecordPolicy>,
    rng: Box<dyn RngCore + Send>,
    shutdown: CancellationToken,
}

impl TransactionalProducerWorker<KafkaClientFactory> {
    /// Create a worker that talks to Kafka and keeps its offset ledger in
    /// `ledger_dir`.
    pub fn new(config: TransactionalProducerConfig, ledger_dir: impl AsRef<Path>) -> Result<Self> {
        config.validate()?;
        let valid_offsets =
            TopicOffsetRanges::load(ledger_dir, config.topic(), config.partitions as usize)?;
        let factory = KafkaClientFactory::new(config.worker.clone());
        Self::with_factory(config, factory, valid_offsets)
    }
}

impl<F: ClientFactory> TransactionalProducerWorker<F> {
    pub fn with_factory(
        config: TransactionalProducerConfig,
        factory: F,
        valid_offsets: TopicOffsetRanges,
    ) -> Result<Self> {
        config.validate()?;
        let rng: Box<dyn RngCore + Send> = match config.seed {
            Some(seed) => Box::new(StdRng::seed_from_u64(seed)),
            None => Box::new(StdRng::from_os_rng()),
        };

        Ok(Self {
            records: RecordFactory::new(config.message_size, config.fake_timestamp_ms),
            policy: Arc::new(config.control_records),
            status: Arc::new(Mutex::new(WorkerStatus::new())),
            valid_offsets: Arc::new(valid_offsets),
            config,
            factory,
            rng,
            shutdown: CancellationToken::new(),
        })
    }

    /// Replace the random source used for partition choice and abort
    /// decisions.
    pub fn with_rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.rng = Box::new(rng);
        self
    }

    /// Override how control records are accounted for at transaction
    /// boundaries.
    pub fn with_control_record_policy(mut self, policy: impl ControlRecordPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Stop issuing new messages once `token` is cancelled. In-flight
    /// produces still drain and the open transaction is ended.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn config(&self) -> &TransactionalProducerConfig {
        &self.config
    }

    pub fn valid_offsets(&self) -> &TopicOffsetRanges {
        &self.valid_offsets
    }

    /// Current status with a freshly derived latency summary.
    pub async fn get_status(&self) -> StatusSnapshot {
        self.status.lock().await.snapshot()
    }

    pub async fn reset_stats(&self) {
        *self.status.lock().await = WorkerStatus::new();
    }

    /// Produce the configured number of messages, restarting epochs until
    /// enough of them landed at their predicted offsets.
    pub async fn wait(&mut self) -> Result<()> {
        self.status.lock().await.active = true;
        let mut guard = ActiveGuard {
            status: Arc::clone(&self.status),
            armed: true,
        };

        let result = self.produce_all().await;

        guard.armed = false;
        self.status.lock().await.active = false;
        result
    }

    async fn produce_all(&mut self) -> Result<()> {
        let mut remaining = self.config.message_count;

        while remaining > 0 {
            let outcome = self.produce_inner(remaining).await?;
            remaining -= outcome.produced;

            if !outcome.bad_offsets.is_empty() {
                info!("Produce stopped early, {remaining} still to do");
            }

            if remaining > 0 {
                if self.shutdown.is_cancelled() {
                    warn!("Shutdown requested with {remaining} messages still to do");
                    return Err(ProducerError::Cancelled { remaining });
                }
                // Record that we took another run at produce_inner
                self.status.lock().await.on_restart();
            }
        }
        Ok(())
    }

    /// Run one transactional session that tries to produce `n` messages.
    ///
    /// Returns how many were produced at their predicted offsets and every
    /// bad offset observed. Only client construction, the opening begin,
    /// delivery failures and ledger persistence failures are errors;
    /// transaction boundary failures end the epoch early instead.
    pub async fn produce_inner(&mut self, n: i64) -> Result<EpochOutcome> {
        let topic = self.config.topic().to_string();
        let timeout = self.config.worker.transaction_timeout;
        let options = SessionOptions {
            topic: topic.clone(),
            transactional_id: format!("p{}", Uuid::new_v4()),
            transaction_timeout: timeout,
        };

        let client = self.factory.connect(&options).await.map_err(|err| {
            error!("Error creating Kafka client: {err}");
            ProducerError::ClientConstruction(err)
        })?;

        let start_offsets = client
            .end_offsets(&topic, self.config.partitions)
            .await
            .map_err(ProducerError::EndOffsets)?;
        if start_offsets.len() != self.config.partitions as usize {
            return Err(ProducerError::EndOffsets(ClientError::Rejected(format!(
                "expected end offsets for {} partitions, got {}",
                self.config.partitions,
                start_offsets.len()
            ))));
        }
        for (partition, offset) in start_offsets.iter().enumerate() {
            info!("Produce start offset {topic}/{partition} {offset}...");
        }
        let mut expected = ExpectedOffsets::new(start_offsets);

        let (bad_tx, mut bad_rx) = mpsc::channel(BAD_OFFSET_QUEUE_CAPACITY);
        let shared = Arc::new(EpochShared {
            status: Arc::clone(&self.status),
            valid_offsets: Arc::clone(&self.valid_offsets),
            bad_offsets: bad_tx,
            saw_bad_offset: AtomicBool::new(false),
            fatal: StdMutex::new(None),
        });
        let gate = Arc::new(Semaphore::new(MAX_IN_FLIGHT));
        let tracker = TaskTracker::new();

        info!(
            "[{}] Producing {n} messages ({} bytes)",
            self.config.name, self.config.message_size
        );

        if let Err(err) = client.begin_transaction().await {
            error!("Couldn't start a transaction: {err}");
            self.status.lock().await.on_failed_transaction();
            return Err(ProducerError::BeginTransaction(err));
        }
        expected.after_begin(self.policy.as_ref());

        let mut will_abort = self.roll_abort();
        let mut errored = false;
        let mut produced: i64 = 0;
        let per_transaction = i64::try_from(self.config.msgs_per_transaction).unwrap_or(i64::MAX);

        for i in 0..n {
            if shared.should_stop() || self.shutdown.is_cancelled() {
                break;
            }

            if i > 0 && i % per_transaction == 0 {
                let outcome = TransactionOutcome::from_abort(will_abort);
                match self.cross_boundary(&client, &gate, &shared, outcome).await {
                    Boundary::Crossed => {}
                    Boundary::Stopped => break,
                    Boundary::Failed => {
                        errored = true;
                        break;
                    }
                }
                expected.after_boundary(self.policy.as_ref(), outcome);
                // Decide if the newly started transaction will be aborted
                will_abort = self.roll_abort();
            }

            let permit = tokio::select! {
                permit = Arc::clone(&gate).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        shared.set_fatal(ProducerError::ConcurrencyGateClosed);
                        break;
                    }
                },
                _ = self.shutdown.cancelled() => break,
            };

            let partition = self.rng.random_range(0..self.config.partitions);
            let Some(expected_offset) = expected.reserve(partition) else {
                shared.set_fatal(ProducerError::EndOffsets(ClientError::Rejected(format!(
                    "no end offset for partition {partition}"
                ))));
                break;
            };

            produced += 1;
            let checkpoint_due = {
                let mut status = self.status.lock().await;
                status.on_sent();
                status.checkpoint_due(self.config.checkpoint_interval)
            };

            let record = self
                .records
                .build(PRODUCER_ID, expected_offset, partition, will_abort);

            let sent_at = Instant::now();
            let delivery = client.produce(record);
            tracker.spawn(Arc::clone(&shared).complete(
                delivery,
                partition,
                expected_offset,
                sent_at,
                permit,
            ));

            // Not strictly necessary, but useful if a long running producer
            // gets killed before finishing.
            if checkpoint_due {
                if let Err(err) = self.produce_checkpoint().await {
                    shared.set_fatal(err);
                    break;
                }
            }
        }

        if let Err(err) = client.flush(timeout).await {
            error!("Unable to flush: {err}");
            errored = true;
            self.status.lock().await.on_failed_transaction();
        }
        settle(&gate).await;
        let outcome = if shared.has_fatal() {
            TransactionOutcome::Abort
        } else {
            TransactionOutcome::from_abort(will_abort)
        };
        if let Err(err) = client.end_transaction(outcome).await {
            error!("Unable to end transaction ({outcome}): {err}");
            errored = true;
            self.status.lock().await.on_failed_transaction();
        }

        info!("Waiting...");
        tracker.close();
        tracker.wait().await;
        info!("Waited.");
        drop(client);

        let mut bad_offsets = Vec::new();
        while let Ok(bad) = bad_rx.try_recv() {
            bad_offsets.push(bad);
        }

        if let Some(err) = shared.take_fatal() {
            if let Err(checkpoint_err) = self.produce_checkpoint().await {
                error!("Final checkpoint failed: {checkpoint_err}");
            }
            return Err(err);
        }
        self.produce_checkpoint().await?;

        if errored || !bad_offsets.is_empty() {
            warn!("{} bad offsets", bad_offsets.len());
        }
        Ok(EpochOutcome {
            produced: produced - bad_offsets.len() as i64,
            bad_offsets,
        })
    }

    /// Flush, end the current transaction and begin the next one.
    ///
    /// Every completion of the current transaction is handled before it is
    /// ended, so a transaction containing a failed delivery or a bad offset
    /// is left for the epoch to close instead of being committed here.
    async fn cross_boundary(
        &self,
        client: &F::Client,
        gate: &Semaphore,
        shared: &EpochShared,
        outcome: TransactionOutcome,
    ) -> Boundary {
        if let Err(err) = client.flush(self.config.worker.transaction_timeout).await {
            error!("Unable to flush: {err}");
            self.status.lock().await.on_failed_transaction();
            return Boundary::Failed;
        }

        settle(gate).await;
        if shared.should_stop() {
            return Boundary::Stopped;
        }

        if let Err(err) = client.end_transaction(outcome).await {
            error!("Unable to end transaction ({outcome}): {err}");
            self.status.lock().await.on_failed_transaction();
            return Boundary::Failed;
        }
        if let Err(err) = client.begin_transaction().await {
            error!("Couldn't start a transaction: {err}");
            self.status.lock().await.on_failed_transaction();
            return Boundary::Failed;
        }
        Boundary::Crossed
    }

    fn roll_abort(&mut self) -> bool {
        self.rng.random::<f64>() < self.config.abort_rate
    }

    /// Persist the ledger and log the status.
    async fn produce_checkpoint(&self) -> Result<()> {
        self.valid_offsets.store()?;

        let snapshot = self.status.lock().await.snapshot();
        let data = serde_json::to_string(&snapshot)?;
        info!("TransactionalProducer status: {data}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Acknowledged;
    use futures::FutureExt;
    use tempfile::TempDir;

    fn shared(dir: &TempDir, capacity: usize) -> (Arc<EpochShared>, mpsc::Receiver<BadOffset>) {
        let (tx, rx) = mpsc::channel(capacity);
        let shared = EpochShared {
            status: Arc::new(Mutex::new(WorkerStatus::new())),
            valid_offsets: Arc::new(TopicOffsetRanges::new(dir.path(), "t", 2)),
            bad_offsets: tx,
            saw_bad_offset: AtomicBool::new(false),
            fatal: StdMutex::new(None),
        };
        (Arc::new(shared), rx)
    }

    fn ack(partition: i32, offset: i64) -> DeliveryFuture {
        futures::future::ready(Ok(Acknowledged { partition, offset })).boxed()
    }

    #[tokio::test]
    async fn test_matching_ack_updates_status_and_ledger() {
        let dir = TempDir::new().unwrap();
        let (shared, mut rx) = shared(&dir, 4);
        let gate = Arc::new(Semaphore::new(1));
        let permit = Arc::clone(&gate).acquire_owned().await.unwrap();

        Arc::clone(&shared)
            .complete(ack(1, 7), 1, 7, Instant::now(), permit)
            .await;

        assert_eq!(gate.available_permits(), 1);
        assert!(!shared.should_stop());
        assert!(shared.valid_offsets.contains(1, 7));
        assert_eq!(shared.status.lock().await.acked, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unexpected_ack_is_queued_not_recorded() {
        let dir = TempDir::new().unwrap();
        let (shared, mut rx) = shared(&dir, 4);
        let gate = Arc::new(Semaphore::new(1));
        let permit = Arc::clone(&gate).acquire_owned().await.unwrap();

        Arc::clone(&shared)
            .complete(ack(0, 9), 0, 8, Instant::now(), permit)
            .await;

        assert!(shared.should_stop());
        assert!(!shared.valid_offsets.contains(0, 9));
        assert_eq!(shared.status.lock().await.bad_offsets, 1);
        assert_eq!(
            rx.try_recv().unwrap(),
            BadOffset {
                partition: 0,
                offset: 9
            }
        );
    }

    #[tokio::test]
    async fn test_first_fatal_error_wins() {
        let dir = TempDir::new().unwrap();
        let (shared, _rx) = shared(&dir, 1);

        shared.set_fatal(ProducerError::ConcurrencyGateClosed);
        shared.set_fatal(ProducerError::InvalidConfig("later".into()));

        assert!(shared.should_stop());
        assert!(matches!(
            shared.take_fatal(),
            Some(ProducerError::ConcurrencyGateClosed)
        ));
        assert!(shared.take_fatal().is_none());
    }
}
