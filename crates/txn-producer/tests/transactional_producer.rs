//! End-to-end runs of the transactional producer against the in-memory broker.

use offset_ledger::TopicOffsetRanges;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use txn_producer::testing::SimulatedBroker;
use txn_producer::{
    classify_key, ControlRecordMode, KeyKind, ProducerError, TransactionOutcome,
    TransactionalProducerConfig, TransactionalProducerWorker, WorkerConfig, ABORTED_KEY_PREFIX,
};

const TOPIC: &str = "verifier";
const PARTITIONS: i32 = 3;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter("txn_producer=debug")
        .with_test_writer()
        .try_init()
        .ok();
}

fn config(message_count: i64) -> TransactionalProducerConfig {
    TransactionalProducerConfig::new(WorkerConfig::new("simulated:9092", TOPIC), PARTITIONS, message_count)
        .with_message_size(64)
        .with_msgs_per_transaction(25)
        .with_seed(Some(7))
}

fn worker(
    broker: &SimulatedBroker,
    ledger_dir: &Path,
    config: TransactionalProducerConfig,
) -> TransactionalProducerWorker<SimulatedBroker> {
    let ledger = TopicOffsetRanges::load(ledger_dir, TOPIC, PARTITIONS as usize).unwrap();
    TransactionalProducerWorker::with_factory(config, broker.clone(), ledger).unwrap()
}

// =============================================================================
// Happy paths
// =============================================================================

#[tokio::test]
async fn test_commit_only_run() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let broker = SimulatedBroker::new(PARTITIONS as usize);
    let mut worker = worker(&broker, dir.path(), config(100));

    worker.wait().await.unwrap();

    let transactions = broker.transactions();
    assert_eq!(transactions.begun, 4);
    assert_eq!(transactions.committed, 4);
    assert_eq!(transactions.aborted, 0);

    let status = worker.get_status().await;
    assert_eq!(status.sent, 100);
    assert_eq!(status.acked, 100);
    assert_eq!(status.bad_offsets, 0);
    assert_eq!(status.failed_transactions, 0);
    assert_eq!(status.restarts, 0);
    assert!(!status.active);
    assert_eq!(status.latency.count, 100);

    let records = broker.records();
    assert_eq!(records.len(), 100);
    assert_eq!(worker.valid_offsets().total_offsets(), 100);
    for record in &records {
        assert!(worker.valid_offsets().contains(record.partition, record.offset));
        assert_eq!(record.outcome, Some(TransactionOutcome::Commit));
        assert!(matches!(classify_key(&record.key), KeyKind::Committed { .. }));
    }

    // The final checkpoint persisted everything that was acknowledged.
    let reloaded = TopicOffsetRanges::load(dir.path(), TOPIC, PARTITIONS as usize).unwrap();
    assert_eq!(reloaded.total_offsets(), 100);
}

#[tokio::test]
async fn test_always_abort_marks_every_key() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let broker = SimulatedBroker::new(PARTITIONS as usize);
    let mut worker = worker(&broker, dir.path(), config(100).with_abort_rate(1.0));

    worker.wait().await.unwrap();

    let transactions = broker.transactions();
    assert_eq!(transactions.committed, 0);
    assert_eq!(transactions.aborted, 4);

    let records = broker.records();
    assert_eq!(records.len(), 100);
    for record in &records {
        assert!(record.key.starts_with(ABORTED_KEY_PREFIX.as_bytes()));
        assert_eq!(record.outcome, Some(TransactionOutcome::Abort));
    }
    assert_eq!(worker.valid_offsets().total_offsets(), 100);
    assert_eq!(worker.get_status().await.bad_offsets, 0);
}

#[tokio::test]
async fn test_starts_from_existing_log_end() {
    let dir = TempDir::new().unwrap();
    let broker = SimulatedBroker::new(PARTITIONS as usize).with_log_end_offsets(vec![10, 200, 3_000]);
    let mut worker = worker(&broker, dir.path(), config(60).with_abort_rate(0.5));

    worker.wait().await.unwrap();

    let status = worker.get_status().await;
    assert_eq!(status.acked, 60);
    assert_eq!(status.bad_offsets, 0);
    for record in broker.records() {
        assert!(record.offset > 10);
    }
}

#[tokio::test]
async fn test_single_epoch_reports_everything_produced() {
    let dir = TempDir::new().unwrap();
    let broker = SimulatedBroker::new(PARTITIONS as usize);
    let mut worker = worker(&broker, dir.path(), config(40));

    let outcome = worker.produce_inner(40).await.unwrap();

    assert_eq!(outcome.produced, 40);
    assert!(outcome.bad_offsets.is_empty());
    assert_eq!(broker.sessions().len(), 1);
}

#[tokio::test]
async fn test_zero_messages_is_a_no_op_run() {
    let dir = TempDir::new().unwrap();
    let broker = SimulatedBroker::new(PARTITIONS as usize);
    let mut worker = worker(&broker, dir.path(), config(0));

    worker.wait().await.unwrap();

    assert!(broker.records().is_empty());
    assert_eq!(worker.get_status().await.sent, 0);
}

// =============================================================================
// Offset prediction
// =============================================================================

#[tokio::test]
async fn test_unexpected_offset_restarts_epoch() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let broker = SimulatedBroker::new(PARTITIONS as usize).phantom_record_before_produce(10);
    let mut worker = worker(&broker, dir.path(), config(100));

    worker.wait().await.unwrap();

    let status = worker.get_status().await;
    assert!(status.restarts >= 1);
    assert!(status.bad_offsets >= 1);
    assert_eq!(status.acked, 100);
    assert_eq!(worker.valid_offsets().total_offsets(), 100);
    assert!(status.acked + status.bad_offsets <= status.sent);
    assert_eq!(broker.sessions().len() as i64, status.restarts + 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bad_offset_stops_dispatch_within_a_transaction() {
    let dir = TempDir::new().unwrap();
    let broker = SimulatedBroker::new(PARTITIONS as usize).phantom_record_before_produce(10);
    let mut worker = worker(
        &broker,
        dir.path(),
        config(50_000).with_msgs_per_transaction(1_000_000),
    );

    let outcome = worker.produce_inner(50_000).await.unwrap();

    let dispatched = broker.produce_calls() as i64;
    assert!(!outcome.bad_offsets.is_empty());
    assert!(
        dispatched < 10_000,
        "dispatched {dispatched} messages after an early bad offset"
    );
    assert_eq!(
        outcome.produced + outcome.bad_offsets.len() as i64,
        dispatched
    );
    assert_eq!(worker.get_status().await.bad_offsets, outcome.bad_offsets.len() as i64);
    // Never reached a transaction boundary.
    assert_eq!(broker.transactions().begun, 1);
}

#[tokio::test]
async fn test_abort_markers_need_matching_policy() {
    let dir = TempDir::new().unwrap();
    let broker = SimulatedBroker::new(PARTITIONS as usize)
        .with_control_records(ControlRecordMode::AbortWithMarker);
    let mut mismatched = worker(&broker, dir.path(), config(100).with_abort_rate(1.0));

    mismatched.wait().await.unwrap();

    let status = mismatched.get_status().await;
    assert!(status.bad_offsets > 0);
    assert!(status.restarts >= 1);
    assert_eq!(status.acked, 100);

    let dir = TempDir::new().unwrap();
    let broker = SimulatedBroker::new(PARTITIONS as usize)
        .with_control_records(ControlRecordMode::AbortWithMarker);
    let mut matched = worker(
        &broker,
        dir.path(),
        config(100)
            .with_abort_rate(1.0)
            .with_control_records(ControlRecordMode::AbortWithMarker),
    );

    matched.wait().await.unwrap();

    let status = matched.get_status().await;
    assert_eq!(status.bad_offsets, 0);
    assert_eq!(status.restarts, 0);
    assert_eq!(status.acked, 100);
}

#[tokio::test]
async fn test_dispatched_records_match_sent_counter() {
    let dir = TempDir::new().unwrap();
    let broker = SimulatedBroker::new(PARTITIONS as usize).phantom_record_before_produce(30);
    let mut worker = worker(&broker, dir.path(), config(150).with_abort_rate(0.3));

    worker.wait().await.unwrap();

    let mut per_partition: HashMap<i32, i64> = HashMap::new();
    for record in broker.records() {
        *per_partition.entry(record.partition).or_default() += 1;
    }
    let status = worker.get_status().await;
    assert_eq!(per_partition.values().sum::<i64>(), status.sent);
    assert_eq!(broker.produce_calls() as i64, status.sent);
}

// =============================================================================
// Sessions and records
// =============================================================================

#[tokio::test]
async fn test_every_epoch_uses_a_fresh_transactional_id() {
    let dir = TempDir::new().unwrap();
    let broker = SimulatedBroker::new(PARTITIONS as usize)
        .phantom_record_before_produce(5)
        .phantom_record_before_produce(60);
    let mut worker = worker(&broker, dir.path(), config(100));

    worker.wait().await.unwrap();

    let sessions = broker.sessions();
    assert!(sessions.len() >= 2);
    let unique: HashSet<&String> = sessions.iter().collect();
    assert_eq!(unique.len(), sessions.len());
    assert!(sessions.iter().all(|id| id.starts_with('p')));
}

#[tokio::test]
async fn test_fake_timestamps_are_sequential() {
    let dir = TempDir::new().unwrap();
    let broker = SimulatedBroker::new(PARTITIONS as usize);
    let mut worker = worker(&broker, dir.path(), config(50).with_fake_timestamp_ms(Some(1_000)));

    worker.wait().await.unwrap();

    let timestamps: Vec<i64> = broker
        .records()
        .iter()
        .map(|record| record.timestamp_ms.unwrap())
        .collect();
    let expected: Vec<i64> = (1_000..1_050).collect();
    assert_eq!(timestamps, expected);
}

#[tokio::test]
async fn test_keys_carry_expected_offset() {
    let dir = TempDir::new().unwrap();
    let broker = SimulatedBroker::new(PARTITIONS as usize);
    let mut worker = worker(&broker, dir.path(), config(30));

    worker.wait().await.unwrap();

    for record in broker.records() {
        match classify_key(&record.key) {
            KeyKind::Committed { sequence, .. } => assert_eq!(sequence, record.offset),
            other => panic!("unexpected key kind {other:?}"),
        }
    }
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_delivery_failure_is_fatal() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let broker = SimulatedBroker::new(PARTITIONS as usize).fail_delivery_at(5);
    let mut worker = worker(&broker, dir.path(), config(100));

    let result = worker.wait().await;

    assert!(matches!(result, Err(ProducerError::Delivery { .. })));
    let status = worker.get_status().await;
    assert!(!status.active);
    assert_eq!(status.restarts, 0);
    // The open transaction was aborted rather than committed.
    assert_eq!(broker.transactions().committed, 0);
    assert_eq!(broker.transactions().aborted, 1);
}

#[tokio::test]
async fn test_connect_failure_is_fatal() {
    let dir = TempDir::new().unwrap();
    let broker = SimulatedBroker::new(PARTITIONS as usize).fail_connect();
    let mut worker = worker(&broker, dir.path(), config(10));

    let result = worker.wait().await;

    assert!(matches!(result, Err(ProducerError::ClientConstruction(_))));
    assert!(!worker.get_status().await.active);
}

#[tokio::test]
async fn test_first_begin_failure_is_fatal() {
    let dir = TempDir::new().unwrap();
    let broker = SimulatedBroker::new(PARTITIONS as usize).fail_begin_at(1);
    let mut worker = worker(&broker, dir.path(), config(10));

    let result = worker.wait().await;

    assert!(matches!(result, Err(ProducerError::BeginTransaction(_))));
    assert_eq!(worker.get_status().await.failed_transactions, 1);
    assert!(broker.records().is_empty());
}

#[tokio::test]
async fn test_end_failure_at_boundary_ends_epoch_early() {
    let dir = TempDir::new().unwrap();
    let broker = SimulatedBroker::new(PARTITIONS as usize).fail_end_at(2);
    let mut worker = worker(&broker, dir.path(), config(100));

    worker.wait().await.unwrap();

    let status = worker.get_status().await;
    assert_eq!(status.failed_transactions, 1);
    assert_eq!(status.restarts, 1);
    assert_eq!(status.acked, 100);
    assert_eq!(broker.sessions().len(), 2);
}

#[tokio::test]
async fn test_unwritable_ledger_fails_the_run() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("not-a-directory");
    std::fs::write(&blocker, b"occupied").unwrap();

    let broker = SimulatedBroker::new(PARTITIONS as usize);
    let ledger = TopicOffsetRanges::new(&blocker, TOPIC, PARTITIONS as usize);
    let mut worker = TransactionalProducerWorker::with_factory(
        config(20).with_checkpoint_interval(Duration::ZERO),
        broker.clone(),
        ledger,
    )
    .unwrap();

    let result = worker.wait().await;

    assert!(matches!(result, Err(ProducerError::Ledger(_))));
    // The first in-loop checkpoint failed, so nothing after the first record
    // was dispatched.
    assert_eq!(broker.records().len(), 1);
    let status = worker.get_status().await;
    assert_eq!(status.sent, 1);
    assert!(!status.active);
    assert_eq!(broker.transactions().aborted, 1);
}

#[tokio::test]
async fn test_unwritable_ledger_surfaces_at_final_checkpoint() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("not-a-directory");
    std::fs::write(&blocker, b"occupied").unwrap();

    let broker = SimulatedBroker::new(PARTITIONS as usize);
    let ledger = TopicOffsetRanges::new(&blocker, TOPIC, PARTITIONS as usize);
    let mut worker = TransactionalProducerWorker::with_factory(
        config(20).with_checkpoint_interval(Duration::from_secs(3600)),
        broker.clone(),
        ledger,
    )
    .unwrap();

    let result = worker.wait().await;

    assert!(matches!(result, Err(ProducerError::Ledger(_))));
    assert_eq!(broker.records().len(), 20);
    assert_eq!(broker.transactions().committed, 1);
}

#[tokio::test]
async fn test_invalid_config_rejected_up_front() {
    let dir = TempDir::new().unwrap();
    let broker = SimulatedBroker::new(PARTITIONS as usize);
    let ledger = TopicOffsetRanges::new(dir.path(), TOPIC, PARTITIONS as usize);

    let result =
        TransactionalProducerWorker::with_factory(config(10).with_abort_rate(2.0), broker, ledger);

    assert!(matches!(result, Err(ProducerError::InvalidConfig(_))));
}

// =============================================================================
// Status and shutdown
// =============================================================================

#[tokio::test]
async fn test_reset_stats_zeroes_counters() {
    let dir = TempDir::new().unwrap();
    let broker = SimulatedBroker::new(PARTITIONS as usize);
    let mut worker = worker(&broker, dir.path(), config(20));

    worker.wait().await.unwrap();
    assert_eq!(worker.get_status().await.acked, 20);

    worker.reset_stats().await;

    let status = worker.get_status().await;
    assert_eq!(status.sent, 0);
    assert_eq!(status.acked, 0);
    assert_eq!(status.latency.count, 0);
    assert_eq!(status.restarts, 0);
    assert!(!status.active);
    // The ledger is not part of the statistics.
    assert_eq!(worker.valid_offsets().total_offsets(), 20);
}

#[tokio::test]
async fn test_shutdown_stops_before_dispatch() {
    let dir = TempDir::new().unwrap();
    let broker = SimulatedBroker::new(PARTITIONS as usize);
    let token = CancellationToken::new();
    token.cancel();
    let mut worker = worker(&broker, dir.path(), config(100)).with_shutdown(token);

    let result = worker.wait().await;

    assert!(matches!(
        result,
        Err(ProducerError::Cancelled { remaining: 100 })
    ));
    assert!(broker.records().is_empty());
    assert!(!worker.get_status().await.active);
}

#[tokio::test]
async fn test_dropped_run_clears_active_flag() {
    let dir = TempDir::new().unwrap();
    let broker = SimulatedBroker::new(PARTITIONS as usize);
    let mut worker = worker(&broker, dir.path(), config(10_000));

    {
        let run = worker.wait();
        tokio::pin!(run);
        assert!(futures::poll!(&mut run).is_pending());
    }

    let status = worker.get_status().await;
    assert!(status.sent > 0);
    assert!(!status.active);
}
