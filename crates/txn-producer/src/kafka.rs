//! librdkafka-backed transactional client.
//!
//! Delivery reports arrive on librdkafka's polling thread through
//! [`DeliveryContext::delivery`], which completes the per-record channel
//! returned from [`TransactionalClient::produce`]. Transaction calls block
//! inside librdkafka and therefore run on the blocking pool.

use async_trait::async_trait;
use futures::FutureExt;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::message::DeliveryResult;
use rdkafka::producer::{BaseRecord, Producer, ProducerContext, ThreadedProducer};
use rdkafka::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::client::{
    Acknowledged, ClientFactory, DeliveryFuture, ProduceRecord, SessionOptions,
    TransactionOutcome, TransactionalClient,
};
use crate::config::WorkerConfig;
use crate::error::ClientError;

type DeliverySender = oneshot::Sender<Result<Acknowledged, ClientError>>;

/// Routes each delivery report to the future waiting for it.
pub struct DeliveryContext;

impl ClientContext for DeliveryContext {}

impl ProducerContext for DeliveryContext {
    type DeliveryOpaque = Box<DeliverySender>;

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, delivery_opaque: Self::DeliveryOpaque) {
        let result = match delivery_result {
            Ok(message) => Ok(Acknowledged {
                partition: message.partition(),
                offset: message.offset(),
            }),
            Err((err, _message)) => Err(ClientError::Kafka(err.clone())),
        };
        // The worker may have stopped listening; nothing left to notify.
        let _ = delivery_opaque.send(result);
    }
}

/// Creates one librdkafka transactional producer per session.
#[derive(Debug, Clone)]
pub struct KafkaClientFactory {
    config: WorkerConfig,
}

impl KafkaClientFactory {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    fn client_config(&self, options: &SessionOptions) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.config.brokers)
            .set("transactional.id", &options.transactional_id)
            .set(
                "transaction.timeout.ms",
                options.transaction_timeout.as_millis().to_string(),
            )
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("compression.type", "none");
        for (key, value) in &self.config.client_properties {
            config.set(key, value);
        }
        config
    }
}

#[async_trait]
impl ClientFactory for KafkaClientFactory {
    type Client = KafkaTransactionalClient;

    async fn connect(&self, options: &SessionOptions) -> Result<Self::Client, ClientError> {
        let producer: ThreadedProducer<DeliveryContext> = self
            .client_config(options)
            .create_with_context(DeliveryContext)?;
        let producer = Arc::new(producer);

        let init = Arc::clone(&producer);
        let timeout = options.transaction_timeout;
        tokio::task::spawn_blocking(move || init.init_transactions(timeout)).await??;

        tracing::debug!(
            "Initialized transactional producer '{}'",
            options.transactional_id
        );

        Ok(KafkaTransactionalClient {
            producer,
            topic: options.topic.clone(),
            transaction_timeout: options.transaction_timeout,
        })
    }
}

/// A transactional session backed by a librdkafka producer.
pub struct KafkaTransactionalClient {
    producer: Arc<ThreadedProducer<DeliveryContext>>,
    topic: String,
    transaction_timeout: Duration,
}

#[async_trait]
impl TransactionalClient for KafkaTransactionalClient {
    async fn end_offsets(&self, topic: &str, partitions: i32) -> Result<Vec<i64>, ClientError> {
        let producer = Arc::clone(&self.producer);
        let topic = topic.to_string();
        let timeout = self.transaction_timeout;

        tokio::task::spawn_blocking(move || {
            (0..partitions)
                .map(|partition| {
                    producer
                        .client()
                        .fetch_watermarks(&topic, partition, timeout)
                        .map(|(_low, high)| high)
                        .map_err(ClientError::from)
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .await?
    }

    async fn begin_transaction(&self) -> Result<(), ClientError> {
        let producer = Arc::clone(&self.producer);
        tokio::task::spawn_blocking(move || producer.begin_transaction()).await??;
        Ok(())
    }

    fn produce(&self, record: ProduceRecord) -> DeliveryFuture {
        let (tx, rx) = oneshot::channel();
        let mut base = BaseRecord::with_opaque_to(&self.topic, Box::new(tx))
            .partition(record.partition)
            .key(&record.key)
            .payload(&record.payload);
        if let Some(timestamp_ms) = record.timestamp_ms {
            base = base.timestamp(timestamp_ms);
        }

        match self.producer.send(base) {
            Ok(()) => async move { rx.await.map_err(|_| ClientError::Canceled)? }.boxed(),
            Err((err, _record)) => futures::future::ready(Err(ClientError::Kafka(err))).boxed(),
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<(), ClientError> {
        let producer = Arc::clone(&self.producer);
        tokio::task::spawn_blocking(move || producer.flush(timeout)).await??;
        Ok(())
    }

    async fn end_transaction(&self, outcome: TransactionOutcome) -> Result<(), ClientError> {
        let producer = Arc::clone(&self.producer);
        let timeout = self.transaction_timeout;
        tokio::task::spawn_blocking(move || match outcome {
            TransactionOutcome::Commit => producer.commit_transaction(timeout),
            TransactionOutcome::Abort => producer.abort_transaction(timeout),
        })
        .await??;
        Ok(())
    }
}
