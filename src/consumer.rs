//! Consumer side of the ingestion pipeline: a uniform batch driver shared
//! by every consumer.
//!
//! Messages are collected into small batches (bounded size, short batching
//! window) and processed sequentially. Each message yields an explicit
//! [`Outcome`]; the driver acknowledges terminal outcomes, republishes
//! retryable ones with an incremented delivery-attempt header, and moves
//! messages that exhausted their attempt budget to the dead-letter topic.

use crate::config::KafkaConfig;
use crate::events::DELIVERY_ATTEMPT_HEADER;
use crate::producer::EventProducer;
use anyhow::Context;
use rdkafka::consumer::{
    CommitMode, Consumer, DefaultConsumerContext, MessageStream, StreamConsumer,
};
use rdkafka::message::{Headers, Message as KafkaMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Errors that can occur while running a consumer.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topic: {0}")]
    SubscriptionError(String),

    #[error("Failed to commit offsets: {0}")]
    CommitError(String),
}

/// Metadata about a received message.
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

/// A received message with payload and metadata.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub payload: Vec<u8>,
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    /// Deserialize the payload as JSON.
    pub fn decode_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Get the message key as a string.
    pub fn key_str(&self) -> Option<String> {
        self.metadata
            .key
            .as_ref()
            .and_then(|k| String::from_utf8(k.clone()).ok())
    }

    /// Get a header value.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.metadata.headers.get(key).map(|s| s.as_str())
    }

    /// Which delivery attempt this is, starting at 1 for the first.
    pub fn delivery_attempt(&self) -> u32 {
        self.header(DELIVERY_ATTEMPT_HEADER)
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|&attempt| attempt >= 1)
            .unwrap_or(1)
    }
}

/// Per-message processing result consumed by the batch driver.
#[derive(Debug)]
pub enum Outcome {
    /// Fully processed; the message is acknowledged.
    Accepted,
    /// Terminal decision made once per message; acknowledged without retry.
    Rejected(String),
    /// Transient failure; the delivery layer redelivers up to the attempt
    /// budget, then escalates to the dead-letter topic.
    Retry(anyhow::Error),
}

/// Handler invoked by the driver for each message of a batch.
#[async_trait::async_trait]
pub trait BatchHandler: Send + Sync {
    /// Consumer name, used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Process a single message.
    async fn handle(&self, message: &IncomingMessage) -> Outcome;
}

/// What the driver does with a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryDisposition {
    Redeliver { next_attempt: u32 },
    DeadLetter,
}

/// Route a retryable failure: redeliver while the attempt budget lasts,
/// dead-letter once it is exhausted.
pub(crate) fn retry_disposition(attempt: u32, max_attempts: u32) -> RetryDisposition {
    if attempt < max_attempts {
        RetryDisposition::Redeliver {
            next_attempt: attempt + 1,
        }
    } else {
        RetryDisposition::DeadLetter
    }
}

/// Driver tuning, derived from configuration.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Maximum messages per batch.
    pub batch_size: usize,
    /// How long to wait for a batch to fill once the first message arrived.
    pub batch_window: Duration,
    /// Wall-clock budget for processing one batch; exceeding it leaves the
    /// batch uncommitted so the platform redelivers it.
    pub batch_budget: Duration,
    /// Delivery attempts before a message is dead-lettered.
    pub max_delivery_attempts: u32,
}

/// Batch-driving consumer bound to a single topic and group.
pub struct ConsumerRunner {
    consumer: StreamConsumer,
    producer: Arc<EventProducer>,
    topic: String,
    settings: ConsumerSettings,
    shutdown_tx: broadcast::Sender<()>,
}

impl ConsumerRunner {
    /// Create a runner subscribed to `topic` under `group_id`.
    pub fn new(
        kafka: &KafkaConfig,
        group_id: &str,
        topic: &str,
        producer: Arc<EventProducer>,
        settings: ConsumerSettings,
    ) -> Result<Self, ConsumerError> {
        let mut client_config = kafka.base_client_config();

        client_config
            .set("group.id", group_id)
            .set("auto.offset.reset", &kafka.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", kafka.session_timeout_ms.to_string())
            .set(
                "max.poll.interval.ms",
                kafka.max_poll_interval_ms.to_string(),
            );

        let consumer: StreamConsumer = client_config
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| ConsumerError::SubscriptionError(e.to_string()))?;

        info!(topic = %topic, group = %group_id, "Subscribed to topic");

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            consumer,
            producer,
            topic: topic.to_string(),
            settings,
            shutdown_tx,
        })
    }

    /// Signal the runner to stop after the current batch.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Consume batches until shutdown, processing them with `handler`.
    #[instrument(skip(self, handler), fields(topic = %self.topic, consumer = handler.name()))]
    pub async fn run<H: BatchHandler>(&self, handler: Arc<H>) -> Result<(), ConsumerError> {
        use futures::StreamExt;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut stream = self.consumer.stream();

        info!("Starting consumption loop");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
                first = stream.next() => {
                    let Some(first) = first else {
                        debug!("Stream ended");
                        break;
                    };
                    let first = match first {
                        Ok(message) => convert_message(&message),
                        Err(e) => {
                            error!(error = %e, "Kafka consumer error");
                            metrics::counter!("ingestion.kafka.errors").increment(1);
                            continue;
                        }
                    };

                    let batch = self.fill_batch(first, &mut stream).await;
                    let budget = self.settings.batch_budget;

                    match time::timeout(budget, self.process_batch(handler.as_ref(), &batch)).await {
                        Ok(Ok(())) => {
                            if let Err(e) =
                                self.consumer.commit_consumer_state(CommitMode::Async)
                            {
                                warn!(error = %e, "Failed to commit offsets");
                            }
                        }
                        Ok(Err(e)) => {
                            error!(error = %e, "Batch failed; left uncommitted for redelivery");
                        }
                        Err(_) => {
                            error!(
                                budget_secs = budget.as_secs(),
                                "Batch exceeded processing budget; left uncommitted for redelivery"
                            );
                        }
                    }
                }
            }
        }

        // Final commit before shutdown.
        if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Sync) {
            warn!(error = %e, "Failed to commit on shutdown");
        }

        Ok(())
    }

    /// Collect further messages until the batch is full or the batching
    /// window elapses.
    async fn fill_batch(
        &self,
        first: IncomingMessage,
        stream: &mut MessageStream<'_, DefaultConsumerContext>,
    ) -> Vec<IncomingMessage> {
        use futures::StreamExt;

        let mut batch = vec![first];
        let deadline = Instant::now() + self.settings.batch_window;

        while batch.len() < self.settings.batch_size {
            match time::timeout_at(deadline, stream.next()).await {
                Ok(Some(Ok(message))) => batch.push(convert_message(&message)),
                Ok(Some(Err(e))) => {
                    error!(error = %e, "Kafka consumer error");
                    metrics::counter!("ingestion.kafka.errors").increment(1);
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }

        batch
    }

    /// Process the batch sequentially. An error here means a redelivery or
    /// dead-letter publish failed; the caller then withholds the commit so
    /// the whole batch is redelivered.
    async fn process_batch<H: BatchHandler>(
        &self,
        handler: &H,
        batch: &[IncomingMessage],
    ) -> anyhow::Result<()> {
        debug!(consumer = handler.name(), size = batch.len(), "Processing batch");

        for message in batch {
            match handler.handle(message).await {
                Outcome::Accepted => {
                    metrics::counter!("ingestion.messages.processed").increment(1);
                }
                Outcome::Rejected(reason) => {
                    warn!(
                        consumer = handler.name(),
                        partition = message.metadata.partition,
                        offset = message.metadata.offset,
                        reason = %reason,
                        "Message terminally rejected"
                    );
                    metrics::counter!("ingestion.messages.rejected").increment(1);
                }
                Outcome::Retry(cause) => {
                    let attempt = message.delivery_attempt();
                    match retry_disposition(attempt, self.settings.max_delivery_attempts) {
                        RetryDisposition::Redeliver { next_attempt } => {
                            warn!(
                                consumer = handler.name(),
                                attempt,
                                error = %cause,
                                "Retryable failure; scheduling redelivery"
                            );
                            self.producer
                                .redeliver(
                                    &self.topic,
                                    message.key_str().as_deref(),
                                    &message.payload,
                                    &message.metadata.headers,
                                    next_attempt,
                                )
                                .await
                                .context("Failed to redeliver message")?;
                        }
                        RetryDisposition::DeadLetter => {
                            error!(
                                consumer = handler.name(),
                                attempt,
                                error = %cause,
                                "Delivery attempts exhausted; dead-lettering"
                            );
                            self.producer
                                .send_to_dlq(&self.topic, &message.payload, &cause.to_string())
                                .await
                                .context("Failed to dead-letter message")?;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// Convert a borrowed Kafka message into the driver's message type.
fn convert_message<M: KafkaMessage>(msg: &M) -> IncomingMessage {
    let payload = msg.payload().unwrap_or(&[]).to_vec();
    let key = msg.key().map(|k| k.to_vec());

    let mut headers = HashMap::new();
    if let Some(h) = msg.headers() {
        for header in h.iter() {
            if let Some(value) = header.value {
                if let Ok(v) = String::from_utf8(value.to_vec()) {
                    headers.insert(header.key.to_string(), v);
                }
            }
        }
    }

    IncomingMessage {
        payload,
        metadata: MessageMetadata {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            timestamp: msg.timestamp().to_millis(),
            headers,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_with_headers(headers: &[(&str, &str)]) -> IncomingMessage {
        IncomingMessage {
            payload: b"{}".to_vec(),
            metadata: MessageMetadata {
                topic: "gallery.uploads".to_string(),
                partition: 0,
                offset: 42,
                key: Some(b"photo.png".to_vec()),
                timestamp: Some(1234567890),
                headers: headers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
        }
    }

    #[test]
    fn test_delivery_attempt_defaults_to_first() {
        let message = message_with_headers(&[]);
        assert_eq!(message.delivery_attempt(), 1);

        let garbled = message_with_headers(&[(DELIVERY_ATTEMPT_HEADER, "soon")]);
        assert_eq!(garbled.delivery_attempt(), 1);

        let zero = message_with_headers(&[(DELIVERY_ATTEMPT_HEADER, "0")]);
        assert_eq!(zero.delivery_attempt(), 1);
    }

    #[test]
    fn test_delivery_attempt_reads_header() {
        let message = message_with_headers(&[(DELIVERY_ATTEMPT_HEADER, "3")]);
        assert_eq!(message.delivery_attempt(), 3);
    }

    #[test]
    fn test_retry_disposition_budget() {
        assert_eq!(
            retry_disposition(1, 3),
            RetryDisposition::Redeliver { next_attempt: 2 }
        );
        assert_eq!(
            retry_disposition(2, 3),
            RetryDisposition::Redeliver { next_attempt: 3 }
        );
        assert_eq!(retry_disposition(3, 3), RetryDisposition::DeadLetter);
        // Attempts past the budget never loop back to redelivery.
        assert_eq!(retry_disposition(7, 3), RetryDisposition::DeadLetter);
    }

    #[test]
    fn test_incoming_message_accessors() {
        let message = message_with_headers(&[("metadata_type", "Caption")]);
        assert_eq!(message.key_str().as_deref(), Some("photo.png"));
        assert_eq!(message.header("metadata_type"), Some("Caption"));
        assert!(message.header("missing").is_none());

        let decoded: serde_json::Value = message.decode_json().unwrap();
        assert!(decoded.is_object());
    }
}
