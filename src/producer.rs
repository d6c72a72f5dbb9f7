//! Producer side of the ingestion pipeline.
//!
//! Publishes upload-status events, redeliveries of retryable messages, and
//! dead-letter notices for messages that exhausted their delivery budget.

use crate::config::{KafkaConfig, TopicsConfig};
use crate::events::{DeadLetterNotice, StatusEvent, DELIVERY_ATTEMPT_HEADER};
use async_trait::async_trait;
use chrono::Utc;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors that can occur during message production.
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    #[error("Failed to send message to topic {topic}: {message}")]
    SendError { topic: String, message: String },

    #[error("Producer timeout after {0:?}")]
    Timeout(Duration),
}

/// Result of a successful message delivery.
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Message to be published.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    /// Create an outgoing message with a JSON payload.
    pub fn new_json<T: serde::Serialize>(
        topic: impl Into<String>,
        message: &T,
    ) -> Result<Self, ProducerError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| ProducerError::SerializationError(e.to_string()))?;
        Ok(Self {
            topic: topic.into(),
            key: None,
            payload,
            headers: Vec::new(),
        })
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

/// Publishes upload-status events; injected into the Admission Consumer so
/// tests can substitute a recording fake.
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    async fn publish_status(&self, event: &StatusEvent) -> Result<(), ProducerError>;
}

/// High-level producer wrapper for the ingestion topics.
pub struct EventProducer {
    producer: FutureProducer,
    topics: TopicsConfig,
    default_timeout: Duration,
}

impl EventProducer {
    /// Create a new producer with the given configuration.
    pub fn new(kafka: &KafkaConfig, topics: TopicsConfig) -> Result<Self, ProducerError> {
        info!("Creating producer for {}", kafka.bootstrap_servers);

        let producer: FutureProducer = kafka
            .base_client_config()
            .create()
            .map_err(|e| ProducerError::CreationError(e.to_string()))?;

        Ok(Self {
            producer,
            topics,
            default_timeout: kafka.request_timeout(),
        })
    }

    /// Send a message and wait for delivery confirmation.
    #[instrument(skip(self, message), fields(topic = %message.topic, key = ?message.key))]
    pub async fn send(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError> {
        let topic = message.topic.clone();

        let mut headers = OwnedHeaders::new();
        for (key, value) in &message.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }

        let mut record = FutureRecord::to(&topic)
            .payload(&message.payload)
            .headers(headers);

        if let Some(ref k) = message.key {
            record = record.key(k);
        }

        debug!(
            "Sending message to topic {} (size: {} bytes)",
            topic,
            message.payload.len()
        );

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.default_timeout))
            .await
            .map_err(|(e, _)| ProducerError::SendError {
                topic: topic.clone(),
                message: e.to_string(),
            })?;

        Ok(DeliveryResult {
            topic,
            partition,
            offset,
        })
    }

    /// Republish a message to its own topic with an incremented
    /// delivery-attempt header. This is the delivery layer's redelivery step
    /// for retryable failures.
    pub async fn redeliver(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
        headers: &HashMap<String, String>,
        next_attempt: u32,
    ) -> Result<DeliveryResult, ProducerError> {
        let mut message = OutgoingMessage {
            topic: topic.to_string(),
            key: key.map(String::from),
            payload: payload.to_vec(),
            headers: Vec::new(),
        };

        for (name, value) in headers {
            if name != DELIVERY_ATTEMPT_HEADER {
                message = message.with_header(name.clone(), value.clone());
            }
        }
        message = message.with_header(DELIVERY_ATTEMPT_HEADER, next_attempt.to_string());

        metrics::counter!("ingestion.messages.redelivered").increment(1);
        self.send(message).await
    }

    /// Wrap an exhausted message in a dead-letter notice and publish it to
    /// the dead-letter topic.
    pub async fn send_to_dlq(
        &self,
        source_topic: &str,
        payload: &[u8],
        error: &str,
    ) -> Result<DeliveryResult, ProducerError> {
        let notice = DeadLetterNotice {
            error_message: error.to_string(),
            source_topic: source_topic.to_string(),
            failed_at: Utc::now(),
            payload: Some(String::from_utf8_lossy(payload).into_owned()),
        };

        let message = OutgoingMessage::new_json(&self.topics.dead_letter, &notice)?
            .with_key(Uuid::new_v4().to_string())
            .with_header("error-reason", error);

        metrics::counter!("ingestion.messages.dead_lettered").increment(1);
        self.send(message).await
    }

    /// Flush all pending messages.
    pub fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| ProducerError::Timeout(timeout))
    }
}

#[async_trait]
impl StatusPublisher for EventProducer {
    async fn publish_status(&self, event: &StatusEvent) -> Result<(), ProducerError> {
        let message = OutgoingMessage::new_json(&self.topics.status, event)?;
        self.send(message).await.map(|_| ())
    }
}

impl Drop for EventProducer {
    fn drop(&mut self) {
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!("Failed to flush producer on shutdown: {}", e);
        }
    }
}
