//! Outbound notification sink backed by SES.
//!
//! Source and destination addresses are optional configuration: when either
//! is unset, sends fail with a terminal [`MailerError::NotConfigured`] so
//! consumers can drop the event with a warning instead of retrying a send
//! that can never succeed.

use crate::config::MailerConfig;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_ses::types::{Body, Content, Destination, Message};
use aws_sdk_ses::Client as SesClient;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors raised while dispatching a notification.
#[derive(Error, Debug)]
pub enum MailerError {
    /// Source or destination address is not configured. Terminal: the event
    /// is dropped with a warning, never retried.
    #[error("notification addresses are not configured")]
    NotConfigured,

    /// The message could not be assembled. Terminal.
    #[error("invalid notification: {0}")]
    InvalidMessage(String),

    /// The notification service could not be reached. Transient: the
    /// delivery layer redelivers the triggering message.
    #[error("notification service unavailable: {0}")]
    Unavailable(String),
}

/// A human-readable notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    pub body: String,
}

impl Notification {
    /// Fixed success notice sent for every admitted upload.
    pub fn upload_success() -> Self {
        Self {
            subject: "File Upload Successful".to_string(),
            body: "Your file upload was successful!".to_string(),
        }
    }

    /// Rejection notice carrying the reason verbatim.
    pub fn upload_rejected(reason: &str) -> Self {
        Self {
            subject: "File Upload Rejected".to_string(),
            body: format!(
                "Your file upload was rejected due to the following reason: {}",
                reason
            ),
        }
    }
}

/// Outbound dispatcher, injected into consumers so tests can substitute a
/// recording fake.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, notification: Notification) -> Result<(), MailerError>;
}

/// SES-backed notification sink.
pub struct SesMailer {
    client: SesClient,
    source: Option<String>,
    destination: Option<String>,
}

impl SesMailer {
    /// Create a mailer for the configured region. Missing addresses do not
    /// fail construction; they surface per send as [`MailerError::NotConfigured`].
    pub async fn new(config: &MailerConfig) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let client = SesClient::new(&aws_config);

        info!(
            region = %config.region,
            configured = config.source.is_some() && config.destination.is_some(),
            "SES mailer initialized"
        );

        Self {
            client,
            source: config.source.clone(),
            destination: config.destination.clone(),
        }
    }
}

#[async_trait]
impl NotificationSink for SesMailer {
    #[instrument(skip(self, notification), fields(subject = %notification.subject))]
    async fn send(&self, notification: Notification) -> Result<(), MailerError> {
        let (Some(source), Some(destination)) = (&self.source, &self.destination) else {
            return Err(MailerError::NotConfigured);
        };

        let subject = Content::builder()
            .data(notification.subject.clone())
            .build()
            .map_err(|e| MailerError::InvalidMessage(e.to_string()))?;
        let text = Content::builder()
            .data(notification.body)
            .build()
            .map_err(|e| MailerError::InvalidMessage(e.to_string()))?;
        let message = Message::builder()
            .subject(subject)
            .body(Body::builder().text(text).build())
            .build();

        self.client
            .send_email()
            .source(source.clone())
            .destination(
                Destination::builder()
                    .to_addresses(destination.clone())
                    .build(),
            )
            .message(message)
            .send()
            .await
            .map_err(|e| MailerError::Unavailable(e.to_string()))?;

        metrics::counter!("ingestion.emails.sent").increment(1);
        debug!(subject = %notification.subject, "Notification email sent");

        Ok(())
    }
}
