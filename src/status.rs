//! Status notifier: turns upload-result events into operator emails.
//!
//! Duplicate emails under at-least-once redelivery are an accepted
//! trade-off; the sink is not idempotent and no deduplication is attempted.

use crate::consumer::{BatchHandler, IncomingMessage, Outcome};
use crate::events::{StatusEvent, UploadStatus};
use crate::mailer::{MailerError, Notification, NotificationSink};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Consumer for upload-status events.
pub struct StatusHandler {
    mailer: Arc<dyn NotificationSink>,
}

impl StatusHandler {
    pub fn new(mailer: Arc<dyn NotificationSink>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl BatchHandler for StatusHandler {
    fn name(&self) -> &'static str {
        "status-notifier"
    }

    async fn handle(&self, message: &IncomingMessage) -> Outcome {
        let event: StatusEvent = match message.decode_json() {
            Ok(event) => event,
            Err(e) => return Outcome::Rejected(format!("malformed status event: {}", e)),
        };

        let notification = match event.upload_status {
            UploadStatus::Success => Notification::upload_success(),
            UploadStatus::Failure => Notification::upload_rejected(
                event.error_message.as_deref().unwrap_or("unknown error"),
            ),
            UploadStatus::Unknown => {
                warn!("Unknown upload status; event dropped");
                return Outcome::Rejected("unknown upload status".to_string());
            }
        };

        match self.mailer.send(notification).await {
            Ok(()) => Outcome::Accepted,
            // A missing address is a configuration error: retrying can never
            // succeed, so the event is dropped and the gap made visible once.
            Err(MailerError::NotConfigured) => {
                warn!("Notification addresses not configured; event dropped");
                Outcome::Rejected("notification addresses not configured".to_string())
            }
            Err(e @ MailerError::InvalidMessage(_)) => Outcome::Rejected(e.to_string()),
            Err(e @ MailerError::Unavailable(_)) => {
                Outcome::Retry(anyhow::Error::new(e).context("sending status notification"))
            }
        }
    }
}
