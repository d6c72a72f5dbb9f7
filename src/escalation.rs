//! Escalation handler: drains the dead-letter topic.
//!
//! There is no further escalation tier, so this consumer must never fail a
//! message: it parses dead-lettered payloads defensively, sends a
//! best-effort rejection notice, and always acknowledges to keep the
//! dead-letter queue draining.

use crate::consumer::{BatchHandler, IncomingMessage, Outcome};
use crate::events::DeadLetterNotice;
use crate::mailer::{Notification, NotificationSink};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

const FALLBACK_REASON: &str = "message could not be processed";

/// Consumer for messages that exhausted their delivery budget.
pub struct EscalationHandler {
    mailer: Arc<dyn NotificationSink>,
}

impl EscalationHandler {
    pub fn new(mailer: Arc<dyn NotificationSink>) -> Self {
        Self { mailer }
    }
}

/// Best-effort extraction of the failure reason from a dead-lettered
/// payload: a well-formed notice, then any JSON carrying an `errorMessage`
/// string, then a generic fallback.
fn extract_reason(payload: &[u8]) -> String {
    if let Ok(notice) = serde_json::from_slice::<DeadLetterNotice>(payload) {
        return notice.error_message;
    }

    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(payload) {
        if let Some(message) = value.get("errorMessage").and_then(|m| m.as_str()) {
            return message.to_string();
        }
    }

    FALLBACK_REASON.to_string()
}

#[async_trait]
impl BatchHandler for EscalationHandler {
    fn name(&self) -> &'static str {
        "escalation"
    }

    async fn handle(&self, message: &IncomingMessage) -> Outcome {
        let reason = extract_reason(&message.payload);

        info!(reason = %reason, "Escalating dead-lettered message");
        metrics::counter!("ingestion.escalation.handled").increment(1);

        match self
            .mailer
            .send(Notification::upload_rejected(&reason))
            .await
        {
            Ok(()) => {}
            Err(e) => {
                // Best effort only: the message is still acknowledged so the
                // dead-letter queue keeps draining.
                error!(error = %e, "Failed to send escalation notice");
                metrics::counter!("ingestion.escalation.notice_failed").increment(1);
            }
        }

        Outcome::Accepted
    }
}
