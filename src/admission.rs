//! Admission consumer: validates uploaded objects and keeps the catalog in
//! step with the bucket.
//!
//! A `Created` event either admits the object (idempotent upsert, then a
//! success status event) or rejects it (no record, one failure status
//! event). A `Removed` event deletes the record; deleting a record that
//! never existed is not an error, which also makes a delete racing ahead of
//! its create resolve safely to "no record".

use crate::catalog::{Catalog, ImageStatus};
use crate::config::AdmissionConfig;
use crate::consumer::{BatchHandler, IncomingMessage, Outcome};
use crate::events::{
    file_extension, parse_object_notification, EventKind, ObjectRecord, StatusEvent, UploadEvent,
};
use crate::object_probe::{content_type_for_extension, ObjectProbe};
use crate::producer::StatusPublisher;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

/// Consumer for object-lifecycle events on the uploads topic.
pub struct AdmissionHandler {
    catalog: Arc<dyn Catalog>,
    status: Arc<dyn StatusPublisher>,
    /// Present only when content-type verification is enabled.
    probe: Option<Arc<dyn ObjectProbe>>,
    allowed_extensions: Vec<String>,
}

impl AdmissionHandler {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        status: Arc<dyn StatusPublisher>,
        probe: Option<Arc<dyn ObjectProbe>>,
        config: &AdmissionConfig,
    ) -> Self {
        Self {
            catalog,
            status,
            probe,
            allowed_extensions: config.allowed_extensions.clone(),
        }
    }

    async fn process_record(&self, record: &ObjectRecord) -> Outcome {
        let event = match UploadEvent::from_record(record) {
            Ok(event) => event,
            Err(e) => return Outcome::Rejected(e.to_string()),
        };

        match event.kind {
            EventKind::Removed => self.remove(&event).await,
            EventKind::Created => self.admit(&event).await,
        }
    }

    async fn remove(&self, event: &UploadEvent) -> Outcome {
        match self.catalog.delete_image(&event.key).await {
            Ok(()) => {
                info!(image = %event.key, "Image record removed");
                Outcome::Accepted
            }
            Err(e) => Outcome::Retry(anyhow::Error::new(e).context("deleting catalog record")),
        }
    }

    async fn admit(&self, event: &UploadEvent) -> Outcome {
        let extension = match file_extension(&event.key) {
            Some(ext) if self.allowed_extensions.contains(&ext) => ext,
            other => {
                let reason = format!(
                    "Invalid file type: {}",
                    other.as_deref().unwrap_or("none")
                );
                return self.reject(&event.key, reason).await;
            }
        };

        if let Some(ref probe) = self.probe {
            match probe.content_type(&event.bucket, &event.key).await {
                Err(e) => {
                    return Outcome::Retry(
                        anyhow::Error::new(e).context("probing object content type"),
                    );
                }
                Ok(declared) => {
                    let expected = content_type_for_extension(&extension);
                    let matches = declared
                        .as_deref()
                        .zip(expected)
                        .map(|(d, e)| d.eq_ignore_ascii_case(e))
                        .unwrap_or(false);
                    if !matches {
                        let reason = format!(
                            "Invalid content type: {}",
                            declared.as_deref().unwrap_or("none")
                        );
                        return self.reject(&event.key, reason).await;
                    }
                }
            }
        }

        if let Err(e) = self
            .catalog
            .upsert_image(&event.key, Utc::now(), ImageStatus::PendingMetadata)
            .await
        {
            return Outcome::Retry(anyhow::Error::new(e).context("writing catalog record"));
        }

        info!(image = %event.key, "Image admitted");
        metrics::counter!("ingestion.admission.accepted").increment(1);

        if let Err(e) = self.status.publish_status(&StatusEvent::success()).await {
            // The upsert is idempotent, so replaying the whole message to
            // re-signal is safe.
            return Outcome::Retry(anyhow::Error::new(e).context("publishing success status"));
        }

        Outcome::Accepted
    }

    /// Terminal rejection: no record is written, one failure status event
    /// is published for the notifier.
    async fn reject(&self, key: &str, reason: String) -> Outcome {
        warn!(image = %key, reason = %reason, "Upload rejected");
        metrics::counter!("ingestion.admission.rejected").increment(1);

        if let Err(e) = self
            .status
            .publish_status(&StatusEvent::failure(reason.clone()))
            .await
        {
            return Outcome::Retry(anyhow::Error::new(e).context("publishing rejection status"));
        }

        Outcome::Rejected(reason)
    }
}

#[async_trait]
impl BatchHandler for AdmissionHandler {
    fn name(&self) -> &'static str {
        "admission"
    }

    async fn handle(&self, message: &IncomingMessage) -> Outcome {
        let notification = match parse_object_notification(&message.payload) {
            Ok(notification) => notification,
            Err(e) => return Outcome::Rejected(e.to_string()),
        };

        let mut rejections = Vec::new();
        for record in &notification.records {
            match self.process_record(record).await {
                Outcome::Accepted => {}
                Outcome::Rejected(reason) => rejections.push(reason),
                // A transient failure redelivers the whole message; every
                // record operation is idempotent under replay.
                retry @ Outcome::Retry(_) => return retry,
            }
        }

        if !notification.records.is_empty() && rejections.len() == notification.records.len() {
            Outcome::Rejected(rejections.join("; "))
        } else {
            Outcome::Accepted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        incoming, lifecycle_message, FixedProbe, MemoryCatalog, RecordingStatusPublisher,
    };
    use crate::events::UploadStatus;
    use std::sync::atomic::Ordering;

    fn handler(
        catalog: Arc<MemoryCatalog>,
        status: Arc<RecordingStatusPublisher>,
        probe: Option<Arc<dyn ObjectProbe>>,
    ) -> AdmissionHandler {
        AdmissionHandler::new(catalog, status, probe, &AdmissionConfig::default())
    }

    #[tokio::test]
    async fn test_created_valid_extension_admits() {
        let catalog = Arc::new(MemoryCatalog::new());
        let status = Arc::new(RecordingStatusPublisher::new());
        let handler = handler(catalog.clone(), status.clone(), None);

        let outcome = handler
            .handle(&lifecycle_message("ObjectCreated:Put", "photo.png"))
            .await;

        assert!(matches!(outcome, Outcome::Accepted));
        let record = catalog.record("photo.png").expect("record created");
        assert_eq!(record.status, "pending_metadata");
        assert!(record.metadata.is_empty());

        let published = status.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].upload_status, UploadStatus::Success);
    }

    #[tokio::test]
    async fn test_created_invalid_extension_rejects_without_record() {
        let catalog = Arc::new(MemoryCatalog::new());
        let status = Arc::new(RecordingStatusPublisher::new());
        let handler = handler(catalog.clone(), status.clone(), None);

        let outcome = handler
            .handle(&lifecycle_message("ObjectCreated:Put", "doc.pdf"))
            .await;

        assert!(matches!(outcome, Outcome::Rejected(_)));
        assert_eq!(catalog.len(), 0);

        let published = status.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].upload_status, UploadStatus::Failure);
        assert_eq!(
            published[0].error_message.as_deref(),
            Some("Invalid file type: pdf")
        );
    }

    #[tokio::test]
    async fn test_created_replay_is_idempotent() {
        let catalog = Arc::new(MemoryCatalog::new());
        let status = Arc::new(RecordingStatusPublisher::new());
        let handler = handler(catalog.clone(), status.clone(), None);

        let message = lifecycle_message("ObjectCreated:Put", "photo.png");
        handler.handle(&message).await;
        let first = catalog.record("photo.png").unwrap();

        handler.handle(&message).await;
        let replayed = catalog.record("photo.png").unwrap();

        assert_eq!(catalog.len(), 1);
        // Replay keeps the original record, including its upload time.
        assert_eq!(first, replayed);
    }

    #[tokio::test]
    async fn test_removed_deletes_record() {
        let catalog = Arc::new(MemoryCatalog::new());
        let status = Arc::new(RecordingStatusPublisher::new());
        let handler = handler(catalog.clone(), status.clone(), None);

        handler
            .handle(&lifecycle_message("ObjectCreated:Put", "photo.png"))
            .await;
        assert_eq!(catalog.len(), 1);

        let outcome = handler
            .handle(&lifecycle_message("ObjectRemoved:Delete", "photo.png"))
            .await;

        assert!(matches!(outcome, Outcome::Accepted));
        assert_eq!(catalog.len(), 0);
    }

    #[tokio::test]
    async fn test_removed_missing_record_is_not_an_error() {
        let catalog = Arc::new(MemoryCatalog::new());
        let status = Arc::new(RecordingStatusPublisher::new());
        let handler = handler(catalog.clone(), status.clone(), None);

        let outcome = handler
            .handle(&lifecycle_message("ObjectRemoved:Delete", "never-seen.png"))
            .await;

        assert!(matches!(outcome, Outcome::Accepted));
        assert_eq!(catalog.len(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_is_retryable() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.fail_next_ops(true);
        let status = Arc::new(RecordingStatusPublisher::new());
        let handler = handler(catalog.clone(), status.clone(), None);

        let outcome = handler
            .handle(&lifecycle_message("ObjectCreated:Put", "photo.png"))
            .await;

        assert!(matches!(outcome, Outcome::Retry(_)));
        assert!(status.published().is_empty());
    }

    #[tokio::test]
    async fn test_status_publish_failure_is_retryable() {
        let catalog = Arc::new(MemoryCatalog::new());
        let status = Arc::new(RecordingStatusPublisher::new());
        status.fail.store(true, Ordering::SeqCst);
        let handler = handler(catalog.clone(), status.clone(), None);

        let outcome = handler
            .handle(&lifecycle_message("ObjectCreated:Put", "photo.png"))
            .await;

        assert!(matches!(outcome, Outcome::Retry(_)));
    }

    #[tokio::test]
    async fn test_content_type_mismatch_rejects() {
        let catalog = Arc::new(MemoryCatalog::new());
        let status = Arc::new(RecordingStatusPublisher::new());
        let probe: Arc<dyn ObjectProbe> = Arc::new(FixedProbe {
            content_type: Some("application/pdf".to_string()),
            fail: false,
        });
        let handler = handler(catalog.clone(), status.clone(), Some(probe));

        let outcome = handler
            .handle(&lifecycle_message("ObjectCreated:Put", "photo.png"))
            .await;

        assert!(matches!(outcome, Outcome::Rejected(_)));
        assert_eq!(catalog.len(), 0);

        let published = status.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].upload_status, UploadStatus::Failure);
        assert!(published[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("application/pdf"));
    }

    #[tokio::test]
    async fn test_content_type_match_admits() {
        let catalog = Arc::new(MemoryCatalog::new());
        let status = Arc::new(RecordingStatusPublisher::new());
        let probe: Arc<dyn ObjectProbe> = Arc::new(FixedProbe {
            content_type: Some("image/png".to_string()),
            fail: false,
        });
        let handler = handler(catalog.clone(), status.clone(), Some(probe));

        let outcome = handler
            .handle(&lifecycle_message("ObjectCreated:Put", "photo.png"))
            .await;

        assert!(matches!(outcome, Outcome::Accepted));
        assert!(catalog.record("photo.png").is_some());
    }

    #[tokio::test]
    async fn test_probe_failure_is_retryable() {
        let catalog = Arc::new(MemoryCatalog::new());
        let status = Arc::new(RecordingStatusPublisher::new());
        let probe: Arc<dyn ObjectProbe> = Arc::new(FixedProbe {
            content_type: None,
            fail: true,
        });
        let handler = handler(catalog.clone(), status.clone(), Some(probe));

        let outcome = handler
            .handle(&lifecycle_message("ObjectCreated:Put", "photo.png"))
            .await;

        assert!(matches!(outcome, Outcome::Retry(_)));
        assert_eq!(catalog.len(), 0);
        assert!(status.published().is_empty());
    }

    #[tokio::test]
    async fn test_escaped_key_is_decoded_before_storing() {
        let catalog = Arc::new(MemoryCatalog::new());
        let status = Arc::new(RecordingStatusPublisher::new());
        let handler = handler(catalog.clone(), status.clone(), None);

        handler
            .handle(&lifecycle_message("ObjectCreated:Put", "my+photo+%281%29.png"))
            .await;

        assert!(catalog.record("my photo (1).png").is_some());
    }

    #[tokio::test]
    async fn test_malformed_envelope_is_rejected() {
        let catalog = Arc::new(MemoryCatalog::new());
        let status = Arc::new(RecordingStatusPublisher::new());
        let handler = handler(catalog.clone(), status.clone(), None);

        let outcome = handler.handle(&incoming(b"not json".to_vec(), &[])).await;

        assert!(matches!(outcome, Outcome::Rejected(_)));
        assert_eq!(catalog.len(), 0);
        assert!(status.published().is_empty());
    }
}
