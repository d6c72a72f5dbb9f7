//! In-memory fakes for the injected dependencies, shared by the consumer
//! test modules.

use crate::catalog::{Catalog, CatalogError, FieldUpdate, ImageStatus, MetadataField};
use crate::consumer::{IncomingMessage, MessageMetadata};
use crate::events::StatusEvent;
use crate::mailer::{MailerError, Notification, NotificationSink};
use crate::object_probe::{ObjectProbe, ProbeError};
use crate::producer::{ProducerError, StatusPublisher};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// A catalog record as held by the in-memory fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeRecord {
    pub uploaded_at: DateTime<Utc>,
    pub status: String,
    pub metadata: HashMap<String, String>,
}

/// In-memory catalog with the same idempotency semantics as the Postgres
/// store: upsert keeps the first write, delete is a no-op on missing keys,
/// field updates touch only the addressed field.
#[derive(Default)]
pub struct MemoryCatalog {
    pub records: Mutex<HashMap<String, FakeRecord>>,
    pub fail: AtomicBool,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_ops(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn record(&self, key: &str) -> Option<FakeRecord> {
        self.records.lock().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn insert(&self, key: &str, record: FakeRecord) {
        self.records.lock().unwrap().insert(key.to_string(), record);
    }

    fn check_available(&self) -> Result<(), CatalogError> {
        if self.fail.load(Ordering::SeqCst) {
            Err(CatalogError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn upsert_image(
        &self,
        key: &str,
        uploaded_at: DateTime<Utc>,
        status: ImageStatus,
    ) -> Result<(), CatalogError> {
        self.check_available()?;
        self.records
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_insert_with(|| FakeRecord {
                uploaded_at,
                status: status.as_str().to_string(),
                metadata: HashMap::new(),
            });
        Ok(())
    }

    async fn delete_image(&self, key: &str) -> Result<(), CatalogError> {
        self.check_available()?;
        self.records.lock().unwrap().remove(key);
        Ok(())
    }

    async fn set_metadata_field(
        &self,
        key: &str,
        field: MetadataField,
        value: &str,
    ) -> Result<FieldUpdate, CatalogError> {
        self.check_available()?;
        let mut records = self.records.lock().unwrap();
        match records.get_mut(key) {
            Some(record) => {
                record
                    .metadata
                    .insert(field.as_str().to_string(), value.to_string());
                Ok(FieldUpdate::Applied)
            }
            None => Ok(FieldUpdate::NoSuchImage),
        }
    }
}

/// Failure mode of the recording mailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailerMode {
    Ok,
    NotConfigured,
    Unavailable,
}

/// Notification sink that records everything it was asked to send.
pub struct RecordingMailer {
    pub sent: Mutex<Vec<Notification>>,
    mode: MailerMode,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::with_mode(MailerMode::Ok)
    }

    pub fn with_mode(mode: MailerMode) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            mode,
        }
    }

    pub fn sent_notifications(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingMailer {
    async fn send(&self, notification: Notification) -> Result<(), MailerError> {
        match self.mode {
            MailerMode::NotConfigured => Err(MailerError::NotConfigured),
            MailerMode::Unavailable => {
                Err(MailerError::Unavailable("injected failure".to_string()))
            }
            MailerMode::Ok => {
                self.sent.lock().unwrap().push(notification);
                Ok(())
            }
        }
    }
}

/// Status publisher that records published events.
#[derive(Default)]
pub struct RecordingStatusPublisher {
    pub events: Mutex<Vec<StatusEvent>>,
    pub fail: AtomicBool,
}

impl RecordingStatusPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<StatusEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatusPublisher for RecordingStatusPublisher {
    async fn publish_status(&self, event: &StatusEvent) -> Result<(), ProducerError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProducerError::SendError {
                topic: "gallery.uploads.status".to_string(),
                message: "injected failure".to_string(),
            });
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Probe returning a fixed content type.
pub struct FixedProbe {
    pub content_type: Option<String>,
    pub fail: bool,
}

#[async_trait]
impl ObjectProbe for FixedProbe {
    async fn content_type(&self, _bucket: &str, _key: &str) -> Result<Option<String>, ProbeError> {
        if self.fail {
            return Err(ProbeError::Unavailable("injected failure".to_string()));
        }
        Ok(self.content_type.clone())
    }
}

/// Build an incoming message from a raw payload and headers.
pub fn incoming(payload: Vec<u8>, headers: &[(&str, &str)]) -> IncomingMessage {
    IncomingMessage {
        payload,
        metadata: MessageMetadata {
            topic: "test".to_string(),
            partition: 0,
            offset: 0,
            key: None,
            timestamp: None,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        },
    }
}

/// Build an object-lifecycle message the way the fan-out topic wraps it:
/// the notification JSON nested in a `Message` field.
pub fn lifecycle_message(event_name: &str, raw_key: &str) -> IncomingMessage {
    let inner = serde_json::json!({
        "Records": [{
            "eventName": event_name,
            "s3": {
                "bucket": { "name": "images" },
                "object": { "key": raw_key }
            }
        }]
    });
    let body =
        serde_json::to_vec(&serde_json::json!({ "Message": inner.to_string() })).unwrap();
    incoming(body, &[])
}
