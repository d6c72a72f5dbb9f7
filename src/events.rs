//! Wire formats for the ingestion pipeline.
//!
//! Three inbound envelopes arrive over the message layer: object-lifecycle
//! notifications (wrapped in a fan-out `Message` field), metadata-change
//! payloads (field name carried as a message header), and upload-status
//! events. The dead-letter notice is produced by the batch driver when a
//! message exhausts its delivery budget.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Message header carrying the metadata field name on the metadata topic.
pub const METADATA_TYPE_HEADER: &str = "metadata_type";

/// Message header counting delivery attempts across redeliveries.
pub const DELIVERY_ATTEMPT_HEADER: &str = "delivery-attempt";

/// Errors raised while decoding inbound envelopes.
///
/// These are validation-class failures: a malformed envelope is rejected
/// outright rather than half-parsed.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unsupported event name: {0}")]
    UnsupportedEvent(String),
}

/// Fan-out wrapper around an object-store notification.
///
/// The topic layer wraps the notification JSON in a `Message` field, so the
/// inner document has to be parsed in a second step.
#[derive(Debug, Clone, Deserialize)]
pub struct TopicEnvelope {
    #[serde(rename = "Message")]
    pub message: String,
}

/// Object-store notification carried inside the fan-out wrapper.
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectNotification {
    #[serde(rename = "Records", default)]
    pub records: Vec<ObjectRecord>,
}

/// A single object-lifecycle record.
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectRecord {
    #[serde(rename = "eventName")]
    pub event_name: String,
    pub s3: ObjectEntity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectEntity {
    pub bucket: BucketRef,
    pub object: ObjectRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BucketRef {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectRef {
    /// URL-encoded object key; `+` represents a space.
    pub key: String,
}

/// Kind of object-lifecycle event, derived from the record's event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Removed,
}

impl EventKind {
    /// Classify an object-store event name.
    ///
    /// Event names are prefixed families, e.g. `ObjectCreated:Put` or
    /// `ObjectRemoved:Delete`.
    pub fn from_event_name(name: &str) -> Result<Self, EnvelopeError> {
        if name.starts_with("ObjectCreated") {
            Ok(EventKind::Created)
        } else if name.starts_with("ObjectRemoved") {
            Ok(EventKind::Removed)
        } else {
            Err(EnvelopeError::UnsupportedEvent(name.to_string()))
        }
    }
}

/// A decoded upload event, ready for admission.
#[derive(Debug, Clone)]
pub struct UploadEvent {
    /// Literal object key with transport escaping reversed.
    pub key: String,
    /// Bucket the object lives in.
    pub bucket: String,
    pub kind: EventKind,
}

impl UploadEvent {
    /// Decode a lifecycle record into an upload event.
    pub fn from_record(record: &ObjectRecord) -> Result<Self, EnvelopeError> {
        Ok(Self {
            key: decode_object_key(&record.s3.object.key),
            bucket: record.s3.bucket.name.clone(),
            kind: EventKind::from_event_name(&record.event_name)?,
        })
    }
}

/// Parse the two-stage object-lifecycle envelope from a raw message body.
pub fn parse_object_notification(payload: &[u8]) -> Result<ObjectNotification, EnvelopeError> {
    let envelope: TopicEnvelope = serde_json::from_slice(payload)?;
    let notification: ObjectNotification = serde_json::from_str(&envelope.message)?;
    Ok(notification)
}

/// Reverse transport-level escaping of an object key: `+` becomes a space,
/// then percent-escapes are decoded.
pub fn decode_object_key(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    let decoded = urlencoding::decode(&spaced).map(|cow| cow.into_owned()).ok();
    decoded.unwrap_or(spaced)
}

/// Extract the lowercased file extension: the substring after the last `.`.
pub fn file_extension(key: &str) -> Option<String> {
    let (_, ext) = key.rsplit_once('.')?;
    if ext.is_empty() {
        return None;
    }
    Some(ext.to_lowercase())
}

/// Outcome status of an upload, delivered to the Status Notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Success,
    Failure,
    /// Any value outside the known set; dropped with a warning downstream.
    Unknown,
}

impl<'de> Deserialize<'de> for UploadStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(match value.as_str() {
            "success" => UploadStatus::Success,
            "failure" => UploadStatus::Failure,
            _ => UploadStatus::Unknown,
        })
    }
}

/// Upload-result event consumed by the Status Notifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    #[serde(rename = "uploadStatus")]
    pub upload_status: UploadStatus,
    #[serde(rename = "errorMessage", skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StatusEvent {
    pub fn success() -> Self {
        Self {
            upload_status: UploadStatus::Success,
            error_message: None,
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            upload_status: UploadStatus::Failure,
            error_message: Some(reason.into()),
        }
    }
}

/// Metadata-change payload; the field name travels in the
/// [`METADATA_TYPE_HEADER`] message header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataPayload {
    /// Key of the image the update targets.
    pub id: String,
    /// New value for the addressed field.
    pub value: String,
}

/// Notice wrapped around a message that exhausted its delivery budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterNotice {
    #[serde(rename = "errorMessage")]
    pub error_message: String,
    #[serde(rename = "sourceTopic")]
    pub source_topic: String,
    #[serde(rename = "failedAt")]
    pub failed_at: DateTime<Utc>,
    /// Original message body, kept for diagnosis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lifecycle_body(event_name: &str, key: &str) -> Vec<u8> {
        let inner = serde_json::json!({
            "Records": [{
                "eventName": event_name,
                "s3": {
                    "bucket": { "name": "images" },
                    "object": { "key": key }
                }
            }]
        });
        serde_json::to_vec(&serde_json::json!({ "Message": inner.to_string() })).unwrap()
    }

    #[test]
    fn test_parse_object_notification() {
        let body = lifecycle_body("ObjectCreated:Put", "photo.png");
        let notification = parse_object_notification(&body).unwrap();

        assert_eq!(notification.records.len(), 1);
        let event = UploadEvent::from_record(&notification.records[0]).unwrap();
        assert_eq!(event.key, "photo.png");
        assert_eq!(event.bucket, "images");
        assert_eq!(event.kind, EventKind::Created);
    }

    #[test]
    fn test_parse_rejects_malformed_envelope() {
        assert!(parse_object_notification(b"not json").is_err());
        // Outer wrapper present but inner document malformed.
        let body = serde_json::to_vec(&serde_json::json!({ "Message": "{oops" })).unwrap();
        assert!(parse_object_notification(&body).is_err());
    }

    #[test]
    fn test_event_kind_classification() {
        assert_eq!(
            EventKind::from_event_name("ObjectRemoved:Delete").unwrap(),
            EventKind::Removed
        );
        assert_eq!(
            EventKind::from_event_name("ObjectCreated:CompleteMultipartUpload").unwrap(),
            EventKind::Created
        );
        assert!(EventKind::from_event_name("ObjectRestore:Post").is_err());
    }

    #[test]
    fn test_decode_object_key() {
        assert_eq!(decode_object_key("photo.png"), "photo.png");
        assert_eq!(decode_object_key("my+photo.png"), "my photo.png");
        assert_eq!(decode_object_key("my+photo+%281%29.jpeg"), "my photo (1).jpeg");
    }

    #[test]
    fn test_file_extension() {
        assert_eq!(file_extension("photo.png").as_deref(), Some("png"));
        assert_eq!(file_extension("archive.JPEG").as_deref(), Some("jpeg"));
        assert_eq!(file_extension("a.b.pdf").as_deref(), Some("pdf"));
        assert_eq!(file_extension("no-extension"), None);
        assert_eq!(file_extension("trailing-dot."), None);
    }

    #[test]
    fn test_status_event_parsing() {
        let event: StatusEvent =
            serde_json::from_str(r#"{"uploadStatus":"failure","errorMessage":"Invalid file type: pdf"}"#)
                .unwrap();
        assert_eq!(event.upload_status, UploadStatus::Failure);
        assert_eq!(event.error_message.as_deref(), Some("Invalid file type: pdf"));

        let unknown: StatusEvent =
            serde_json::from_str(r#"{"uploadStatus":"partial"}"#).unwrap();
        assert_eq!(unknown.upload_status, UploadStatus::Unknown);
    }

    #[test]
    fn test_metadata_payload_parsing() {
        let payload: MetadataPayload =
            serde_json::from_str(r#"{"id":"photo.png","value":"Jane Doe"}"#).unwrap();
        assert_eq!(payload.id, "photo.png");
        assert_eq!(payload.value, "Jane Doe");
    }
}
