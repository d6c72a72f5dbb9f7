//! Gallery ingestion - event-driven image ingestion and notification
//! pipeline for the photo catalog.
//!
//! Four independent consumers react to messages from the upload bucket's
//! fan-out topic and its companion topics:
//!
//! - Admission: validates uploads and keeps the catalog in step with the
//!   bucket
//! - Metadata: applies photographer-supplied field updates
//! - Status notifier: emails the operator about upload results
//! - Escalation: drains the dead-letter topic after exhausted retries
//!
//! All consumers share the same batch driver ([`consumer::ConsumerRunner`])
//! and the same delivery semantics: at-least-once, idempotent store
//! mutations, a bounded delivery-attempt budget, then the dead-letter path.

pub mod admission;
pub mod catalog;
pub mod config;
pub mod consumer;
pub mod escalation;
pub mod events;
pub mod mailer;
pub mod metadata;
pub mod object_probe;
pub mod producer;
pub mod status;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export main types
pub use admission::AdmissionHandler;
pub use catalog::{Catalog, CatalogError, FieldUpdate, ImageStatus, MetadataField, PgCatalog};
pub use config::Config;
pub use consumer::{
    BatchHandler, ConsumerError, ConsumerRunner, ConsumerSettings, IncomingMessage, Outcome,
};
pub use escalation::EscalationHandler;
pub use events::{StatusEvent, UploadEvent, UploadStatus};
pub use mailer::{MailerError, Notification, NotificationSink, SesMailer};
pub use metadata::MetadataHandler;
pub use object_probe::{ObjectProbe, S3Probe};
pub use producer::{EventProducer, ProducerError, StatusPublisher};
pub use status::StatusHandler;
