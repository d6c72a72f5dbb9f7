//! Metadata consumer: applies photographer-supplied field updates to
//! catalog records.
//!
//! The field name travels in the `metadata_type` message header and must be
//! one of the enumerated fields; anything else is dropped without touching
//! the store. An update addressed to a record that does not exist is a
//! terminal no-op.

use crate::catalog::{Catalog, FieldUpdate, MetadataField};
use crate::consumer::{BatchHandler, IncomingMessage, Outcome};
use crate::events::{MetadataPayload, METADATA_TYPE_HEADER};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Consumer for metadata-change events.
pub struct MetadataHandler {
    catalog: Arc<dyn Catalog>,
}

impl MetadataHandler {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl BatchHandler for MetadataHandler {
    fn name(&self) -> &'static str {
        "metadata"
    }

    async fn handle(&self, message: &IncomingMessage) -> Outcome {
        let Some(field_name) = message.header(METADATA_TYPE_HEADER) else {
            return Outcome::Rejected("missing metadata_type attribute".to_string());
        };

        let Some(field) = MetadataField::parse(field_name) else {
            metrics::counter!("ingestion.metadata.invalid_field").increment(1);
            return Outcome::Rejected(format!("Invalid metadata type: {}", field_name));
        };

        let payload: MetadataPayload = match message.decode_json() {
            Ok(payload) => payload,
            Err(e) => return Outcome::Rejected(format!("malformed metadata payload: {}", e)),
        };

        match self
            .catalog
            .set_metadata_field(&payload.id, field, &payload.value)
            .await
        {
            Ok(FieldUpdate::Applied) => {
                info!(image = %payload.id, field = field.as_str(), "Metadata updated");
                Outcome::Accepted
            }
            Ok(FieldUpdate::NoSuchImage) => {
                // No record to update; the message is consumed rather than
                // retried, since redelivery cannot make the record appear.
                warn!(image = %payload.id, field = field.as_str(), "Metadata update for unknown image dropped");
                metrics::counter!("ingestion.metadata.unknown_image").increment(1);
                Outcome::Accepted
            }
            Err(e) => Outcome::Retry(anyhow::Error::new(e).context("updating catalog metadata")),
        }
    }
}
