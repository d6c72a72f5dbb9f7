//! Object-store probe for content-type verification.
//!
//! Admission can optionally cross-check an object's declared content type
//! against its file extension. The probe is the only object-store access in
//! the service, so it lives behind a trait that tests can fake.

use crate::config::ObjectStoreConfig;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::Client as S3Client;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors raised while probing an object.
#[derive(Error, Debug)]
pub enum ProbeError {
    /// The object store could not be reached. Transient: the triggering
    /// message is redelivered.
    #[error("object store unavailable: {0}")]
    Unavailable(String),
}

/// Read access to an uploaded object's declared content type.
#[async_trait]
pub trait ObjectProbe: Send + Sync {
    /// Returns the declared content type, or `None` when the object is
    /// missing or carries no content type.
    async fn content_type(&self, bucket: &str, key: &str) -> Result<Option<String>, ProbeError>;
}

/// S3-backed object probe.
pub struct S3Probe {
    client: S3Client,
}

impl S3Probe {
    pub async fn new(config: &ObjectStoreConfig) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Custom endpoint for MinIO/LocalStack.
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(region = %config.region, "Object-store probe initialized");

        Self { client }
    }
}

#[async_trait]
impl ObjectProbe for S3Probe {
    #[instrument(skip(self), fields(bucket = %bucket, key = %key))]
    async fn content_type(&self, bucket: &str, key: &str) -> Result<Option<String>, ProbeError> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(head) => {
                let content_type = head.content_type().map(String::from);
                debug!(content_type = ?content_type, "Probed object content type");
                Ok(content_type)
            }
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(None)
                } else {
                    Err(ProbeError::Unavailable(e.to_string()))
                }
            }
        }
    }
}

/// Expected content type for an allowed image extension.
pub fn content_type_for_extension(extension: &str) -> Option<&'static str> {
    match extension {
        "jpeg" | "jpg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        _ => None,
    }
}
