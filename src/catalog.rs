//! Catalog store: one record per admitted image, keyed by object name.
//!
//! All mutating operations are idempotent under at-least-once redelivery:
//! upsert-by-key, delete-by-key, and a per-field metadata update expression
//! that never overwrites the whole record.

use crate::config::DatabaseConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Lifecycle status of a catalog record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageStatus {
    /// Admitted, waiting for photographer-supplied metadata.
    PendingMetadata,
    Active,
    Rejected,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::PendingMetadata => "pending_metadata",
            ImageStatus::Active => "active",
            ImageStatus::Rejected => "rejected",
        }
    }
}

/// The fixed set of metadata fields a record may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataField {
    Caption,
    Date,
    Photographer,
}

impl MetadataField {
    /// Parse a field name from the wire. Names are case-sensitive; anything
    /// outside the enumerated set is rejected without mutating any record.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "Caption" => Some(MetadataField::Caption),
            "Date" => Some(MetadataField::Date),
            "Photographer" => Some(MetadataField::Photographer),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataField::Caption => "Caption",
            MetadataField::Date => "Date",
            MetadataField::Photographer => "Photographer",
        }
    }
}

/// Result of a targeted metadata update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldUpdate {
    Applied,
    /// No record exists for the addressed key; the update is a no-op.
    NoSuchImage,
}

/// Errors surfaced by the catalog store. Store-layer failures are
/// transient: callers propagate them so the delivery layer redelivers.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("catalog store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for CatalogError {
    fn from(err: sqlx::Error) -> Self {
        CatalogError::Unavailable(err.to_string())
    }
}

/// Mutating interface of the catalog, injected into consumers so tests can
/// substitute an in-memory fake.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Idempotent upsert: a replayed event leaves the record unchanged,
    /// including its original `uploaded_at`.
    async fn upsert_image(
        &self,
        key: &str,
        uploaded_at: DateTime<Utc>,
        status: ImageStatus,
    ) -> Result<(), CatalogError>;

    /// Idempotent delete: removing a non-existent record is not an error.
    async fn delete_image(&self, key: &str) -> Result<(), CatalogError>;

    /// Set exactly one metadata field, leaving all others untouched.
    async fn set_metadata_field(
        &self,
        key: &str,
        field: MetadataField,
        value: &str,
    ) -> Result<FieldUpdate, CatalogError>;
}

/// PostgreSQL-backed catalog store.
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    /// Create a catalog store with a connection pool.
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL catalog");

        Ok(Self { pool })
    }

    /// Run database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running catalog migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        Ok(())
    }

    /// Get the connection pool (for health checks).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Catalog for PgCatalog {
    #[instrument(skip(self), fields(image = %key))]
    async fn upsert_image(
        &self,
        key: &str,
        uploaded_at: DateTime<Utc>,
        status: ImageStatus,
    ) -> Result<(), CatalogError> {
        sqlx::query(
            r#"
            INSERT INTO images (image_name, uploaded_at, status, metadata)
            VALUES ($1, $2, $3, '{}'::jsonb)
            ON CONFLICT (image_name) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(uploaded_at)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        metrics::counter!("ingestion.images.upserted").increment(1);
        debug!(image = %key, status = status.as_str(), "Image record upserted");

        Ok(())
    }

    #[instrument(skip(self), fields(image = %key))]
    async fn delete_image(&self, key: &str) -> Result<(), CatalogError> {
        let result = sqlx::query("DELETE FROM images WHERE image_name = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;

        metrics::counter!("ingestion.images.deleted").increment(result.rows_affected());
        debug!(image = %key, existed = result.rows_affected() > 0, "Image record deleted");

        Ok(())
    }

    #[instrument(skip(self, value), fields(image = %key, field = field.as_str()))]
    async fn set_metadata_field(
        &self,
        key: &str,
        field: MetadataField,
        value: &str,
    ) -> Result<FieldUpdate, CatalogError> {
        // jsonb_set touches only the addressed field; concurrent updates to
        // different fields of the same record cannot lose each other.
        let result = sqlx::query(
            r#"
            UPDATE images
            SET metadata = jsonb_set(metadata, ARRAY[$2::text], to_jsonb($3::text), true)
            WHERE image_name = $1
            "#,
        )
        .bind(key)
        .bind(field.as_str())
        .bind(value)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(FieldUpdate::NoSuchImage);
        }

        metrics::counter!("ingestion.images.metadata_updated").increment(1);
        Ok(FieldUpdate::Applied)
    }
}
