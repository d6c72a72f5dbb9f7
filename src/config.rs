use crate::consumer::ConsumerSettings;
use rdkafka::config::ClientConfig;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the ingestion service.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka configuration
    pub kafka: KafkaConfig,
    /// Topic names
    #[serde(default)]
    pub topics: TopicsConfig,
    /// Batch-driver tuning
    #[serde(default)]
    pub consumer: ConsumerTuning,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Notification mailer configuration
    #[serde(default)]
    pub mailer: MailerConfig,
    /// Object-store probe configuration
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    /// Admission policy
    #[serde(default)]
    pub admission: AdmissionConfig,
}

/// Service-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Kafka connection configuration, shared by every consumer and the
/// producer.
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Prefix for consumer group IDs
    #[serde(default = "default_group_prefix")]
    pub group_prefix: String,
    /// Enable SSL
    #[serde(default)]
    pub ssl_enabled: bool,
    /// SSL CA certificate path
    pub ssl_ca_location: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
    /// Auto offset reset policy
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    /// Max poll interval in milliseconds
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,
    /// Produce request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl KafkaConfig {
    /// Base rdkafka client configuration: brokers plus transport security.
    pub fn base_client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();

        client_config.set("bootstrap.servers", &self.bootstrap_servers);

        if self.ssl_enabled {
            client_config.set("security.protocol", "SASL_SSL");
            if let Some(ref ca_location) = self.ssl_ca_location {
                client_config.set("ssl.ca.location", ca_location);
            }
        }

        if let (Some(ref username), Some(ref password)) =
            (&self.sasl_username, &self.sasl_password)
        {
            client_config
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        client_config
    }

    /// Produce request timeout as a Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Consumer group ID for a named consumer.
    pub fn group_id(&self, consumer: &str) -> String {
        format!("{}-{}", self.group_prefix, consumer)
    }
}

/// Topic names used by the pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct TopicsConfig {
    /// Object-lifecycle events from the upload bucket
    #[serde(default = "default_uploads_topic")]
    pub uploads: String,
    /// Upload-status events feeding the status notifier
    #[serde(default = "default_status_topic")]
    pub status: String,
    /// Metadata-change events
    #[serde(default = "default_metadata_topic")]
    pub metadata: String,
    /// Dead-letter topic drained by the escalation handler
    #[serde(default = "default_dead_letter_topic")]
    pub dead_letter: String,
}

/// Batch-driver tuning shared by all consumers.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerTuning {
    /// Maximum messages per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Batching window in seconds once the first message arrived
    #[serde(default = "default_batch_window_secs")]
    pub batch_window_secs: u64,
    /// Wall-clock budget for one batch in seconds
    #[serde(default = "default_batch_budget_secs")]
    pub batch_budget_secs: u64,
    /// Delivery attempts before dead-lettering
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
}

/// Database configuration for the catalog store.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// Notification mailer configuration. Source and destination are optional;
/// when unset, mail-sending consumers drop events with a logged warning
/// instead of crashing or retrying.
#[derive(Debug, Clone, Deserialize)]
pub struct MailerConfig {
    /// Region for the notification service
    #[serde(default = "default_mailer_region")]
    pub region: String,
    /// Sender address
    pub source: Option<String>,
    /// Operator address notified of upload results
    pub destination: Option<String>,
}

/// Object-store configuration, used only by the content-type probe.
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectStoreConfig {
    /// Object-store region
    #[serde(default = "default_object_store_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// Admission policy.
#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    /// File extensions accepted for upload
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    /// Also verify the object's declared content type against its extension
    #[serde(default)]
    pub verify_content_type: bool,
}

// Default value functions
fn default_service_name() -> String {
    "gallery-ingestion".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_group_prefix() -> String {
    "gallery-ingestion".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_max_poll_interval_ms() -> u32 {
    300000
}

fn default_request_timeout_ms() -> u64 {
    30000
}

fn default_uploads_topic() -> String {
    "gallery.uploads".to_string()
}

fn default_status_topic() -> String {
    "gallery.uploads.status".to_string()
}

fn default_metadata_topic() -> String {
    "gallery.images.metadata".to_string()
}

fn default_dead_letter_topic() -> String {
    "gallery.uploads.dlq".to_string()
}

fn default_batch_size() -> usize {
    5
}

fn default_batch_window_secs() -> u64 {
    5
}

fn default_batch_budget_secs() -> u64 {
    15
}

fn default_max_delivery_attempts() -> u32 {
    3
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    true
}

fn default_mailer_region() -> String {
    "eu-west-1".to_string()
}

fn default_object_store_region() -> String {
    "us-east-1".to_string()
}

fn default_allowed_extensions() -> Vec<String> {
    vec!["jpeg".to_string(), "png".to_string()]
}

impl Config {
    /// Load configuration from environment and config files.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/ingestion").required(false))
            .add_source(config::File::with_name("/etc/gallery/ingestion").required(false))
            // Override with environment variables:
            // INGESTION__KAFKA__BOOTSTRAP_SERVERS -> kafka.bootstrap_servers
            .add_source(
                config::Environment::with_prefix("INGESTION")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Batch-driver settings for the consumer runners.
    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            batch_size: self.consumer.batch_size,
            batch_window: Duration::from_secs(self.consumer.batch_window_secs),
            batch_budget: Duration::from_secs(self.consumer.batch_budget_secs),
            max_delivery_attempts: self.consumer.max_delivery_attempts,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            uploads: default_uploads_topic(),
            status: default_status_topic(),
            metadata: default_metadata_topic(),
            dead_letter: default_dead_letter_topic(),
        }
    }
}

impl Default for ConsumerTuning {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_window_secs: default_batch_window_secs(),
            batch_budget_secs: default_batch_budget_secs(),
            max_delivery_attempts: default_max_delivery_attempts(),
        }
    }
}

impl Default for MailerConfig {
    fn default() -> Self {
        Self {
            region: default_mailer_region(),
            source: None,
            destination: None,
        }
    }
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            region: default_object_store_region(),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            allowed_extensions: default_allowed_extensions(),
            verify_content_type: false,
        }
    }
}
