use anyhow::{Context, Result};
use gallery_ingestion::admission::AdmissionHandler;
use gallery_ingestion::catalog::{Catalog, PgCatalog};
use gallery_ingestion::config::Config;
use gallery_ingestion::consumer::ConsumerRunner;
use gallery_ingestion::escalation::EscalationHandler;
use gallery_ingestion::mailer::{NotificationSink, SesMailer};
use gallery_ingestion::metadata::MetadataHandler;
use gallery_ingestion::object_probe::{ObjectProbe, S3Probe};
use gallery_ingestion::producer::EventProducer;
use gallery_ingestion::status::StatusHandler;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting gallery ingestion service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let catalog = Arc::new(
        PgCatalog::new(&config.database)
            .await
            .context("Failed to initialize catalog store")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        catalog
            .run_migrations()
            .await
            .context("Failed to run catalog migrations")?;
    }

    let mailer: Arc<dyn NotificationSink> = Arc::new(SesMailer::new(&config.mailer).await);

    let producer = Arc::new(
        EventProducer::new(&config.kafka, config.topics.clone())
            .context("Failed to initialize producer")?,
    );

    let probe: Option<Arc<dyn ObjectProbe>> = if config.admission.verify_content_type {
        Some(Arc::new(S3Probe::new(&config.object_store).await))
    } else {
        None
    };

    let settings = config.consumer_settings();
    let catalog: Arc<dyn Catalog> = catalog;

    // One runner per consumer, each on its own topic and group
    let admission_runner = Arc::new(ConsumerRunner::new(
        &config.kafka,
        &config.kafka.group_id("admission"),
        &config.topics.uploads,
        producer.clone(),
        settings.clone(),
    )?);
    let status_runner = Arc::new(ConsumerRunner::new(
        &config.kafka,
        &config.kafka.group_id("status"),
        &config.topics.status,
        producer.clone(),
        settings.clone(),
    )?);
    let metadata_runner = Arc::new(ConsumerRunner::new(
        &config.kafka,
        &config.kafka.group_id("metadata"),
        &config.topics.metadata,
        producer.clone(),
        settings.clone(),
    )?);
    let escalation_runner = Arc::new(ConsumerRunner::new(
        &config.kafka,
        &config.kafka.group_id("escalation"),
        &config.topics.dead_letter,
        producer.clone(),
        settings,
    )?);

    let admission_handler = Arc::new(AdmissionHandler::new(
        catalog.clone(),
        producer.clone(),
        probe,
        &config.admission,
    ));
    let status_handler = Arc::new(StatusHandler::new(mailer.clone()));
    let metadata_handler = Arc::new(MetadataHandler::new(catalog.clone()));
    let escalation_handler = Arc::new(EscalationHandler::new(mailer.clone()));

    // Spawn consumer tasks; they run fully in parallel
    let mut tasks = Vec::new();
    {
        let runner = admission_runner.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = runner.run(admission_handler).await {
                error!(error = %e, "Admission consumer error");
            }
        }));
    }
    {
        let runner = status_runner.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = runner.run(status_handler).await {
                error!(error = %e, "Status notifier error");
            }
        }));
    }
    {
        let runner = metadata_runner.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = runner.run(metadata_handler).await {
                error!(error = %e, "Metadata consumer error");
            }
        }));
    }
    {
        let runner = escalation_runner.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = runner.run(escalation_handler).await {
                error!(error = %e, "Escalation handler error");
            }
        }));
    }

    info!("Ingestion service started");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down ingestion service");

    for runner in [
        &admission_runner,
        &status_runner,
        &metadata_runner,
        &escalation_runner,
    ] {
        runner.shutdown();
    }
    for task in tasks {
        let _ = task.await;
    }

    info!("Ingestion service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
