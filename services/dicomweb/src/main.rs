use anyhow::{Context, Result};
use static_dicomweb::{
    start_api_server, store, AppState, Config, EncodedFramePassthrough, IngestPipeline, ReadService, Repair,
};
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
        backend = ?config.storage.backend,
        "Starting static DICOMweb service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let object_store = store::open(&config.storage)
        .await
        .context("Failed to open object store")?;

    let state = AppState {
        pipeline: Arc::new(IngestPipeline::new(object_store.clone(), &config.ingest)),
        reader: Arc::new(ReadService::new(
            object_store.clone(),
            Arc::new(EncodedFramePassthrough),
        )),
        repair: Arc::new(Repair::new(object_store.clone(), &config.ingest)),
        store: object_store,
        query: config.query.clone(),
    };

    start_api_server(state, &config.api, shutdown_signal()).await?;

    info!("DICOMweb service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal, draining in-flight requests");
        }
        _ = terminate => {
            info!("Received SIGTERM signal, draining in-flight requests");
        }
    }
}
