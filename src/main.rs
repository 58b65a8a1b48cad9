//! Fraud Stream Pipeline - Main Entry Point
//!
//! Consumes transactions from the upstream SSE feed, scores them with the ONNX
//! classifier, reports every verdict back to the authority and serves the resulting
//! events to dashboards.

use anyhow::{Context, Result};
use fraud_stream_pipeline::{
    api::{self, AppState},
    bus::EventBus,
    config::{AppConfig, LoggingConfig},
    consumer::StreamConsumer,
    coordinator::Coordinator,
    history::HistoryRing,
    metrics::{MetricsReporter, PipelineMetrics},
    models::InferenceAdapter,
    reporter::{HttpReporter, Reporter},
    store::{MemoryStore, Store},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = AppConfig::load()?;

    // Initialize logging
    init_tracing(&config.logging)?;

    info!("Starting Fraud Stream Pipeline");
    info!(
        stream = %config.stream.url,
        reporter = %config.reporter.url,
        threshold = config.detection.threshold,
        workers = config.pipeline.workers,
        "Configuration loaded successfully"
    );

    // Initialize metrics
    let metrics = Arc::new(PipelineMetrics::new());

    // Load the classifier up front so the first transactions are not charged for it
    let inference = Arc::new(InferenceAdapter::from_config(&config));
    let warm = Arc::clone(&inference);
    let ready = tokio::task::spawn_blocking(move || warm.ensure_loaded())
        .await
        .context("Classifier warm-up task failed")?;
    if ready {
        info!(model = %config.models.model_path, "Classifier ready");
    } else {
        warn!(model = %config.models.model_path, "Running in fallback mode");
    }

    let reporter: Arc<dyn Reporter> = Arc::new(HttpReporter::new(&config.reporter)?);
    let bus = EventBus::new(config.bus.subscriber_buffer, config.bus.keepalive());
    let history = Arc::new(HistoryRing::new(config.history.capacity));
    let store: Option<Arc<dyn Store>> = if config.store.enabled {
        Some(Arc::new(MemoryStore::with_capacity(config.store.capacity)))
    } else {
        None
    };

    let mut coordinator = Coordinator::new(
        Arc::clone(&inference),
        reporter,
        bus.clone(),
        Arc::clone(&history),
        Arc::clone(&metrics),
        config.pipeline.dedupe_window,
    )
    .with_scoring_timeout(config.models.timeout())
    .with_scoring_slots(config.pipeline.workers);
    if let Some(store) = &store {
        coordinator = coordinator.with_store(Arc::clone(store));
    }
    let coordinator = Arc::new(coordinator);

    // Bounded hand-off between ingestion and processing
    let (tx, rx) = mpsc::channel(config.pipeline.channel_capacity);

    let consumer = StreamConsumer::new(&config.stream, tx.clone(), Arc::clone(&metrics))?;
    let ingestion = tokio::spawn(async move { consumer.run().await });
    let dispatcher = tokio::spawn(Arc::clone(&coordinator).run(rx, config.pipeline.workers));

    if config.pipeline.metrics_interval_secs > 0 {
        let reporter = MetricsReporter::new(Arc::clone(&metrics), config.pipeline.metrics_interval_secs);
        tokio::spawn(reporter.start());
    }

    if config.server.enabled {
        let addr = config.server.bind_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {addr}"))?;

        let state = AppState {
            history: Arc::clone(&history),
            bus: bus.clone(),
            metrics: Arc::clone(&metrics),
            inference: Arc::clone(&inference),
            store: store.clone(),
            ingest: tx.clone(),
        };

        // Live subscriptions only end once the bus is closed
        let shutdown_bus = bus.clone();
        api::serve(listener, state, async move {
            shutdown_signal().await;
            shutdown_bus.close();
        })
        .await?;
    } else {
        shutdown_signal().await;
    }

    info!("Pipeline shutting down...");
    ingestion.abort();
    drop(tx);
    bus.close();

    match tokio::time::timeout(DRAIN_TIMEOUT, dispatcher).await {
        Ok(Ok(())) => info!("In-flight transactions drained"),
        Ok(Err(e)) => error!(error = %e, "Coordinator task failed"),
        Err(_) => warn!(timeout_secs = DRAIN_TIMEOUT.as_secs(), "Gave up waiting for in-flight transactions"),
    }

    // Print final summary
    metrics.print_summary();

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(format!(
            "fraud_stream_pipeline={level},tower_http={level}",
            level = logging.level
        ))
    })?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format.as_str() {
        "json" => builder.json().init(),
        _ => builder.init(),
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
