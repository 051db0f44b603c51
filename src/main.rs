//! Anomaly Detection Pipeline - Main Entry Point
//!
//! Wires the poller fleet, event queue, stream processor, and reporters
//! together and runs until interrupted.

use anyhow::{Context, Result};
use github_anomaly_pipeline::{
    config::AppConfig,
    history::ActivityTracker,
    poller::{ratelimit::RateLimitCache, Poller},
    processor::StreamProcessor,
    profiles::ProfileStore,
    pubsub::AnomalyPublisher,
    queue::EventQueue,
    sink::DetectionSink,
    stats::{MetricsReporter, PipelineMetrics},
    storage,
    summarizer::NoopSummarizer,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(AppConfig::load()?);

    init_logging(&config);
    info!("Starting anomaly detection pipeline");
    info!(
        batch_max = config.pipeline.batch_max,
        report_floor = config.pipeline.report_floor,
        active_pollers = config.upstream.active_pollers,
        "Configuration loaded"
    );

    // Storage and profiles.
    let pool = storage::open_pool(&config.storage.db_path)
        .context("Failed to open the pipeline database")?;
    let store = Arc::new(ProfileStore::new(
        pool.clone(),
        config.storage.profile_cache_entries,
        config.detection.mvn_n,
    ));
    let sink = DetectionSink::new(pool);

    // Messaging.
    let client = async_nats::connect(&config.nats.url)
        .await
        .context("Failed to connect to NATS")?;
    info!(url = %config.nats.url, "Connected to NATS");

    let queue = EventQueue::connect(client.clone(), &config.nats).await?;
    let publisher = AnomalyPublisher::new(client.clone());

    let metrics = Arc::new(PipelineMetrics::new());
    let tracker = Arc::new(ActivityTracker::new());
    let cancel = CancellationToken::new();

    let mut tasks = Vec::new();

    // Poller fleet sharing the upstream quota.
    for index in 0..config.upstream.active_pollers {
        let jetstream = async_nats::jetstream::new(client.clone());
        let cache = RateLimitCache::open(
            &jetstream,
            &config.nats.ratelimit_bucket,
            &config.upstream.region,
        )
        .await?;
        let poller = Poller::new(index, config.clone(), queue.clone(), cache, metrics.clone())?;
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move { poller.run(cancel).await }));
    }

    // Stream processor.
    let processor = Arc::new(StreamProcessor::new(
        config.clone(),
        store.clone(),
        tracker.clone(),
        sink,
        publisher,
        metrics.clone(),
        Arc::new(NoopSummarizer),
    ));
    let consumer = queue.consumer(&config.nats.event_stream).await?;
    {
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = processor.run(consumer, cancel).await {
                warn!(error = %e, "Stream processor exited with error");
            }
        }));
    }

    // Metrics reporter.
    {
        let reporter = MetricsReporter::new(metrics.clone(), config.pipeline.stats_interval_secs);
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(reporter.run(cancel)));
    }

    // Periodic maintenance: stale profiles and window sweeping.
    {
        let store = store.clone();
        let tracker = tracker.clone();
        let ttl_days = config.storage.profile_ttl_days;
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        tracker.sweep(chrono::Utc::now());
                        if let Err(e) = store.purge_stale(ttl_days).await {
                            warn!(error = %e, "Profile purge failed");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested, draining");
    cancel.cancel();

    for task in tasks {
        let _ = task.await;
    }

    info!("Pipeline stopped");
    Ok(())
}

fn init_logging(config: &AppConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "github_anomaly_pipeline={}",
            config.logging.level
        ))
    });

    if config.logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
