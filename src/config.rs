//! Configuration management for the anomaly detection pipeline

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub nats: NatsConfig,
    pub upstream: UpstreamConfig,
    pub pipeline: PipelineConfig,
    pub detection: DetectionConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// NATS connection and subject layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    /// NATS server URL
    pub url: String,
    /// JetStream stream name backing the event queue
    pub event_stream: String,
    /// Subject prefix for queued events; priority is appended
    /// (`events.high`, `events.medium`, `events.low`)
    pub event_subject_prefix: String,
    /// KV bucket used for the shared rate-limit cache
    pub ratelimit_bucket: String,
    /// Maximum messages retained in the event stream (backpressure bound)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: i64,
}

fn default_queue_capacity() -> i64 {
    100_000
}

/// Upstream events API access
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the events API
    pub api_url: String,
    /// API token; empty means unauthenticated (low quota)
    #[serde(default)]
    pub token: String,
    /// Region tag used in the shared rate-limit cache key
    #[serde(default = "default_region")]
    pub region: String,
    /// Number of poller instances sharing the quota
    #[serde(default = "default_active_pollers")]
    pub active_pollers: u32,
    /// Pages fetched per poll cycle before catch-up detection stops us
    #[serde(default = "default_max_pages")]
    pub max_pages_per_cycle: u32,
    /// Items requested per page
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_region() -> String {
    "default".to_string()
}

fn default_active_pollers() -> u32 {
    1
}

fn default_max_pages() -> u32 {
    3
}

fn default_page_size() -> u32 {
    100
}

/// Stream processor and poller runtime knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum batch size
    #[serde(default = "default_batch_max")]
    pub batch_max: usize,
    /// Maximum accumulation latency before a partial batch is processed
    #[serde(default = "default_batch_max_wait_ms")]
    pub batch_max_wait_ms: u64,
    /// Actor-sharded worker lanes inside the processor
    #[serde(default = "default_worker_lanes")]
    pub worker_lanes: usize,
    /// Per-detector deadline
    #[serde(default = "default_detector_timeout_ms")]
    pub detector_timeout_ms: u64,
    /// Per-event deadline
    #[serde(default = "default_event_timeout_ms")]
    pub event_timeout_ms: u64,
    /// Per-batch deadline
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    /// Minimum final score to persist an anomaly record
    #[serde(default = "default_report_floor")]
    pub report_floor: f64,
    /// Fraction of low-priority events kept by the sampler
    #[serde(default = "default_priority_sample_low")]
    pub priority_sample_low: f64,
    /// Seen-set TTL for poller-side deduplication
    #[serde(default = "default_dedup_ttl_min")]
    pub dedup_ttl_min: u64,
    /// How long an enqueue may block before the drop policy kicks in
    #[serde(default = "default_enqueue_block_secs")]
    pub enqueue_block_secs: u64,
    /// Metrics summary interval
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

fn default_batch_max() -> usize {
    50
}

fn default_batch_max_wait_ms() -> u64 {
    500
}

fn default_worker_lanes() -> usize {
    8
}

fn default_detector_timeout_ms() -> u64 {
    2000
}

fn default_event_timeout_ms() -> u64 {
    5000
}

fn default_batch_timeout_ms() -> u64 {
    30000
}

fn default_report_floor() -> f64 {
    0.15
}

fn default_priority_sample_low() -> f64 {
    0.20
}

fn default_dedup_ttl_min() -> u64 {
    10
}

fn default_enqueue_block_secs() -> u64 {
    5
}

fn default_stats_interval_secs() -> u64 {
    30
}

/// Detector thresholds and baseline learning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Baseline learning rate
    #[serde(default = "default_ewma_alpha")]
    pub ewma_alpha: f64,
    /// Samples before statistical scoring replaces cold-start heuristics
    #[serde(default = "default_warm_n")]
    pub warm_n: u64,
    /// Samples before the multivariate test is attempted
    #[serde(default = "default_mvn_n")]
    pub mvn_n: u64,
    /// Burst rule window in minutes
    #[serde(default = "default_burst_window_min")]
    pub burst_window_min: u64,
    /// Burst rule minimum event count
    #[serde(default = "default_burst_min_count")]
    pub burst_min_count: u64,
    /// Burst rule minimum events per minute
    #[serde(default = "default_burst_min_rate")]
    pub burst_min_rate: f64,
    /// Coordination rule window in minutes
    #[serde(default = "default_coord_window_min")]
    pub coord_window_min: u64,
    /// Coordination rule minimum distinct actors
    #[serde(default = "default_coord_min_actors")]
    pub coord_min_actors: u64,
    /// Coordination rule minimum events
    #[serde(default = "default_coord_min_events")]
    pub coord_min_events: u64,
}

fn default_ewma_alpha() -> f64 {
    0.05
}

fn default_warm_n() -> u64 {
    10
}

fn default_mvn_n() -> u64 {
    30
}

fn default_burst_window_min() -> u64 {
    5
}

fn default_burst_min_count() -> u64 {
    5
}

fn default_burst_min_rate() -> f64 {
    2.0
}

fn default_coord_window_min() -> u64 {
    10
}

fn default_coord_min_actors() -> u64 {
    3
}

fn default_coord_min_events() -> u64 {
    10
}

/// Sink and profile store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path
    pub db_path: String,
    /// Bounded LRU in front of the profile store
    #[serde(default = "default_profile_cache_entries")]
    pub profile_cache_entries: usize,
    /// Profiles idle longer than this are purged
    #[serde(default = "default_profile_ttl_days")]
    pub profile_ttl_days: u64,
}

fn default_profile_cache_entries() -> usize {
    50_000
}

fn default_profile_ttl_days() -> u64 {
    30
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl AppConfig {
    /// Load configuration from the default path, overridable by environment.
    pub fn load() -> Result<Self> {
        Self::load_from_path("config/config.toml")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let defaults =
            Config::try_from(&AppConfig::default()).context("Failed to build default config")?;

        let config = Config::builder()
            .add_source(defaults)
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(Environment::with_prefix("GAP").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot start with.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.pipeline.batch_max > 0, "batch_max must be positive");
        anyhow::ensure!(
            self.pipeline.worker_lanes > 0,
            "worker_lanes must be positive"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.pipeline.report_floor),
            "report_floor must be in [0, 1]"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.pipeline.priority_sample_low),
            "priority_sample_low must be in [0, 1]"
        );
        anyhow::ensure!(
            self.detection.ewma_alpha > 0.0 && self.detection.ewma_alpha < 1.0,
            "ewma_alpha must be in (0, 1)"
        );
        anyhow::ensure!(
            self.upstream.active_pollers > 0,
            "active_pollers must be positive"
        );
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            nats: NatsConfig {
                url: "nats://localhost:4222".to_string(),
                event_stream: "EVENTS".to_string(),
                event_subject_prefix: "events".to_string(),
                ratelimit_bucket: "ratelimit".to_string(),
                queue_capacity: default_queue_capacity(),
            },
            upstream: UpstreamConfig {
                api_url: "https://api.github.com".to_string(),
                token: String::new(),
                region: default_region(),
                active_pollers: default_active_pollers(),
                max_pages_per_cycle: default_max_pages(),
                page_size: default_page_size(),
            },
            pipeline: PipelineConfig {
                batch_max: default_batch_max(),
                batch_max_wait_ms: default_batch_max_wait_ms(),
                worker_lanes: default_worker_lanes(),
                detector_timeout_ms: default_detector_timeout_ms(),
                event_timeout_ms: default_event_timeout_ms(),
                batch_timeout_ms: default_batch_timeout_ms(),
                report_floor: default_report_floor(),
                priority_sample_low: default_priority_sample_low(),
                dedup_ttl_min: default_dedup_ttl_min(),
                enqueue_block_secs: default_enqueue_block_secs(),
                stats_interval_secs: default_stats_interval_secs(),
            },
            detection: DetectionConfig {
                ewma_alpha: default_ewma_alpha(),
                warm_n: default_warm_n(),
                mvn_n: default_mvn_n(),
                burst_window_min: default_burst_window_min(),
                burst_min_count: default_burst_min_count(),
                burst_min_rate: default_burst_min_rate(),
                coord_window_min: default_coord_window_min(),
                coord_min_actors: default_coord_min_actors(),
                coord_min_events: default_coord_min_events(),
            },
            storage: StorageConfig {
                db_path: "data/pipeline.db".to_string(),
                profile_cache_entries: default_profile_cache_entries(),
                profile_ttl_days: default_profile_ttl_days(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.nats.url, "nats://localhost:4222");
        assert_eq!(config.pipeline.batch_max, 50);
        assert_eq!(config.pipeline.batch_max_wait_ms, 500);
        assert_eq!(config.detection.ewma_alpha, 0.05);
        assert_eq!(config.pipeline.report_floor, 0.15);
        assert_eq!(config.detection.burst_min_rate, 2.0);
        assert_eq!(config.storage.profile_cache_entries, 50_000);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = AppConfig::load_from_path("/nonexistent/config.toml").unwrap();
        assert_eq!(config.pipeline.batch_max, 50);
        assert_eq!(config.detection.warm_n, 10);
    }

    #[test]
    fn test_validation_rejects_bad_alpha() {
        let mut config = AppConfig::default();
        config.detection.ewma_alpha = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_lanes() {
        let mut config = AppConfig::default();
        config.pipeline.worker_lanes = 0;
        assert!(config.validate().is_err());
    }
}
