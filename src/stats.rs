//! Performance metrics and statistics tracking for the pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::types::{Priority, SeverityLevel};

/// Metrics collector for pipeline throughput and detection quality.
pub struct PipelineMetrics {
    /// Total events processed end to end
    pub events_processed: AtomicU64,
    /// Total anomaly records persisted
    pub anomalies_detected: AtomicU64,
    /// Events rejected by the cheap pre-filter
    pub prefiltered: AtomicU64,
    /// Malformed events dropped
    pub corrupt_events: AtomicU64,
    /// Detector timeouts observed
    pub detector_timeouts: AtomicU64,
    /// Events dropped under backpressure, by priority
    dropped_low: AtomicU64,
    dropped_medium: AtomicU64,
    /// Anomalies by severity bucket
    by_severity: RwLock<HashMap<&'static str, u64>>,
    /// Per-event processing times (microseconds)
    processing_times: RwLock<Vec<u64>>,
    /// Final score distribution buckets
    score_buckets: RwLock<[u64; 10]>,
    /// Rate-limited log bookkeeping for corrupt event kinds
    corrupt_log_times: RwLock<HashMap<String, Instant>>,
    start_time: Instant,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            events_processed: AtomicU64::new(0),
            anomalies_detected: AtomicU64::new(0),
            prefiltered: AtomicU64::new(0),
            corrupt_events: AtomicU64::new(0),
            detector_timeouts: AtomicU64::new(0),
            dropped_low: AtomicU64::new(0),
            dropped_medium: AtomicU64::new(0),
            by_severity: RwLock::new(HashMap::new()),
            processing_times: RwLock::new(Vec::with_capacity(1000)),
            score_buckets: RwLock::new([0; 10]),
            corrupt_log_times: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Record a fully processed event.
    pub fn record_event(&self, processing_time: Duration, final_score: f64) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut times) = self.processing_times.write() {
            times.push(processing_time.as_micros() as u64);
            if times.len() > 10_000 {
                times.drain(0..5_000);
            }
        }

        let bucket = ((final_score * 10.0) as usize).min(9);
        if let Ok(mut buckets) = self.score_buckets.write() {
            buckets[bucket] += 1;
        }
    }

    /// Record a persisted anomaly.
    pub fn record_anomaly(&self, severity: SeverityLevel) {
        self.anomalies_detected.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut by_severity) = self.by_severity.write() {
            *by_severity.entry(severity.as_str()).or_insert(0) += 1;
        }
    }

    /// Record an event dropped under backpressure.
    pub fn record_dropped(&self, priority: Priority) {
        match priority {
            Priority::Low => self.dropped_low.fetch_add(1, Ordering::Relaxed),
            Priority::Medium => self.dropped_medium.fetch_add(1, Ordering::Relaxed),
            // High priority is never dropped; counting one would mean a bug.
            Priority::High => {
                warn!("High-priority drop recorded");
                0
            }
        };
    }

    pub fn record_detector_timeout(&self) {
        self.detector_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a corrupt event; returns true when this kind should be logged
    /// (at most once per kind per minute).
    pub fn record_corrupt(&self, kind: &str) -> bool {
        self.corrupt_events.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut times) = self.corrupt_log_times.write() {
            let now = Instant::now();
            match times.get(kind) {
                Some(last) if now.duration_since(*last) < Duration::from_secs(60) => false,
                _ => {
                    times.insert(kind.to_string(), now);
                    true
                }
            }
        } else {
            false
        }
    }

    /// Dropped counters as (low, medium).
    pub fn dropped(&self) -> (u64, u64) {
        (
            self.dropped_low.load(Ordering::Relaxed),
            self.dropped_medium.load(Ordering::Relaxed),
        )
    }

    /// Events per second since startup.
    pub fn throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.events_processed.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Processing time percentiles.
    pub fn processing_stats(&self) -> ProcessingStats {
        let times = match self.processing_times.read() {
            Ok(times) => times,
            Err(_) => return ProcessingStats::default(),
        };
        if times.is_empty() {
            return ProcessingStats::default();
        }

        let mut sorted: Vec<u64> = times.clone();
        sorted.sort_unstable();

        let count = sorted.len();
        ProcessingStats {
            count: count as u64,
            mean_us: sorted.iter().sum::<u64>() / count as u64,
            p50_us: sorted[count / 2],
            p95_us: sorted[(count as f64 * 0.95) as usize],
            p99_us: sorted[(count as f64 * 0.99) as usize],
        }
    }

    /// Log a summary of pipeline activity.
    pub fn print_summary(&self) {
        let events = self.events_processed.load(Ordering::Relaxed);
        let anomalies = self.anomalies_detected.load(Ordering::Relaxed);
        let (dropped_low, dropped_medium) = self.dropped();
        let processing = self.processing_stats();
        let by_severity = self
            .by_severity
            .read()
            .map(|m| m.clone())
            .unwrap_or_default();

        info!(
            events_processed = events,
            anomalies_detected = anomalies,
            throughput = format!("{:.1}/s", self.throughput()),
            prefiltered = self.prefiltered.load(Ordering::Relaxed),
            corrupt = self.corrupt_events.load(Ordering::Relaxed),
            detector_timeouts = self.detector_timeouts.load(Ordering::Relaxed),
            dropped_low,
            dropped_medium,
            p50_us = processing.p50_us,
            p99_us = processing.p99_us,
            "Pipeline metrics"
        );

        for (severity, count) in &by_severity {
            info!(severity, count, "Anomalies by severity");
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Processing time statistics
#[derive(Debug, Default)]
pub struct ProcessingStats {
    pub count: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

/// Periodic reporter logging metric summaries.
pub struct MetricsReporter {
    metrics: Arc<PipelineMetrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<PipelineMetrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs,
        }
    }

    /// Run until cancelled.
    pub async fn run(self, cancel: tokio_util::sync::CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs));
        loop {
            tokio::select! {
                _ = interval.tick() => self.metrics.print_summary(),
                _ = cancel.cancelled() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_and_anomaly_counters() {
        let metrics = PipelineMetrics::new();

        metrics.record_event(Duration::from_micros(120), 0.42);
        metrics.record_event(Duration::from_micros(250), 0.05);
        metrics.record_anomaly(SeverityLevel::Medium);

        assert_eq!(metrics.events_processed.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.anomalies_detected.load(Ordering::Relaxed), 1);

        let stats = metrics.processing_stats();
        assert_eq!(stats.count, 2);
        assert!(stats.mean_us >= 120);
    }

    #[test]
    fn test_corrupt_logging_rate_limited() {
        let metrics = PipelineMetrics::new();
        assert!(metrics.record_corrupt("missing_timestamp"));
        assert!(!metrics.record_corrupt("missing_timestamp"));
        assert!(metrics.record_corrupt("missing_actor"));
        assert_eq!(metrics.corrupt_events.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_dropped_by_priority() {
        let metrics = PipelineMetrics::new();
        metrics.record_dropped(Priority::Low);
        metrics.record_dropped(Priority::Low);
        metrics.record_dropped(Priority::Medium);
        assert_eq!(metrics.dropped(), (2, 1));
    }
}
