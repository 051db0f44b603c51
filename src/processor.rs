//! Stream processor: batching, actor lanes, parallel detection, fusion.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::detectors::{
    behavioral, BehavioralDetector, ContentDetector, ContextualDetector, DetectionInput, Detector,
    TemporalDetector,
};
use crate::fuser::{FusedScore, ScoreFuser};
use crate::history::ActivityTracker;
use crate::profiles::ProfileStore;
use crate::pubsub::{AnomalyPublisher, BatchStats, DroppedByPriority};
use crate::queue::{QueueConsumer, QueuedEvent};
use crate::sink::DetectionSink;
use crate::stats::PipelineMetrics;
use crate::summarizer::Summarizer;
use crate::types::{
    AnomalyRecord, DetectorOutput, Priority, RawEvent, SeverityLevel,
};

/// Pre-filter bounds: an actor this established doing something this routine
/// skips full scoring (low priority only).
const PREFILTER_MIN_SAMPLES: u64 = 50;
const PREFILTER_MIN_TYPE_SHARE: f64 = 0.20;

/// Consumes the event queue, drives the detectors, fuses, persists, publishes.
pub struct StreamProcessor {
    config: Arc<AppConfig>,
    store: Arc<ProfileStore>,
    tracker: Arc<ActivityTracker>,
    sink: DetectionSink,
    publisher: AnomalyPublisher,
    metrics: Arc<PipelineMetrics>,
    summarizer: Arc<dyn Summarizer>,

    behavioral: Arc<BehavioralDetector>,
    temporal: Arc<TemporalDetector>,
    content: Arc<ContentDetector>,
    contextual: Arc<ContextualDetector>,
    fuser: ScoreFuser,
}

impl StreamProcessor {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<ProfileStore>,
        tracker: Arc<ActivityTracker>,
        sink: DetectionSink,
        publisher: AnomalyPublisher,
        metrics: Arc<PipelineMetrics>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        let d = &config.detection;
        Self {
            behavioral: Arc::new(BehavioralDetector::new(d.warm_n, d.mvn_n)),
            temporal: Arc::new(TemporalDetector::new(
                d.burst_window_min,
                d.burst_min_count,
                d.burst_min_rate,
                d.coord_window_min,
                d.coord_min_actors,
                d.coord_min_events,
            )),
            content: Arc::new(ContentDetector::new()),
            contextual: Arc::new(ContextualDetector::new()),
            fuser: ScoreFuser::new(),
            config,
            store,
            tracker,
            sink,
            publisher,
            metrics,
            summarizer,
        }
    }

    /// Main consume loop; returns only on cancellation or a fatal error.
    pub async fn run(
        self: Arc<Self>,
        consumer: QueueConsumer,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!(
            batch_max = self.config.pipeline.batch_max,
            worker_lanes = self.config.pipeline.worker_lanes,
            "Stream processor started"
        );

        let batch_wait = Duration::from_millis(self.config.pipeline.batch_max_wait_ms);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let fetched = tokio::select! {
                result = consumer.fetch(self.config.pipeline.batch_max, batch_wait) => result,
                _ = cancel.cancelled() => break,
            };

            let (batch, corrupt) = match fetched {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "Batch fetch failed, backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if corrupt > 0 && self.metrics.record_corrupt("undecodable_message") {
                warn!(corrupt, "Dropped undecodable queue messages");
            }

            if batch.is_empty() {
                continue;
            }

            self.process_batch(batch).await;
        }

        info!("Stream processor stopped");
        Ok(())
    }

    /// Process one batch atomically end to end, then publish its stats.
    async fn process_batch(self: &Arc<Self>, batch: Vec<QueuedEvent>) {
        let batch_size = batch.len() as u64;
        let anomalies_before = self.metrics.anomalies_detected.load(Ordering::Relaxed);
        let timeouts_before = self.metrics.detector_timeouts.load(Ordering::Relaxed);

        // Shard onto lanes by actor id: strict FIFO per actor, no ordering
        // across lanes.
        let lane_count = self.config.pipeline.worker_lanes;
        let mut lanes: Vec<Vec<QueuedEvent>> = (0..lane_count).map(|_| Vec::new()).collect();
        for queued in batch {
            let lane = (queued.event.actor.id.unsigned_abs() as usize) % lane_count;
            lanes[lane].push(queued);
        }

        let work = futures::future::join_all(lanes.into_iter().filter(|l| !l.is_empty()).map(
            |lane| {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    for queued in lane {
                        this.process_queued(queued).await;
                    }
                })
            },
        ));

        let deadline = Duration::from_millis(self.config.pipeline.batch_timeout_ms);
        if timeout(deadline, work).await.is_err() {
            warn!("Batch deadline exceeded, moving on");
        }

        let (low, medium) = self.metrics.dropped();
        let stats = BatchStats {
            events_processed: batch_size,
            anomalies_detected: self.metrics.anomalies_detected.load(Ordering::Relaxed)
                - anomalies_before,
            batch_size,
            dropped_by_priority: DroppedByPriority {
                low,
                medium,
                high: 0,
            },
            detector_timeouts: self.metrics.detector_timeouts.load(Ordering::Relaxed)
                - timeouts_before,
        };
        if let Err(e) = self.publisher.publish_stats(&stats).await {
            debug!(error = %e, "Failed to publish batch stats");
        }
    }

    /// Per-event deadline wrapper deciding ack vs redeliver.
    async fn process_queued(&self, queued: QueuedEvent) {
        let started = Instant::now();
        let event_deadline = Duration::from_millis(self.config.pipeline.event_timeout_ms);

        match timeout(event_deadline, self.process_event(&queued.event)).await {
            Ok(Ok(final_score)) => {
                self.metrics.record_event(started.elapsed(), final_score);
                if let Err(e) = queued.ack().await {
                    warn!(event_id = %queued.event.id, error = %e, "Ack failed");
                }
            }
            Ok(Err(e)) => {
                // Transient store failure: leave unacked so at-least-once
                // delivery re-consumes the event.
                warn!(event_id = %queued.event.id, error = %e, "Event processing failed, will redeliver");
            }
            Err(_) => {
                warn!(event_id = %queued.event.id, "Event deadline exceeded");
                self.metrics.record_event(started.elapsed(), 0.0);
                if let Err(e) = queued.ack().await {
                    warn!(event_id = %queued.event.id, error = %e, "Ack failed");
                }
            }
        }
    }

    /// The per-event pipeline; returns the final fused score.
    async fn process_event(&self, event: &RawEvent) -> Result<f64> {
        let ts = event.timestamp;
        let payload = event.typed_payload();

        let user = self.store.get_user(event.actor.id, &event.actor.login, ts).await;

        // Window bookkeeping first so the current event is part of its own
        // windows.
        self.tracker.record(event, &payload);
        let actor_events = self
            .tracker
            .actor_window(event.actor.id, ts - ChronoDuration::hours(24));
        let repo_events = self
            .tracker
            .repo_window(event.repository.id, ts - ChronoDuration::hours(1));
        let features = behavioral::extract_features(ts, &actor_events);

        // Cheap pre-filter: a well-established actor doing something routine
        // skips full scoring. Never applied above low priority.
        if event.priority == Priority::Low
            && user.sample_count >= PREFILTER_MIN_SAMPLES
            && user.type_share(&event.kind) >= PREFILTER_MIN_TYPE_SHARE
        {
            self.metrics.prefiltered.fetch_add(1, Ordering::Relaxed);
            self.sink.persist_event(event).await?;
            self.update_profiles(event, &features, 0.0).await?;
            return Ok(0.0);
        }

        let repo = self
            .store
            .get_repo(event.repository.id, &event.repository.full_name, ts)
            .await;

        let input = Arc::new(DetectionInput {
            event: event.clone(),
            payload,
            user,
            repo,
            actor_events,
            repo_events,
            behavioral_features: features.clone(),
        });

        // All four detectors run concurrently, each under its own deadline.
        let behavioral: Arc<dyn Detector> = self.behavioral.clone();
        let temporal: Arc<dyn Detector> = self.temporal.clone();
        let content: Arc<dyn Detector> = self.content.clone();
        let contextual: Arc<dyn Detector> = self.contextual.clone();
        let (b, t, c, r) = tokio::join!(
            self.run_detector(behavioral, input.clone()),
            self.run_detector(temporal, input.clone()),
            self.run_detector(content, input.clone()),
            self.run_detector(contextual, input.clone()),
        );

        let fused = self.fuser.fuse(b.score, t.score, c.score, r.score);

        // The event itself is persisted exactly once regardless of outcome.
        self.sink.persist_event(event).await?;

        if fused.final_score >= self.config.pipeline.report_floor {
            let mut record = build_record(event, &b, &t, &c, &r, &fused);
            if matches!(
                fused.severity,
                SeverityLevel::High | SeverityLevel::Critical
            ) {
                record.ai_summary = self.summarizer.summarize(&record).await;
            }

            // Only the insert that wins publishes; duplicates from
            // at-least-once delivery stay silent.
            if self.sink.persist_anomaly(&record).await? {
                self.sink.persist_patterns(&event.id, &t.patterns).await?;
                self.metrics.record_anomaly(fused.severity);
                if let Err(e) = self
                    .publisher
                    .publish(&record, event.actor.id, event.repository.id)
                    .await
                {
                    warn!(event_id = %event.id, error = %e, "Anomaly publish failed");
                }
            }
        }

        self.update_profiles(event, &features, r.score).await?;

        Ok(fused.final_score)
    }

    /// Baseline updates run strictly after detection.
    async fn update_profiles(
        &self,
        event: &RawEvent,
        features: &[f64],
        criticality: f64,
    ) -> Result<()> {
        let ts = event.timestamp;
        let alpha = self.config.detection.ewma_alpha;

        self.store
            .upsert_user(
                event.actor.id,
                &event.actor.login,
                features,
                &event.kind,
                ts,
                alpha,
            )
            .await?;

        let mut repo = self
            .store
            .touch_repo(
                event.repository.id,
                &event.repository.full_name,
                ts,
                event.actor.id,
                &event.kind,
                alpha,
            )
            .await?;

        if criticality > 0.0 && repo.cached_criticality(ts).is_none() {
            repo.set_criticality(criticality, ts);
            self.store
                .cache_repo_criticality(event.repository.id, &repo, ts)
                .await?;
        }

        Ok(())
    }

    /// Run one detector on its own blocking task under the detector deadline.
    async fn run_detector(
        &self,
        detector: Arc<dyn Detector>,
        input: Arc<DetectionInput>,
    ) -> DetectorOutput {
        let name = detector.name();
        let deadline = Duration::from_millis(self.config.pipeline.detector_timeout_ms);
        let handle = tokio::task::spawn_blocking(move || detector.analyze(&input));

        match timeout(deadline, handle).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(detector = name, error = %e, "Detector panicked");
                DetectorOutput::degraded("panic")
            }
            Err(_) => {
                self.metrics.record_detector_timeout();
                warn!(detector = name, "Detector timed out");
                DetectorOutput::degraded("timeout")
            }
        }
    }
}

/// Assemble the persisted record from the detector outputs.
fn build_record(
    event: &RawEvent,
    behavioral: &DetectorOutput,
    temporal: &DetectorOutput,
    content: &DetectorOutput,
    contextual: &DetectorOutput,
    fused: &FusedScore,
) -> AnomalyRecord {
    let high_risk_indicators = ContentDetector::high_risk_indicators(&content.anomalies);

    AnomalyRecord {
        event_id: event.id.clone(),
        repository_name: event.repository.full_name.clone(),
        user_login: event.actor.login.clone(),
        event_type: event.kind.as_str().to_string(),
        timestamp: event.timestamp,
        behavioral_anomaly_score: behavioral.score,
        content_risk_score: content.score,
        temporal_anomaly_score: temporal.score,
        repository_criticality_score: contextual.score,
        final_anomaly_score: fused.final_score,
        severity_level: fused.severity,
        primary_method: fused.primary_method,
        behavioral_analysis: serde_json::to_value(behavioral).unwrap_or_default(),
        content_analysis: serde_json::to_value(content).unwrap_or_default(),
        temporal_analysis: serde_json::to_value(temporal).unwrap_or_default(),
        repository_context: serde_json::to_value(contextual).unwrap_or_default(),
        high_risk_indicators,
        ai_summary: None,
        detection_timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Actor, DetectionMethod, EventKind, Repository};

    fn sample_event() -> RawEvent {
        RawEvent {
            id: "42".to_string(),
            kind: EventKind::Push,
            actor: Actor {
                id: 1,
                login: "octocat".to_string(),
            },
            repository: Repository {
                id: 7,
                full_name: "octocat/hello-world".to_string(),
            },
            timestamp: Utc::now(),
            payload: serde_json::json!({}),
            priority: Priority::High,
        }
    }

    #[test]
    fn test_build_record_carries_component_scores() {
        let quiet = DetectorOutput::quiet(serde_json::json!({}));
        let mut content = DetectorOutput::quiet(serde_json::json!({}));
        content.score = 0.8;
        let mut contextual = DetectorOutput::quiet(serde_json::json!({}));
        contextual.score = 0.5;

        let fused = ScoreFuser::new().fuse(0.0, 0.0, content.score, contextual.score);
        let record = build_record(&sample_event(), &quiet, &quiet, &content, &contextual, &fused);

        assert_eq!(record.content_risk_score, 0.8);
        assert_eq!(record.repository_criticality_score, 0.5);
        assert_eq!(record.primary_method, DetectionMethod::Content);
        assert_eq!(record.event_id, "42");
        assert!(record.final_anomaly_score >= 0.35);
    }

    #[test]
    fn test_degraded_detector_marks_record() {
        let quiet = DetectorOutput::quiet(serde_json::json!({}));
        let degraded = DetectorOutput::degraded("timeout");
        let fused = ScoreFuser::new().fuse(0.0, 0.0, 0.5, 0.0);

        let record = build_record(&sample_event(), &degraded, &quiet, &quiet, &quiet, &fused);
        assert_eq!(record.behavioral_analysis["degraded"], true);
        assert_eq!(record.behavioral_analysis["explanation"]["error"], "timeout");
    }
}
