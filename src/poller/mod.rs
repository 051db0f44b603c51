//! Rate-limit-aware poller against the upstream public events API.

pub mod dedup;
pub mod ratelimit;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::header;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::poller::dedup::DedupSet;
use crate::poller::ratelimit::{CircuitBreaker, QuotaSnapshot, RateLimitCache, TokenBucket};
use crate::queue::{EnqueueOutcome, EventQueue};
use crate::stats::PipelineMetrics;
use crate::types::{Actor, EventKind, Priority, RawEvent, Repository};

/// Consecutive failures before the circuit breaker opens.
const BREAKER_THRESHOLD: u32 = 10;

/// Breaker cool-down before the probe request.
const BREAKER_COOLDOWN: Duration = Duration::from_secs(300);

/// Duplicate saturation per cycle that means we have caught up.
const MAX_DUPLICATES_PER_CYCLE: u64 = 10;

/// Push payload commit lists are bounded before enqueueing.
const MAX_COMMITS_PER_PAYLOAD: usize = 10;

#[derive(Debug, Error)]
pub enum PollError {
    #[error("rate limited, reset at {reset_at}")]
    RateLimited { reset_at: i64 },
    #[error("upstream error: status {0}")]
    Upstream(u16),
    #[error("permanent authentication failure (status {0})")]
    Auth(u16),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// One item of the upstream events listing.
#[derive(Debug, Deserialize)]
struct ApiEvent {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    actor: ApiActor,
    repo: ApiRepo,
    created_at: DateTime<Utc>,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiActor {
    id: i64,
    login: String,
}

#[derive(Debug, Deserialize)]
struct ApiRepo {
    id: i64,
    name: String,
}

/// Fetches recent public events at the fastest rate the remote quota allows,
/// deduplicates, and enqueues each surviving event exactly once.
pub struct Poller {
    id: String,
    http: reqwest::Client,
    config: Arc<AppConfig>,
    queue: EventQueue,
    cache: RateLimitCache,
    dedup: DedupSet,
    metrics: Arc<PipelineMetrics>,
    bucket: TokenBucket,
    breaker: CircuitBreaker,
    etag: Option<String>,
    backoff_until: Option<Instant>,
    consecutive_failures: u32,
}

impl Poller {
    pub fn new(
        index: u32,
        config: Arc<AppConfig>,
        queue: EventQueue,
        cache: RateLimitCache,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("github-anomaly-pipeline/0.1")
            .timeout(Duration::from_secs(30))
            .build()?;

        let dedup_ttl = Duration::from_secs(config.pipeline.dedup_ttl_min * 60);

        Ok(Self {
            id: format!("poller-{index}"),
            http,
            queue,
            cache,
            dedup: DedupSet::new(dedup_ttl),
            metrics,
            bucket: TokenBucket::new(config.upstream.max_pages_per_cycle as f64),
            breaker: CircuitBreaker::new(BREAKER_THRESHOLD, BREAKER_COOLDOWN),
            etag: None,
            backoff_until: None,
            consecutive_failures: 0,
            config,
        })
    }

    /// Run until cancelled; the in-flight cycle always drains first.
    ///
    /// Transient failures never exit this loop. The only fatal conditions
    /// are configuration problems and permanent authentication failures.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(poller = %self.id, "Poller started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if let Some(until) = self.backoff_until {
                let now = Instant::now();
                if now < until {
                    let wait = until - now;
                    debug!(poller = %self.id, wait_secs = wait.as_secs(), "In backoff");
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
                self.backoff_until = None;
            }

            if !self.breaker.allow() {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                    _ = cancel.cancelled() => break,
                }
            }

            match self.poll_cycle().await {
                Ok(enqueued) => {
                    self.breaker.on_success();
                    self.consecutive_failures = 0;
                    if enqueued > 0 {
                        debug!(poller = %self.id, enqueued, "Cycle complete");
                    }
                }
                Err(PollError::Auth(status)) => {
                    error!(poller = %self.id, status, "Permanent authentication failure, stopping");
                    return;
                }
                Err(e) => {
                    self.breaker.on_failure();
                    self.consecutive_failures += 1;
                    self.backoff_until = Some(Instant::now() + self.backoff_for(&e));
                    warn!(
                        poller = %self.id,
                        error = %e,
                        failures = self.consecutive_failures,
                        "Poll cycle failed"
                    );
                }
            }

            let sleep = self.pacing_sleep().await;
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = cancel.cancelled() => break,
            }
        }

        info!(poller = %self.id, "Poller stopped");
    }

    /// Fetch up to `max_pages_per_cycle` pages, stopping early once caught up.
    async fn poll_cycle(&mut self) -> Result<u64, PollError> {
        let mut enqueued = 0u64;
        let mut duplicates = 0u64;

        for page in 1..=self.config.upstream.max_pages_per_cycle {
            if let Ok(Some(snapshot)) = self.cache.read().await {
                if snapshot.remaining < 50 {
                    debug!(poller = %self.id, remaining = snapshot.remaining, "Shared quota low, stopping pagination");
                    break;
                }
            }

            if !self.bucket.try_take() {
                debug!(poller = %self.id, "Token bucket empty, stopping pagination");
                break;
            }

            let events = self.fetch_page(page).await?;
            if events.is_empty() {
                break;
            }

            let page_len = events.len();
            let (page_new, page_dup) = self.ingest(events).await;
            enqueued += page_new;
            duplicates += page_dup;

            if duplicates >= MAX_DUPLICATES_PER_CYCLE {
                debug!(poller = %self.id, duplicates, "Duplicate saturation, caught up");
                break;
            }
            if page_len < self.config.upstream.page_size as usize {
                break;
            }

            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        Ok(enqueued)
    }

    /// Fetch one page, folding the quota headers into the shared cache and
    /// the local token bucket.
    async fn fetch_page(&mut self, page: u32) -> Result<Vec<ApiEvent>, PollError> {
        let url = format!("{}/events", self.config.upstream.api_url);
        let mut request = self
            .http
            .get(&url)
            .query(&[
                ("per_page", self.config.upstream.page_size),
                ("page", page),
            ])
            .header(header::ACCEPT, "application/vnd.github.v3+json");

        if !self.config.upstream.token.is_empty() {
            request = request.header(
                header::AUTHORIZATION,
                format!("token {}", self.config.upstream.token),
            );
        }
        if page == 1 {
            if let Some(etag) = &self.etag {
                request = request.header(header::IF_NONE_MATCH, etag.clone());
            }
        }

        let response = request.send().await?;
        let status = response.status().as_u16();

        let remaining = header_u64(&response, "X-RateLimit-Remaining");
        let reset_at = header_i64(&response, "X-RateLimit-Reset");
        if let (Some(remaining), Some(reset_at)) = (remaining, reset_at) {
            let snapshot = QuotaSnapshot::observed_now(remaining, reset_at);
            let share = remaining as f64 / self.config.upstream.active_pollers as f64;
            self.bucket.resize(share, snapshot.secs_until_reset());
            if let Err(e) = self.cache.publish(snapshot).await {
                debug!(error = %e, "Rate-limit cache publish failed");
            }
        }

        match status {
            200 => {
                if page == 1 {
                    self.etag = response
                        .headers()
                        .get(header::ETAG)
                        .and_then(|v| v.to_str().ok())
                        .map(String::from);
                }
                Ok(response.json().await?)
            }
            // Conditional request: nothing new, no quota spent.
            304 => Ok(Vec::new()),
            401 => Err(PollError::Auth(status)),
            403 | 429 => Err(PollError::RateLimited {
                reset_at: reset_at.unwrap_or_else(|| Utc::now().timestamp() + 3600),
            }),
            other => Err(PollError::Upstream(other)),
        }
    }

    /// Classify, sample, deduplicate, and enqueue a page of events.
    async fn ingest(&self, events: Vec<ApiEvent>) -> (u64, u64) {
        let mut enqueued = 0u64;
        let mut duplicates = 0u64;
        let block = Duration::from_secs(self.config.pipeline.enqueue_block_secs);

        for raw in events {
            let kind = EventKind::parse(&raw.kind);
            if kind.is_skipped() {
                continue;
            }

            let priority = kind.priority();
            if priority == Priority::Low
                && !sample_keep(&raw.id, self.config.pipeline.priority_sample_low)
            {
                continue;
            }

            if !self.dedup.insert(&raw.id) {
                duplicates += 1;
                continue;
            }

            let event = RawEvent {
                id: raw.id,
                payload: slim_payload(&kind, priority, raw.payload),
                kind,
                actor: Actor {
                    id: raw.actor.id,
                    login: raw.actor.login,
                },
                repository: Repository {
                    id: raw.repo.id,
                    full_name: raw.repo.name,
                },
                timestamp: raw.created_at,
                priority,
            };

            if !event.is_well_formed() {
                if self.metrics.record_corrupt("missing_required_field") {
                    warn!(event_id = %event.id, "Dropping malformed upstream event");
                }
                continue;
            }

            match self.queue.enqueue(&event, block).await {
                Ok(EnqueueOutcome::Enqueued) => enqueued += 1,
                Ok(EnqueueOutcome::Dropped) => self.metrics.record_dropped(priority),
                Err(e) => {
                    warn!(event_id = %event.id, error = %e, "Enqueue failed");
                }
            }
        }

        (enqueued, duplicates)
    }

    /// Sleep time derived from the shared quota tiers, plus jitter.
    async fn pacing_sleep(&self) -> Duration {
        let remaining = match self.cache.read().await {
            Ok(Some(snapshot)) => snapshot.remaining,
            _ => 5000,
        };

        let base_secs = if remaining < 100 {
            300
        } else if remaining < 500 {
            120
        } else if remaining < 1000 {
            60
        } else if remaining < 2000 {
            30
        } else {
            15
        };

        let jitter = rand::thread_rng().gen_range(0.0..2.0);
        Duration::from_secs_f64(base_secs as f64 + jitter)
    }

    /// Backoff policy per error class.
    fn backoff_for(&self, error: &PollError) -> Duration {
        let mut rng = rand::thread_rng();
        match error {
            PollError::RateLimited { reset_at } => {
                let until_reset = (*reset_at - Utc::now().timestamp()).max(0) as f64;
                Duration::from_secs_f64(until_reset + rng.gen_range(0.0..2.0))
            }
            _ => {
                let exp = 2u64.pow(self.consecutive_failures.min(6));
                let base = (exp as f64).min(60.0);
                Duration::from_secs_f64(base * rng.gen_range(0.5..1.5)).min(Duration::from_secs(60))
            }
        }
    }
}

/// Deterministic FNV-1a sample over the event id; stable across restarts.
fn sample_keep(id: &str, fraction: f64) -> bool {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in id.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    ((hash % 100) as f64) < fraction * 100.0
}

/// Bound push payload commit lists before the event goes on the wire.
///
/// High-priority events keep their full payload: the content detector scans
/// every commit for secrets and sums deletions across all of them, so
/// truncating here would hide findings past the cut. Only lower-priority
/// pushes are slimmed.
fn slim_payload(kind: &EventKind, priority: Priority, mut payload: serde_json::Value) -> serde_json::Value {
    if *kind == EventKind::Push && priority != Priority::High {
        if let Some(commits) = payload.get_mut("commits").and_then(|c| c.as_array_mut()) {
            commits.truncate(MAX_COMMITS_PER_PAYLOAD);
        }
    }
    payload
}

fn header_u64(response: &reqwest::Response, name: &str) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn header_i64(response: &reqwest::Response, name: &str) -> Option<i64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampling_is_deterministic() {
        for id in ["100", "2222", "35783021201"] {
            assert_eq!(sample_keep(id, 0.2), sample_keep(id, 0.2));
        }
    }

    #[test]
    fn test_sampling_fraction_roughly_holds() {
        let kept = (0..10_000)
            .filter(|i| sample_keep(&i.to_string(), 0.2))
            .count();
        assert!((1500..2500).contains(&kept), "kept {kept} of 10000");
    }

    #[test]
    fn test_sampling_edges() {
        assert!(sample_keep("anything", 1.0));
        assert!(!sample_keep("anything", 0.0));
    }

    fn wide_push_payload() -> serde_json::Value {
        let commits: Vec<serde_json::Value> = (0..25)
            .map(|i| serde_json::json!({"sha": i.to_string(), "message": "m"}))
            .collect();
        serde_json::json!({"ref": "refs/heads/main", "commits": commits})
    }

    #[test]
    fn test_slim_payload_truncates_low_priority_commits() {
        let slimmed = slim_payload(&EventKind::Push, Priority::Low, wide_push_payload());
        assert_eq!(slimmed["commits"].as_array().unwrap().len(), 10);
        assert_eq!(slimmed["ref"], "refs/heads/main");
    }

    #[test]
    fn test_slim_payload_keeps_high_priority_commits_intact() {
        // Content scanning reads every commit; a high-priority push must
        // arrive whole.
        let slimmed = slim_payload(&EventKind::Push, Priority::High, wide_push_payload());
        assert_eq!(slimmed["commits"].as_array().unwrap().len(), 25);
    }

    #[test]
    fn test_slim_payload_leaves_other_kinds() {
        let payload = serde_json::json!({"ref": "main", "ref_type": "branch"});
        let slimmed = slim_payload(&EventKind::Delete, Priority::High, payload.clone());
        assert_eq!(slimmed, payload);
    }

    #[test]
    fn test_api_event_decodes_upstream_shape() {
        let json = r#"{
            "id": "35783021201",
            "type": "PushEvent",
            "actor": {"id": 42, "login": "octocat"},
            "repo": {"id": 7, "name": "octocat/hello-world"},
            "payload": {"ref": "refs/heads/main", "size": 1, "commits": []},
            "created_at": "2024-06-01T12:00:00Z"
        }"#;
        let event: ApiEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.id, "35783021201");
        assert_eq!(event.actor.login, "octocat");
        assert_eq!(event.repo.name, "octocat/hello-world");
    }
}
