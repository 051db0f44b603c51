//! Quota coordination: shared rate-limit cache, token bucket, circuit breaker.

use anyhow::Result;
use async_nats::jetstream::kv;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Quota state observed from upstream response headers.
///
/// The response headers are the sole source of truth; this snapshot is what
/// peer pollers share through the cache.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    /// Requests left in the current window.
    pub remaining: u64,
    /// Unix timestamp at which the window resets.
    pub reset_at: i64,
    /// Millisecond timestamp of the observation; last writer wins on it.
    pub updated_at: i64,
}

impl QuotaSnapshot {
    pub fn observed_now(remaining: u64, reset_at: i64) -> Self {
        Self {
            remaining,
            reset_at,
            updated_at: Utc::now().timestamp_millis(),
        }
    }

    /// Seconds until the quota window resets (zero if already past).
    pub fn secs_until_reset(&self) -> u64 {
        (self.reset_at - Utc::now().timestamp()).max(0) as u64
    }
}

/// Shared rate-limit cache entry in a NATS KV bucket.
///
/// Writes are compare-and-set on the entry revision; a newer observation
/// (by `updated_at`) always wins, an older one is discarded.
pub struct RateLimitCache {
    store: kv::Store,
    key: String,
}

impl RateLimitCache {
    pub async fn open(
        jetstream: &async_nats::jetstream::Context,
        bucket: &str,
        region: &str,
    ) -> Result<Self> {
        let store = match jetstream.get_key_value(bucket).await {
            Ok(store) => store,
            Err(_) => {
                jetstream
                    .create_key_value(kv::Config {
                        bucket: bucket.to_string(),
                        history: 1,
                        ..Default::default()
                    })
                    .await?
            }
        };

        Ok(Self {
            store,
            key: format!("poller:{region}"),
        })
    }

    /// Publish an observation; last writer wins by observation timestamp.
    pub async fn publish(&self, snapshot: QuotaSnapshot) -> Result<()> {
        let payload = serde_json::to_vec(&snapshot)?;

        for _ in 0..2 {
            match self.store.entry(&self.key).await? {
                Some(entry) => {
                    if let Ok(existing) = serde_json::from_slice::<QuotaSnapshot>(&entry.value) {
                        if existing.updated_at >= snapshot.updated_at {
                            debug!("Skipping rate-limit publish, cache entry is newer");
                            return Ok(());
                        }
                    }
                    match self
                        .store
                        .update(&self.key, payload.clone().into(), entry.revision)
                        .await
                    {
                        Ok(_) => return Ok(()),
                        Err(e) => {
                            debug!(error = %e, "Rate-limit CAS conflict, retrying");
                            continue;
                        }
                    }
                }
                None => match self.store.create(&self.key, payload.clone().into()).await {
                    Ok(_) => return Ok(()),
                    Err(e) => {
                        debug!(error = %e, "Rate-limit create raced, retrying");
                        continue;
                    }
                },
            }
        }

        warn!("Rate-limit cache update lost the race twice, keeping local state");
        Ok(())
    }

    /// Read the shared observation, if any.
    pub async fn read(&self) -> Result<Option<QuotaSnapshot>> {
        match self.store.get(&self.key).await? {
            Some(value) => Ok(serde_json::from_slice(&value).ok()),
            None => Ok(None),
        }
    }
}

/// In-process token bucket sized to this worker's share of the quota.
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(initial: f64) -> Self {
        Self {
            tokens: initial,
            capacity: initial.max(1.0),
            refill_per_sec: 0.0,
            last_refill: Instant::now(),
        }
    }

    /// Resize to the per-worker quota share, spreading refills until reset.
    pub fn resize(&mut self, share: f64, secs_until_reset: u64) {
        self.capacity = share.max(1.0);
        self.tokens = self.tokens.min(self.capacity);
        self.refill_per_sec = if secs_until_reset > 0 {
            share / secs_until_reset as f64
        } else {
            share
        };
    }

    /// Take one token if available.
    pub fn try_take(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.last_refill = Instant::now();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
    }
}

/// Circuit breaker over consecutive upstream failures.
///
/// After `threshold` consecutive failures the breaker opens for a cool-down;
/// the first call allowed afterwards is the probe, and its outcome decides
/// whether the breaker closes again.
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    state: BreakerState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open { until: Instant },
    HalfOpen,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            consecutive_failures: 0,
            state: BreakerState::Closed,
        }
    }

    /// Whether a request may be issued right now.
    pub fn allow(&mut self) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open { until } => {
                if Instant::now() >= until {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn on_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = BreakerState::Closed;
    }

    pub fn on_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.threshold {
            self.state = BreakerState::Open {
                until: Instant::now() + self.cooldown,
            };
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, BreakerState::Open { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_bucket_exhausts_and_refills() {
        let mut bucket = TokenBucket::new(2.0);
        bucket.resize(2.0, 1);
        assert!(bucket.try_take());
        assert!(bucket.try_take());
        assert!(!bucket.try_take());

        std::thread::sleep(Duration::from_millis(600));
        // Refill rate is 2 tokens/sec, so one token is back.
        assert!(bucket.try_take());
    }

    #[test]
    fn test_breaker_opens_after_threshold() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_millis(50));
        assert!(breaker.allow());

        breaker.on_failure();
        breaker.on_failure();
        assert!(!breaker.is_open());
        breaker.on_failure();
        assert!(breaker.is_open());
        assert!(!breaker.allow());

        std::thread::sleep(Duration::from_millis(60));
        // Cool-down elapsed: a single probe is allowed.
        assert!(breaker.allow());
        breaker.on_success();
        assert!(!breaker.is_open());
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn test_probe_failure_reopens() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_millis(50));
        breaker.on_failure();
        assert!(breaker.is_open());

        std::thread::sleep(Duration::from_millis(60));
        assert!(breaker.allow());
        breaker.on_failure();
        assert!(breaker.is_open());
    }

    #[test]
    fn test_snapshot_reset_clock() {
        let snapshot = QuotaSnapshot::observed_now(100, Utc::now().timestamp() + 120);
        assert!(snapshot.secs_until_reset() > 100);
        let past = QuotaSnapshot::observed_now(100, Utc::now().timestamp() - 10);
        assert_eq!(past.secs_until_reset(), 0);
    }
}
