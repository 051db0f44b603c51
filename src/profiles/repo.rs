//! Per-repository activity baseline.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::types::EventKind;

/// Criticality cache lifetime.
const CRITICALITY_TTL_SECS: i64 = 7200;

/// Contributor set is tracked exactly up to this size, then estimated.
const MAX_TRACKED_CONTRIBUTORS: usize = 512;

/// Activity baseline for one repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryProfile {
    pub repo_id: i64,
    pub full_name: String,

    pub total_events: u64,
    pub first_seen: DateTime<Utc>,
    pub last_event: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,

    /// EWMA of observed events per hour.
    pub events_per_hour: f64,

    /// Distinct actors seen on this repo (exact up to a cap).
    pub contributors: BTreeSet<i64>,

    /// Popularity proxies accumulated from the event stream.
    pub watch_count: u64,
    pub fork_count: u64,

    /// Cached criticality score with its computation time.
    pub criticality: Option<CachedCriticality>,
}

/// Criticality score cached with a TTL.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CachedCriticality {
    pub score: f64,
    pub computed_at: DateTime<Utc>,
}

impl RepositoryProfile {
    pub fn new(repo_id: i64, full_name: &str, now: DateTime<Utc>) -> Self {
        Self {
            repo_id,
            full_name: full_name.to_string(),
            total_events: 0,
            first_seen: now,
            last_event: None,
            last_updated: now,
            events_per_hour: 0.0,
            contributors: BTreeSet::new(),
            watch_count: 0,
            fork_count: 0,
            criticality: None,
        }
    }

    /// Fold one event into the repo baseline.
    ///
    /// The events/hour EWMA advances on the instantaneous rate implied by
    /// the inter-arrival gap; a first event seeds it at zero.
    pub fn touch(&mut self, ts: DateTime<Utc>, actor_id: i64, kind: &EventKind, alpha: f64) {
        if let Some(last) = self.last_event {
            let gap_hours = (ts - last).num_milliseconds().max(1) as f64 / 3_600_000.0;
            let instantaneous = 1.0 / gap_hours.max(1.0 / 3600.0);
            self.events_per_hour = alpha * instantaneous + (1.0 - alpha) * self.events_per_hour;
        }

        if self.contributors.len() < MAX_TRACKED_CONTRIBUTORS {
            self.contributors.insert(actor_id);
        }

        match kind {
            EventKind::Watch | EventKind::Star => self.watch_count += 1,
            EventKind::Fork => self.fork_count += 1,
            _ => {}
        }

        self.total_events += 1;
        self.last_event = Some(ts);
        self.last_updated = ts;
    }

    /// Estimated contributor-set size.
    pub fn contributor_estimate(&self) -> u64 {
        self.contributors.len() as u64
    }

    /// Cached criticality if still within TTL.
    pub fn cached_criticality(&self, now: DateTime<Utc>) -> Option<f64> {
        self.criticality.and_then(|c| {
            (now - c.computed_at < Duration::seconds(CRITICALITY_TTL_SECS)).then_some(c.score)
        })
    }

    pub fn set_criticality(&mut self, score: f64, now: DateTime<Utc>) {
        self.criticality = Some(CachedCriticality {
            score,
            computed_at: now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_tracks_rate_and_contributors() {
        let start = Utc::now();
        let mut profile = RepositoryProfile::new(7, "octocat/hello-world", start);

        for i in 0..10 {
            let ts = start + Duration::minutes(6 * i);
            profile.touch(ts, 100 + i, &EventKind::Push, 0.3);
        }

        assert_eq!(profile.total_events, 10);
        assert_eq!(profile.contributor_estimate(), 10);
        // Ten events six minutes apart imply roughly ten events per hour.
        assert!(profile.events_per_hour > 3.0);
    }

    #[test]
    fn test_popularity_counters() {
        let now = Utc::now();
        let mut profile = RepositoryProfile::new(7, "octocat/hello-world", now);
        profile.touch(now, 1, &EventKind::Watch, 0.3);
        profile.touch(now, 2, &EventKind::Fork, 0.3);
        assert_eq!(profile.watch_count, 1);
        assert_eq!(profile.fork_count, 1);
    }

    #[test]
    fn test_criticality_ttl() {
        let now = Utc::now();
        let mut profile = RepositoryProfile::new(7, "octocat/hello-world", now);
        profile.set_criticality(0.8, now - Duration::seconds(CRITICALITY_TTL_SECS + 60));
        assert_eq!(profile.cached_criticality(now), None);

        profile.set_criticality(0.8, now);
        assert_eq!(profile.cached_criticality(now), Some(0.8));
    }
}
