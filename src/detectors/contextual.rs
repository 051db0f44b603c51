//! Repository context scoring: criticality as a severity multiplier.

use serde_json::json;

use crate::detectors::{clip, DetectionInput, Detector};
use crate::profiles::RepositoryProfile;
use crate::types::DetectorOutput;

/// Feature names for the 9-dimensional context vector, in index order.
pub const CONTEXT_FEATURE_NAMES: [&str; 9] = [
    "repository_criticality",
    "stars_normalized",
    "forks_normalized",
    "contributors_normalized",
    "recent_activity",
    "security_policy",
    "protected_branches",
    "dependency_risk",
    "popularity_momentum",
];

/// Repository name fragments that mark high-value targets.
const HIGH_VALUE_NAME_HINTS: &[&str] = &["prod", "production", "infra", "api", "core", "deploy"];

/// Scores repository criticality from stream-observed signals.
///
/// Unlike the other detectors this one does not produce an anomaly score;
/// its output is the criticality multiplier the fuser applies as a weight.
pub struct ContextualDetector;

impl ContextualDetector {
    pub fn new() -> Self {
        Self
    }

    /// Compute the context feature vector; index 0 is filled afterwards.
    fn extract_features(repo: &RepositoryProfile) -> [f64; 9] {
        let mut features = [0.0; 9];

        // Popularity proxies accumulated from the stream, log-scaled the
        // way absolute platform counts would be.
        features[1] = clip((repo.watch_count as f64 + 1.0).log10() / 6.0, 0.0, 1.0);
        features[2] = clip((repo.fork_count as f64 + 1.0).log10() / 5.0, 0.0, 1.0);
        features[3] = clip(
            (repo.contributor_estimate() as f64 + 1.0).log10() / 3.0,
            0.0,
            1.0,
        );
        features[4] = clip(repo.events_per_hour / 10.0, 0.0, 1.0);

        // Security posture is not observable from the public stream without
        // extra API spend; the dimensions stay zero until enriched.
        features[5] = 0.0;
        features[6] = branch_protection_estimate(repo);

        features[7] = clip((repo.total_events as f64 + 1.0).log10() / 4.0, 0.0, 1.0);

        let age_days = (repo.last_updated - repo.first_seen).num_days().max(1) as f64;
        let momentum = (repo.watch_count + repo.fork_count) as f64 / age_days;
        features[8] = clip(momentum / 50.0, 0.0, 1.0);

        features
    }

    fn criticality(repo: &RepositoryProfile, features: &[f64; 9]) -> f64 {
        let weights = [0.0, 0.25, 0.20, 0.15, 0.15, 0.10, 0.05, 0.05, 0.05];
        let base: f64 = features
            .iter()
            .zip(weights.iter())
            .map(|(f, w)| f * w)
            .sum();

        let name = repo.full_name.to_lowercase();
        let name_boost = if HIGH_VALUE_NAME_HINTS.iter().any(|hint| name.contains(hint)) {
            0.05
        } else {
            0.0
        };

        clip(base + name_boost, 0.0, 1.0)
    }

    fn level(criticality: f64) -> &'static str {
        if criticality >= 0.8 {
            "critical"
        } else if criticality >= 0.6 {
            "high"
        } else if criticality >= 0.4 {
            "medium"
        } else {
            "low"
        }
    }
}

/// Larger, busier repositories are more likely to protect their default
/// branch; estimated because the stream cannot show the setting itself.
fn branch_protection_estimate(repo: &RepositoryProfile) -> f64 {
    let mut score: f64 = 0.0;
    if repo.watch_count > 100 || repo.fork_count > 20 {
        score += 0.3;
    }
    if repo.watch_count > 1000 || repo.fork_count > 100 {
        score += 0.3;
    }
    if repo.contributor_estimate() > 50 {
        score += 0.4;
    }
    score.min(1.0)
}

impl Default for ContextualDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for ContextualDetector {
    fn name(&self) -> &'static str {
        "contextual"
    }

    fn analyze(&self, input: &DetectionInput) -> DetectorOutput {
        let now = input.event.timestamp;

        let cached = input.repo.cached_criticality(now);
        let mut features = Self::extract_features(&input.repo);
        let criticality = match cached {
            Some(score) => score,
            None => Self::criticality(&input.repo, &features),
        };
        features[0] = criticality;

        let score = clip(criticality, 0.0, 1.0);

        DetectorOutput {
            score,
            features: features.to_vec(),
            anomalies: Vec::new(),
            explanation: json!({
                "analysis_type": "repository_context",
                "feature_names": CONTEXT_FEATURE_NAMES,
                "criticality_level": Self::level(score),
                "from_cache": cached.is_some(),
                "repository": input.repo.full_name,
                "contributor_estimate": input.repo.contributor_estimate(),
                "events_per_hour": input.repo.events_per_hour,
            }),
            patterns: Vec::new(),
            degraded: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::UserProfile;
    use crate::types::{Actor, EventKind, EventPayload, Priority, RawEvent, Repository};
    use chrono::{Duration, Utc};

    fn input_for(repo: RepositoryProfile) -> DetectionInput {
        let now = Utc::now();
        DetectionInput {
            event: RawEvent {
                id: "1".to_string(),
                kind: EventKind::Push,
                actor: Actor {
                    id: 1,
                    login: "octocat".to_string(),
                },
                repository: Repository {
                    id: repo.repo_id,
                    full_name: repo.full_name.clone(),
                },
                timestamp: now,
                payload: serde_json::Value::Null,
                priority: Priority::High,
            },
            payload: EventPayload::Opaque,
            user: UserProfile::new(1, "octocat", now),
            repo,
            actor_events: Vec::new(),
            repo_events: Vec::new(),
            behavioral_features: vec![0.0; 10],
        }
    }

    #[test]
    fn test_quiet_repo_scores_low() {
        let now = Utc::now();
        let repo = RepositoryProfile::new(7, "someone/sandbox", now);
        let output = ContextualDetector::new().analyze(&input_for(repo));
        assert!(output.score < 0.4);
        assert_eq!(output.explanation["criticality_level"], "low");
    }

    #[test]
    fn test_popular_active_repo_scores_higher() {
        let now = Utc::now();
        let mut repo = RepositoryProfile::new(7, "bigorg/core-api", now - Duration::days(10));
        repo.watch_count = 50_000;
        repo.fork_count = 5_000;
        repo.events_per_hour = 40.0;
        repo.total_events = 10_000;
        for actor in 0..100 {
            repo.contributors.insert(actor);
        }
        repo.last_updated = now;

        let output = ContextualDetector::new().analyze(&input_for(repo));
        assert!(output.score > 0.5, "score was {}", output.score);
    }

    #[test]
    fn test_cached_criticality_short_circuits() {
        let now = Utc::now();
        let mut repo = RepositoryProfile::new(7, "someone/sandbox", now);
        repo.set_criticality(0.83, now);

        let output = ContextualDetector::new().analyze(&input_for(repo));
        assert_eq!(output.score, 0.83);
        assert_eq!(output.explanation["from_cache"], true);
        assert_eq!(output.explanation["criticality_level"], "critical");
    }

    #[test]
    fn test_score_always_in_range() {
        let now = Utc::now();
        let mut repo = RepositoryProfile::new(7, "prod/prod-infra-api-core", now);
        repo.watch_count = u64::MAX / 2;
        repo.fork_count = u64::MAX / 2;
        repo.events_per_hour = 1e9;

        let output = ContextualDetector::new().analyze(&input_for(repo));
        assert!((0.0..=1.0).contains(&output.score));
    }
}
