//! Per-actor behavioral baseline maintained by EWMA updates.

use chrono::{DateTime, Timelike, Utc};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::types::EventKind;

/// Dimensionality of the behavioral feature vector.
pub const FEATURE_DIM: usize = 10;

/// Variance floor applied after every update.
pub const VARIANCE_FLOOR: f64 = 1e-6;

/// Maximum feature vectors retained for covariance estimation.
const MAX_FEATURE_HISTORY: usize = 100;

/// Contributor names for the behavioral feature vector, in index order.
pub const FEATURE_NAMES: [&str; FEATURE_DIM] = [
    "events_per_hour",
    "repository_diversity_ratio",
    "avg_inter_event_interval_minutes",
    "commit_message_length_avg",
    "files_changed_per_commit_avg",
    "activity_burst_score",
    "time_spread_hours",
    "event_type_entropy",
    "weekend_activity_ratio",
    "off_hours_activity_ratio",
];

/// Behavioral baseline for one actor.
///
/// Mean and variance are only ever advanced by EWMA; they are never
/// recomputed from raw history in the hot path. `sample_count` is
/// monotonically non-decreasing and every variance entry stays at or above
/// [`VARIANCE_FLOOR`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub actor_id: i64,
    pub login: String,

    pub sample_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,

    pub mean: Vec<f64>,
    pub variance: Vec<f64>,

    /// Sliding window of recent feature vectors for covariance estimation.
    pub feature_history: VecDeque<Vec<f64>>,

    /// EWMA share of each event type this actor performs.
    pub event_type_share: HashMap<String, f64>,

    /// Raw per-hour observation counts (UTC) feeding the timing test.
    pub hourly_counts: [f64; 24],

    /// Inverse covariance for the multivariate test; rebuilt lazily and
    /// never persisted.
    #[serde(skip)]
    pub inverse_covariance: Option<DMatrix<f64>>,
}

impl UserProfile {
    /// Empty profile for an actor seen for the first time.
    pub fn new(actor_id: i64, login: &str, now: DateTime<Utc>) -> Self {
        Self {
            actor_id,
            login: login.to_string(),
            sample_count: 0,
            first_seen: now,
            last_updated: now,
            mean: vec![0.0; FEATURE_DIM],
            variance: vec![1.0; FEATURE_DIM],
            feature_history: VecDeque::new(),
            event_type_share: HashMap::new(),
            hourly_counts: [0.0; 24],
            inverse_covariance: None,
        }
    }

    /// Whether enough samples exist for statistical scoring.
    pub fn is_warm(&self, warm_n: u64) -> bool {
        self.sample_count >= warm_n
    }

    /// EWMA share of the given event type, 0 if never observed.
    pub fn type_share(&self, kind: &EventKind) -> f64 {
        self.event_type_share
            .get(kind.as_str())
            .copied()
            .unwrap_or(0.0)
    }

    /// Fold one feature observation into the baseline.
    ///
    /// The first observation seeds the mean directly; afterwards
    /// `μ' = α·x + (1−α)·μ` and `σ²' = α·(x−μ')² + (1−α)·σ²`, with the
    /// variance floored.
    pub fn observe(&mut self, features: &[f64], kind: &EventKind, now: DateTime<Utc>, alpha: f64) {
        debug_assert_eq!(features.len(), FEATURE_DIM);

        if self.sample_count == 0 {
            self.mean.copy_from_slice(features);
            for v in &mut self.variance {
                *v = 0.01f64.max(VARIANCE_FLOOR);
            }
        } else {
            for i in 0..FEATURE_DIM {
                let x = features[i];
                let new_mean = alpha * x + (1.0 - alpha) * self.mean[i];
                let new_var = alpha * (x - new_mean).powi(2) + (1.0 - alpha) * self.variance[i];
                self.mean[i] = new_mean;
                self.variance[i] = new_var.max(VARIANCE_FLOOR);
            }
        }

        self.feature_history.push_back(features.to_vec());
        if self.feature_history.len() > MAX_FEATURE_HISTORY {
            self.feature_history.pop_front();
        }

        // EWMA of the one-hot event-type indicator keeps shares summing to ~1.
        let observed = kind.as_str().to_string();
        for (name, share) in self.event_type_share.iter_mut() {
            let indicator = if *name == observed { 1.0 } else { 0.0 };
            *share = alpha * indicator + (1.0 - alpha) * *share;
        }
        self.event_type_share.entry(observed).or_insert(alpha);
        self.event_type_share.retain(|_, share| *share > 1e-4);

        self.hourly_counts[now.hour() as usize] += 1.0;

        self.sample_count += 1;
        self.last_updated = now;
        // Stale after every update; rebuilt on demand.
        self.inverse_covariance = None;
    }

    /// Per-dimension z-scores of a feature vector against the baseline.
    pub fn z_scores(&self, features: &[f64]) -> Vec<f64> {
        (0..FEATURE_DIM)
            .map(|i| (features[i] - self.mean[i]) / self.variance[i].sqrt())
            .collect()
    }

    /// Rebuild the inverse covariance matrix from the feature history.
    ///
    /// Requires at least `mvn_n` retained vectors; the covariance is
    /// regularized before inversion so a degenerate history cannot make it
    /// singular.
    pub fn ensure_inverse_covariance(&mut self, mvn_n: u64) {
        if self.inverse_covariance.is_some() {
            return;
        }
        if (self.feature_history.len() as u64) < mvn_n {
            return;
        }

        let rows = self.feature_history.len();
        let mut data = DMatrix::<f64>::zeros(rows, FEATURE_DIM);
        for (r, vec) in self.feature_history.iter().enumerate() {
            for (c, v) in vec.iter().enumerate() {
                data[(r, c)] = *v;
            }
        }

        let mean = data.row_mean();
        let centered = DMatrix::from_fn(rows, FEATURE_DIM, |r, c| data[(r, c)] - mean[c]);
        let mut cov = (centered.transpose() * &centered) / (rows as f64 - 1.0);
        for i in 0..FEATURE_DIM {
            cov[(i, i)] += 1e-6;
        }

        self.inverse_covariance = cov.try_inverse();
    }

    /// Mahalanobis distance of a feature vector from the baseline mean.
    pub fn mahalanobis(&self, features: &[f64]) -> Option<f64> {
        let inv = self.inverse_covariance.as_ref()?;
        let diff = DVector::from_iterator(
            FEATURE_DIM,
            features.iter().zip(&self.mean).map(|(x, m)| x - m),
        );
        let d2 = (diff.transpose() * inv * &diff)[(0, 0)];
        (d2 >= 0.0).then(|| d2.sqrt())
    }

    /// Total hourly observations recorded for the timing test.
    pub fn hourly_total(&self) -> f64 {
        self.hourly_counts.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile_with_samples(n: usize) -> UserProfile {
        let now = Utc::now();
        let mut profile = UserProfile::new(1, "octocat", now);
        for i in 0..n {
            let features: Vec<f64> = (0..FEATURE_DIM).map(|d| (d as f64) + (i % 3) as f64).collect();
            profile.observe(&features, &EventKind::Push, now, 0.05);
        }
        profile
    }

    #[test]
    fn test_sample_count_monotone() {
        let profile = profile_with_samples(5);
        assert_eq!(profile.sample_count, 5);
    }

    #[test]
    fn test_variance_floor_holds() {
        let now = Utc::now();
        let mut profile = UserProfile::new(1, "octocat", now);
        let constant = vec![2.0; FEATURE_DIM];
        for _ in 0..50 {
            profile.observe(&constant, &EventKind::Push, now, 0.05);
        }
        for v in &profile.variance {
            assert!(*v >= VARIANCE_FLOOR);
        }
    }

    #[test]
    fn test_first_observation_seeds_mean() {
        let now = Utc::now();
        let mut profile = UserProfile::new(1, "octocat", now);
        let features = vec![3.0; FEATURE_DIM];
        profile.observe(&features, &EventKind::Push, now, 0.05);
        assert_eq!(profile.mean, features);
    }

    #[test]
    fn test_type_share_converges() {
        let now = Utc::now();
        let mut profile = UserProfile::new(1, "octocat", now);
        let features = vec![0.0; FEATURE_DIM];
        for _ in 0..200 {
            profile.observe(&features, &EventKind::Push, now, 0.05);
        }
        // A single observed type converges towards share 1.
        assert!(profile.type_share(&EventKind::Push) > 0.9);
        assert_eq!(profile.type_share(&EventKind::Watch), 0.0);
    }

    #[test]
    fn test_inverse_covariance_needs_history() {
        let mut profile = profile_with_samples(5);
        profile.ensure_inverse_covariance(30);
        assert!(profile.inverse_covariance.is_none());

        let mut profile = profile_with_samples(40);
        profile.ensure_inverse_covariance(30);
        assert!(profile.inverse_covariance.is_some());
        assert!(profile.mahalanobis(&vec![100.0; FEATURE_DIM]).unwrap() > 0.0);
    }
}
