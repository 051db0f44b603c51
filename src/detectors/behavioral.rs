//! Behavioral anomaly detection against per-actor EWMA baselines.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde_json::json;
use statrs::distribution::{ChiSquared, ContinuousCDF};

use crate::detectors::{clip, DetectionInput, Detector};
use crate::history::ActorEvent;
use crate::profiles::user::{FEATURE_DIM, FEATURE_NAMES};
use crate::types::{AnomalyFlag, DetectorOutput, EventKind};

/// Z-score magnitude at which a dimension is flagged.
const Z_FLAG_THRESHOLD: f64 = 3.0;

/// Detects deviations from an actor's learned behavioral baseline.
///
/// Warm profiles are scored statistically (per-dimension z-scores plus a
/// multivariate Mahalanobis test); cold profiles fall back to tiered rate
/// heuristics.
pub struct BehavioralDetector {
    warm_n: u64,
    mvn_n: u64,
    /// χ² critical value at df = 10, p = 0.01.
    chi2_critical: f64,
}

impl BehavioralDetector {
    pub fn new(warm_n: u64, mvn_n: u64) -> Self {
        let chi2 = ChiSquared::new(FEATURE_DIM as f64).expect("valid degrees of freedom");
        Self {
            warm_n,
            mvn_n,
            chi2_critical: chi2.inverse_cdf(0.99),
        }
    }

    fn warm_analysis(&self, input: &DetectionInput) -> DetectorOutput {
        let features = &input.behavioral_features;
        let z_scores = input.user.z_scores(features);
        let mut anomalies = Vec::new();

        for (i, z) in z_scores.iter().enumerate() {
            if z.abs() >= Z_FLAG_THRESHOLD {
                anomalies.push(AnomalyFlag {
                    kind: "statistical_deviation".to_string(),
                    feature_name: Some(FEATURE_NAMES[i].to_string()),
                    current: features[i],
                    z_score: Some(*z),
                    severity: clip((z.abs() - Z_FLAG_THRESHOLD) / 5.0, 0.0, 1.0),
                });
            }
        }

        let mut mahalanobis = None;
        if input.user.sample_count >= self.mvn_n {
            if let Some(d) = input.user.mahalanobis(features) {
                mahalanobis = Some(d);
                let d2 = d * d;
                if d2 > self.chi2_critical {
                    anomalies.push(AnomalyFlag {
                        kind: "multivariate_outlier".to_string(),
                        feature_name: None,
                        current: d,
                        z_score: None,
                        severity: clip((d2 - self.chi2_critical) / self.chi2_critical, 0.0, 1.0),
                    });
                }
            }
        }

        let score = anomalies
            .iter()
            .map(|a| a.severity)
            .fold(0.0f64, f64::max);

        DetectorOutput {
            score,
            features: features.clone(),
            explanation: json!({
                "analysis_type": "statistical",
                "sample_count": input.user.sample_count,
                "z_scores": z_scores,
                "mahalanobis_distance": mahalanobis,
                "chi2_critical": self.chi2_critical,
                "confidence": clip(input.user.sample_count as f64 / 100.0, 0.0, 1.0),
                "feature_names": FEATURE_NAMES,
            }),
            anomalies,
            patterns: Vec::new(),
            degraded: false,
        }
    }

    fn cold_analysis(&self, input: &DetectionInput) -> DetectorOutput {
        let features = &input.behavioral_features;
        let events_per_hour = features[0];
        let entropy = features[7];
        let mut anomalies = Vec::new();

        let rate_severity = if events_per_hour >= 100.0 {
            0.9
        } else if events_per_hour >= 50.0 {
            0.7
        } else if events_per_hour >= 20.0 {
            0.5
        } else {
            0.0
        };
        if rate_severity > 0.0 {
            anomalies.push(AnomalyFlag {
                kind: "high_event_rate".to_string(),
                feature_name: Some("events_per_hour".to_string()),
                current: events_per_hour,
                z_score: None,
                severity: rate_severity,
            });
        }

        if entropy == 0.0 && events_per_hour >= 10.0 {
            anomalies.push(AnomalyFlag {
                kind: "single_type_flood".to_string(),
                feature_name: Some("event_type_entropy".to_string()),
                current: entropy,
                z_score: None,
                severity: 0.6,
            });
        }

        let score = anomalies
            .iter()
            .map(|a| a.severity)
            .fold(0.0f64, f64::max);

        DetectorOutput {
            score,
            features: features.clone(),
            explanation: json!({
                "analysis_type": "cold_start_heuristic",
                "sample_count": input.user.sample_count,
                "confidence": 0.3,
                "feature_names": FEATURE_NAMES,
            }),
            anomalies,
            patterns: Vec::new(),
            degraded: false,
        }
    }
}

impl Detector for BehavioralDetector {
    fn name(&self) -> &'static str {
        "behavioral"
    }

    fn analyze(&self, input: &DetectionInput) -> DetectorOutput {
        if input.user.is_warm(self.warm_n) {
            self.warm_analysis(input)
        } else {
            self.cold_analysis(input)
        }
    }
}

/// Extract the 10-dimensional behavioral feature vector for an actor at the
/// time of the current event.
///
/// `window` must hold the actor's events over the trailing 24 hours ending
/// at `event_ts`, current event included, oldest first.
pub fn extract_features(event_ts: DateTime<Utc>, window: &[ActorEvent]) -> Vec<f64> {
    let mut features = vec![0.0; FEATURE_DIM];
    if window.is_empty() {
        return features;
    }

    let hour_ago = event_ts - Duration::hours(1);
    let hour: Vec<&ActorEvent> = window.iter().filter(|e| e.ts >= hour_ago).collect();

    if !hour.is_empty() {
        // 0: events in the trailing hour
        features[0] = hour.len() as f64;

        // 1: repository diversity
        let mut repos: Vec<i64> = hour.iter().map(|e| e.repo_id).collect();
        repos.sort_unstable();
        repos.dedup();
        features[1] = repos.len() as f64 / hour.len() as f64;

        // 2: mean inter-event gap in minutes
        if hour.len() > 1 {
            let gaps: Vec<f64> = hour
                .windows(2)
                .map(|pair| (pair[1].ts - pair[0].ts).num_milliseconds() as f64 / 60_000.0)
                .collect();
            features[2] = gaps.iter().sum::<f64>() / gaps.len() as f64;
        }

        // 3: mean commit message length across push commits
        let commit_count: u64 = hour.iter().map(|e| e.commit_count as u64).sum();
        if commit_count > 0 {
            let message_len: u64 = hour.iter().map(|e| e.commit_message_len).sum();
            features[3] = message_len as f64 / commit_count as f64;

            // 4: mean files changed per commit over push events
            let pushes: Vec<&&ActorEvent> =
                hour.iter().filter(|e| e.kind == EventKind::Push).collect();
            if !pushes.is_empty() {
                let per_push: f64 = pushes
                    .iter()
                    .map(|e| e.files_changed as f64 / (e.commit_count.max(1)) as f64)
                    .sum();
                features[4] = per_push / pushes.len() as f64;
            }
        }

        // 5: burst score over the five-minute window ending now, reduced to [0, 1]
        features[5] = burst_score(event_ts, &hour);

        // 6: time spread of the hour window
        let first = hour.first().map(|e| e.ts).unwrap_or(event_ts);
        let last = hour.last().map(|e| e.ts).unwrap_or(event_ts);
        features[6] = (last - first).num_milliseconds() as f64 / 3_600_000.0;

        // 7: Shannon entropy (nats) of the event-type distribution
        features[7] = type_entropy(&hour);
    }

    // 8/9: weekend and off-hours shares over the trailing 24 h
    let weekend = window
        .iter()
        .filter(|e| {
            let wd = e.ts.weekday();
            wd == chrono::Weekday::Sat || wd == chrono::Weekday::Sun
        })
        .count();
    features[8] = weekend as f64 / window.len() as f64;

    let off_hours = window
        .iter()
        .filter(|e| {
            let h = e.ts.hour();
            !(9..18).contains(&h)
        })
        .count();
    features[9] = off_hours as f64 / window.len() as f64;

    features
}

fn burst_score(event_ts: DateTime<Utc>, hour: &[&ActorEvent]) -> f64 {
    let start = event_ts - Duration::minutes(5);
    let window: Vec<&&ActorEvent> = hour.iter().filter(|e| e.ts >= start).collect();
    let count = window.len();
    if count < 5 || (count as f64 / 5.0) < 2.0 {
        return 0.0;
    }

    let first = window.first().unwrap().ts;
    let last = window.last().unwrap().ts;
    let span_minutes = ((last - first).num_milliseconds() as f64 / 60_000.0).max(1.0 / 60.0);
    let rate = count as f64 / span_minutes;
    clip((rate - 2.0) / 8.0, 0.0, 1.0)
}

fn type_entropy(hour: &[&ActorEvent]) -> f64 {
    let mut counts: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    for event in hour {
        *counts.entry(event.kind.as_str()).or_insert(0) += 1;
    }
    let total = hour.len() as f64;
    counts
        .values()
        .map(|&c| {
            let p = c as f64 / total;
            -p * p.ln()
        })
        .sum()
}
