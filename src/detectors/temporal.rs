//! Temporal anomaly detection: bursts, coordination, timing, acceleration.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde_json::json;
use statrs::distribution::{ChiSquared, ContinuousCDF};

use crate::detectors::{clip, DetectionInput, Detector};
use crate::history::{ActorEvent, RepoEvent};
use crate::types::{AnomalyFlag, DetectorOutput, TemporalPattern};

/// Feature names for the 9-dimensional temporal vector, in index order.
pub const TEMPORAL_FEATURE_NAMES: [&str; 9] = [
    "events_per_minute_current",
    "baseline_rate_ratio",
    "burst_intensity",
    "inter_event_regularity",
    "coordination_score",
    "off_hours_intensity_ratio",
    "weekend_ratio",
    "time_concentration",
    "velocity_acceleration",
];

/// Minimum hourly observations before the timing test is attempted.
const TIMING_MIN_OBSERVATIONS: f64 = 48.0;

/// Detects suprathreshold rates, coordinated multi-actor activity, and
/// unusual timing distributions.
pub struct TemporalDetector {
    burst_window_min: i64,
    burst_min_count: u64,
    burst_min_rate: f64,
    coord_window_min: i64,
    coord_min_actors: u64,
    coord_min_events: u64,
}

impl TemporalDetector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        burst_window_min: u64,
        burst_min_count: u64,
        burst_min_rate: f64,
        coord_window_min: u64,
        coord_min_actors: u64,
        coord_min_events: u64,
    ) -> Self {
        Self {
            burst_window_min: burst_window_min as i64,
            burst_min_count,
            burst_min_rate,
            coord_window_min: coord_window_min as i64,
            coord_min_actors,
            coord_min_events,
        }
    }

    /// Burst rule over the window ending at the current event.
    ///
    /// The window rate gates the rule; the severity reads the rate over the
    /// actual span the events occupy, so a tight burst inside a mostly-empty
    /// window still scores as the burst it is.
    fn detect_burst(&self, now: DateTime<Utc>, actor_events: &[ActorEvent]) -> Option<TemporalPattern> {
        let start = now - Duration::minutes(self.burst_window_min);
        let window: Vec<&ActorEvent> = actor_events.iter().filter(|e| e.ts >= start).collect();
        let count = window.len() as u64;
        let window_rate = count as f64 / self.burst_window_min as f64;

        if count < self.burst_min_count || window_rate < self.burst_min_rate {
            return None;
        }

        let rate = span_rate(window.first().unwrap().ts, window.last().unwrap().ts, count);

        Some(TemporalPattern {
            kind: "activity_burst".to_string(),
            start_time: start,
            duration_minutes: self.burst_window_min as u32,
            event_count: count as u32,
            actor_count: None,
            events_per_minute: Some(rate),
            p_value: None,
            severity: clip((rate - self.burst_min_rate) / 8.0, 0.0, 1.0),
        })
    }

    /// Coordination rule over the repository window ending at the current event.
    fn detect_coordination(
        &self,
        now: DateTime<Utc>,
        repo_events: &[RepoEvent],
    ) -> Option<TemporalPattern> {
        let start = now - Duration::minutes(self.coord_window_min);
        let window: Vec<&RepoEvent> = repo_events.iter().filter(|e| e.ts >= start).collect();

        let mut actors: Vec<i64> = window.iter().map(|e| e.actor_id).collect();
        actors.sort_unstable();
        actors.dedup();

        let events = window.len() as u64;
        let distinct = actors.len() as u64;

        (distinct >= self.coord_min_actors && events >= self.coord_min_events).then(|| {
            TemporalPattern {
                kind: "coordinated_activity".to_string(),
                start_time: start,
                duration_minutes: self.coord_window_min as u32,
                event_count: events as u32,
                actor_count: Some(distinct as u32),
                events_per_minute: None,
                p_value: None,
                severity: clip(distinct as f64 / 10.0, 0.0, 1.0),
            }
        })
    }

    /// Chi-square goodness-of-fit of the actor's hourly distribution against
    /// uniform. Only meaningful once the profile has accumulated enough
    /// observations.
    fn detect_unusual_timing(
        &self,
        now: DateTime<Utc>,
        hourly_counts: &[f64; 24],
    ) -> Option<TemporalPattern> {
        let total: f64 = hourly_counts.iter().sum();
        if total < TIMING_MIN_OBSERVATIONS {
            return None;
        }

        let expected = total / 24.0;
        let statistic: f64 = hourly_counts
            .iter()
            .map(|obs| (obs - expected).powi(2) / expected)
            .sum();

        let chi2 = ChiSquared::new(23.0).ok()?;
        let p_value = (1.0 - chi2.cdf(statistic)).max(f64::MIN_POSITIVE);

        (p_value < 0.01).then(|| TemporalPattern {
            kind: "unusual_timing".to_string(),
            start_time: now,
            duration_minutes: 0,
            event_count: total as u32,
            actor_count: None,
            events_per_minute: None,
            p_value: Some(p_value),
            severity: clip(-p_value.log10() / 6.0, 0.0, 1.0),
        })
    }

    /// Velocity rule: the last five minutes run at least three times hotter
    /// than the five minutes before, and both windows are active.
    fn detect_acceleration(
        &self,
        now: DateTime<Utc>,
        actor_events: &[ActorEvent],
    ) -> Option<TemporalPattern> {
        let recent_start = now - Duration::minutes(5);
        let previous_start = now - Duration::minutes(10);

        let recent = actor_events.iter().filter(|e| e.ts >= recent_start).count() as f64 / 5.0;
        let previous = actor_events
            .iter()
            .filter(|e| e.ts >= previous_start && e.ts < recent_start)
            .count() as f64
            / 5.0;

        (recent >= 3.0 * previous && recent >= 0.5 && previous >= 0.5).then(|| TemporalPattern {
            kind: "velocity_acceleration".to_string(),
            start_time: previous_start,
            duration_minutes: 10,
            event_count: ((recent + previous) * 5.0) as u32,
            actor_count: None,
            events_per_minute: Some(recent),
            p_value: None,
            severity: 0.6,
        })
    }

    fn extract_features(
        &self,
        input: &DetectionInput,
        patterns: &[TemporalPattern],
    ) -> Vec<f64> {
        let now = input.event.timestamp;
        let mut features = vec![0.0; TEMPORAL_FEATURE_NAMES.len()];

        // 0: events/min for this (actor, repo) over the burst window
        let start = now - Duration::minutes(self.burst_window_min);
        let pair_count = input
            .actor_events
            .iter()
            .filter(|e| e.ts >= start && e.repo_id == input.event.repository.id)
            .count();
        features[0] = pair_count as f64 / self.burst_window_min as f64;

        // 1: current rate vs the actor's long-run events/hour baseline
        let baseline_per_min = input.user.mean.first().copied().unwrap_or(0.0) / 60.0;
        features[1] = if baseline_per_min > 0.0 {
            features[0] / baseline_per_min
        } else {
            1.0
        };

        for pattern in patterns {
            match pattern.kind.as_str() {
                "activity_burst" => features[2] = pattern.severity,
                "coordinated_activity" => features[4] = pattern.severity,
                "velocity_acceleration" => features[8] = pattern.severity,
                _ => {}
            }
        }

        // 3/7: regularity and concentration from inter-event intervals
        let hour_ago = now - Duration::hours(1);
        let recent: Vec<&ActorEvent> =
            input.actor_events.iter().filter(|e| e.ts >= hour_ago).collect();
        if recent.len() > 2 {
            let intervals: Vec<f64> = recent
                .windows(2)
                .map(|pair| (pair[1].ts - pair[0].ts).num_milliseconds() as f64 / 1000.0)
                .collect();
            let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
            if mean > 0.0 {
                let var = intervals.iter().map(|i| (i - mean).powi(2)).sum::<f64>()
                    / intervals.len() as f64;
                let cv = var.sqrt() / mean;
                features[3] = cv;
                features[7] = 1.0 / (1.0 + cv);
            }
        }

        // 5/6: off-hours and weekend shares over the trailing day
        if !input.actor_events.is_empty() {
            let total = input.actor_events.len() as f64;
            features[5] = input
                .actor_events
                .iter()
                .filter(|e| !(9..18).contains(&e.ts.hour()))
                .count() as f64
                / total;
            features[6] = input
                .actor_events
                .iter()
                .filter(|e| {
                    let wd = e.ts.weekday();
                    wd == chrono::Weekday::Sat || wd == chrono::Weekday::Sun
                })
                .count() as f64
                / total;
        }

        features
    }
}

/// Events per minute over the span `[first, last]`, floored at one second.
fn span_rate(first: DateTime<Utc>, last: DateTime<Utc>, count: u64) -> f64 {
    let span_minutes = ((last - first).num_milliseconds() as f64 / 60_000.0).max(1.0 / 60.0);
    count as f64 / span_minutes
}

impl Detector for TemporalDetector {
    fn name(&self) -> &'static str {
        "temporal"
    }

    fn analyze(&self, input: &DetectionInput) -> DetectorOutput {
        let now = input.event.timestamp;

        let patterns: Vec<TemporalPattern> = [
            self.detect_burst(now, &input.actor_events),
            self.detect_coordination(now, &input.repo_events),
            self.detect_unusual_timing(now, &input.user.hourly_counts),
            self.detect_acceleration(now, &input.actor_events),
        ]
        .into_iter()
        .flatten()
        .collect();

        let features = self.extract_features(input, &patterns);

        let anomalies: Vec<AnomalyFlag> = patterns
            .iter()
            .map(|p| AnomalyFlag {
                kind: p.kind.clone(),
                feature_name: None,
                current: p.events_per_minute.unwrap_or(p.event_count as f64),
                z_score: None,
                severity: p.severity,
            })
            .collect();

        let score = patterns.iter().map(|p| p.severity).fold(0.0f64, f64::max);

        DetectorOutput {
            score,
            features,
            anomalies,
            explanation: json!({
                "analysis_type": "temporal_patterns",
                "feature_names": TEMPORAL_FEATURE_NAMES,
                "pattern_count": patterns.len(),
            }),
            patterns,
            degraded: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::{RepositoryProfile, UserProfile};
    use crate::types::{Actor, EventKind, EventPayload, Priority, RawEvent, Repository};

    fn detector() -> TemporalDetector {
        TemporalDetector::new(5, 5, 2.0, 10, 3, 10)
    }

    fn input(
        now: DateTime<Utc>,
        actor_events: Vec<ActorEvent>,
        repo_events: Vec<RepoEvent>,
        user: UserProfile,
    ) -> DetectionInput {
        DetectionInput {
            event: RawEvent {
                id: "1".to_string(),
                kind: EventKind::Push,
                actor: Actor {
                    id: 1,
                    login: "octocat".to_string(),
                },
                repository: Repository {
                    id: 7,
                    full_name: "octocat/hello-world".to_string(),
                },
                timestamp: now,
                payload: serde_json::Value::Null,
                priority: Priority::High,
            },
            payload: EventPayload::Opaque,
            user,
            repo: RepositoryProfile::new(7, "octocat/hello-world", now),
            actor_events,
            repo_events,
            behavioral_features: vec![0.0; 10],
        }
    }

    fn actor_event(ts: DateTime<Utc>, repo_id: i64) -> ActorEvent {
        ActorEvent {
            ts,
            kind: EventKind::Push,
            repo_id,
            commit_count: 1,
            commit_message_len: 10,
            files_changed: 1,
        }
    }

    #[test]
    fn test_burst_severity() {
        let now = Utc::now();
        // Twelve events spread over exactly ninety seconds on two repos:
        // 12 / 1.5 min = 8/min, severity clip((8 - 2) / 8) = 0.75.
        let events: Vec<ActorEvent> = (0..12)
            .map(|i| {
                actor_event(
                    now - Duration::milliseconds(90_000 - i * (90_000 / 11)),
                    if i % 2 == 0 { 7 } else { 8 },
                )
            })
            .collect();
        let user = UserProfile::new(1, "octocat", now);

        let output = detector().analyze(&input(now, events, Vec::new(), user));
        let burst = output
            .patterns
            .iter()
            .find(|p| p.kind == "activity_burst")
            .expect("burst fires");
        assert!((burst.severity - 0.75).abs() < 0.02, "severity {}", burst.severity);
    }

    #[test]
    fn test_no_burst_below_threshold() {
        let now = Utc::now();
        let events: Vec<ActorEvent> = (0..4)
            .map(|i| actor_event(now - Duration::seconds(200 - i * 30), 7))
            .collect();
        let user = UserProfile::new(1, "octocat", now);

        let output = detector().analyze(&input(now, events, Vec::new(), user));
        assert!(output.patterns.iter().all(|p| p.kind != "activity_burst"));
    }

    #[test]
    fn test_coordination_severity() {
        let now = Utc::now();
        // Five actors, three events each, inside eight minutes.
        let mut repo_events = Vec::new();
        for actor in 1..=5i64 {
            for j in 0..3 {
                repo_events.push(RepoEvent {
                    ts: now - Duration::minutes(8) + Duration::seconds(actor * 60 + j * 10),
                    actor_id: actor,
                });
            }
        }
        let user = UserProfile::new(1, "octocat", now);

        let output = detector().analyze(&input(now, Vec::new(), repo_events, user));
        let coord = output
            .patterns
            .iter()
            .find(|p| p.kind == "coordinated_activity")
            .expect("coordination fires");
        assert_eq!(coord.actor_count, Some(5));
        assert!((coord.severity - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_unusual_timing_on_concentrated_hours() {
        let now = Utc::now();
        let mut user = UserProfile::new(1, "octocat", now);
        // Every observation at 03:00 UTC.
        user.hourly_counts[3] = 120.0;

        let output = detector().analyze(&input(now, Vec::new(), Vec::new(), user));
        let timing = output
            .patterns
            .iter()
            .find(|p| p.kind == "unusual_timing")
            .expect("timing fires");
        assert!(timing.p_value.unwrap() < 0.01);
        assert!(timing.severity > 0.0);
    }

    #[test]
    fn test_uniform_hours_do_not_fire() {
        let now = Utc::now();
        let mut user = UserProfile::new(1, "octocat", now);
        user.hourly_counts = [10.0; 24];

        let output = detector().analyze(&input(now, Vec::new(), Vec::new(), user));
        assert!(output.patterns.iter().all(|p| p.kind != "unusual_timing"));
    }

    #[test]
    fn test_velocity_acceleration() {
        let now = Utc::now();
        let mut events = Vec::new();
        // Three events in the previous window, twelve in the recent one.
        for i in 0..3 {
            events.push(actor_event(now - Duration::minutes(9) + Duration::seconds(i * 30), 7));
        }
        for i in 0..12 {
            events.push(actor_event(now - Duration::minutes(4) + Duration::seconds(i * 15), 7));
        }
        let user = UserProfile::new(1, "octocat", now);

        let output = detector().analyze(&input(now, events, Vec::new(), user));
        let accel = output
            .patterns
            .iter()
            .find(|p| p.kind == "velocity_acceleration")
            .expect("acceleration fires");
        assert_eq!(accel.severity, 0.6);
    }

    #[test]
    fn test_score_is_max_of_pattern_severities() {
        let now = Utc::now();
        let events: Vec<ActorEvent> = (0..40)
            .map(|i| actor_event(now - Duration::seconds(240 - i * 6), 7))
            .collect();
        let user = UserProfile::new(1, "octocat", now);

        let output = detector().analyze(&input(now, events, Vec::new(), user));
        let max = output
            .patterns
            .iter()
            .map(|p| p.severity)
            .fold(0.0f64, f64::max);
        assert_eq!(output.score, max);
        assert!(output.score > 0.0);
    }
}
