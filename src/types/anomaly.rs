//! Anomaly record and severity data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity buckets derived from the final anomaly score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SeverityLevel {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl SeverityLevel {
    /// Bucket a final score.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.85 {
            SeverityLevel::Critical
        } else if score >= 0.65 {
            SeverityLevel::High
        } else if score >= 0.35 {
            SeverityLevel::Medium
        } else if score >= 0.15 {
            SeverityLevel::Low
        } else {
            SeverityLevel::Info
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SeverityLevel::Critical => "critical",
            SeverityLevel::High => "high",
            SeverityLevel::Medium => "medium",
            SeverityLevel::Low => "low",
            SeverityLevel::Info => "info",
        }
    }
}

/// Which detector dominated the fused score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMethod {
    Behavioral,
    Temporal,
    Content,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::Behavioral => "behavioral",
            DetectionMethod::Temporal => "temporal",
            DetectionMethod::Content => "content",
        }
    }
}

/// A per-feature anomaly flag raised by a detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyFlag {
    /// Flag kind, e.g. `statistical_deviation`, `activity_burst`.
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_name: Option<String>,

    pub current: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_score: Option<f64>,

    pub severity: f64,
}

/// Result of one detector over one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorOutput {
    /// Component score in [0, 1].
    pub score: f64,

    /// Feature vector the detector scored on.
    pub features: Vec<f64>,

    /// Per-feature / per-pattern flags.
    pub anomalies: Vec<AnomalyFlag>,

    /// Free-form explanation blob persisted with the record.
    pub explanation: serde_json::Value,

    /// Multi-event patterns (only the temporal detector emits these).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patterns: Vec<TemporalPattern>,

    /// Set when the detector errored or timed out and contributed 0.
    #[serde(default)]
    pub degraded: bool,
}

impl DetectorOutput {
    /// A zero-score output for an empty or skipped analysis.
    pub fn quiet(explanation: serde_json::Value) -> Self {
        Self {
            score: 0.0,
            features: Vec::new(),
            anomalies: Vec::new(),
            explanation,
            patterns: Vec::new(),
            degraded: false,
        }
    }

    /// A degraded output for a detector that errored or timed out.
    pub fn degraded(kind: &str) -> Self {
        Self {
            score: 0.0,
            features: Vec::new(),
            anomalies: Vec::new(),
            explanation: serde_json::json!({ "error": kind, "degraded": true }),
            patterns: Vec::new(),
            degraded: true,
        }
    }
}

/// A temporal pattern straddling multiple events (burst, coordination, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemporalPattern {
    #[serde(rename = "type")]
    pub kind: String,

    pub start_time: DateTime<Utc>,

    pub duration_minutes: u32,

    pub event_count: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_count: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub events_per_minute: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub p_value: Option<f64>,

    pub severity: f64,
}

/// Persisted anomaly record; immutable once written, idempotent on event id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub event_id: String,
    pub repository_name: String,
    pub user_login: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,

    pub behavioral_anomaly_score: f64,
    pub content_risk_score: f64,
    pub temporal_anomaly_score: f64,
    pub repository_criticality_score: f64,
    pub final_anomaly_score: f64,
    pub severity_level: SeverityLevel,
    pub primary_method: DetectionMethod,

    pub behavioral_analysis: serde_json::Value,
    pub content_analysis: serde_json::Value,
    pub temporal_analysis: serde_json::Value,
    pub repository_context: serde_json::Value,

    pub high_risk_indicators: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_summary: Option<String>,

    pub detection_timestamp: DateTime<Utc>,
}
