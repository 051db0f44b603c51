//! Pluggable enrichment stage for anomaly record summaries.

use async_trait::async_trait;

use crate::types::AnomalyRecord;

/// Optional enrichment invoked for HIGH and CRITICAL records before they are
/// persisted. The actual language-model integration lives outside this crate;
/// the default implementation adds nothing.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, record: &AnomalyRecord) -> Option<String>;
}

/// Default no-op summarizer.
pub struct NoopSummarizer;

#[async_trait]
impl Summarizer for NoopSummarizer {
    async fn summarize(&self, _record: &AnomalyRecord) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DetectionMethod, SeverityLevel};
    use chrono::Utc;

    #[tokio::test]
    async fn test_noop_returns_none() {
        let record = AnomalyRecord {
            event_id: "1".to_string(),
            repository_name: "a/b".to_string(),
            user_login: "a".to_string(),
            event_type: "PushEvent".to_string(),
            timestamp: Utc::now(),
            behavioral_anomaly_score: 0.0,
            content_risk_score: 0.0,
            temporal_anomaly_score: 0.0,
            repository_criticality_score: 0.0,
            final_anomaly_score: 0.9,
            severity_level: SeverityLevel::Critical,
            primary_method: DetectionMethod::Content,
            behavioral_analysis: serde_json::json!({}),
            content_analysis: serde_json::json!({}),
            temporal_analysis: serde_json::json!({}),
            repository_context: serde_json::json!({}),
            high_risk_indicators: vec![],
            ai_summary: None,
            detection_timestamp: Utc::now(),
        };
        assert!(NoopSummarizer.summarize(&record).await.is_none());
    }
}
