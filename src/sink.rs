//! Persistence sink for events, anomaly records, and temporal patterns.

use anyhow::{Context, Result};
use rusqlite::params;
use uuid::Uuid;

use crate::storage::Pool;
use crate::types::{AnomalyRecord, RawEvent, TemporalPattern};

/// Writes detections to SQLite. Every write is idempotent on the event id,
/// which is what makes at-least-once delivery safe upstream.
#[derive(Clone)]
pub struct DetectionSink {
    pool: Pool,
}

impl DetectionSink {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Persist the event itself; a duplicate id is a no-op.
    pub async fn persist_event(&self, event: &RawEvent) -> Result<()> {
        let pool = self.pool.clone();
        let id = event.id.clone();
        let event_type = event.kind.as_str().to_string();
        let repo_name = event.repository.full_name.clone();
        let actor_login = event.actor.login.clone();
        let created_at = event.timestamp.to_rfc3339();
        let payload = serde_json::to_string(&event.payload)?;

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = pool.get()?;
            conn.execute(
                "INSERT OR IGNORE INTO events
                     (id, event_type, repo_name, actor_login, created_at, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, event_type, repo_name, actor_login, created_at, payload],
            )?;
            Ok(())
        })
        .await
        .context("event persist task panicked")?
    }

    /// Persist an anomaly record; returns true when this call inserted it,
    /// false when a record for the event id already existed.
    pub async fn persist_anomaly(&self, record: &AnomalyRecord) -> Result<bool> {
        let pool = self.pool.clone();
        let record = record.clone();

        tokio::task::spawn_blocking(move || -> Result<bool> {
            let conn = pool.get()?;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO anomalies
                     (event_id, repository_name, user_login, event_type, event_timestamp,
                      behavioral_anomaly_score, content_risk_score, temporal_anomaly_score,
                      repository_criticality_score, final_anomaly_score, severity_level,
                      primary_method, behavioral_analysis, content_analysis,
                      temporal_analysis, repository_context, high_risk_indicators,
                      ai_summary, detection_timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                         ?15, ?16, ?17, ?18, ?19)",
                params![
                    record.event_id,
                    record.repository_name,
                    record.user_login,
                    record.event_type,
                    record.timestamp.to_rfc3339(),
                    record.behavioral_anomaly_score,
                    record.content_risk_score,
                    record.temporal_anomaly_score,
                    record.repository_criticality_score,
                    record.final_anomaly_score,
                    record.severity_level.as_str(),
                    record.primary_method.as_str(),
                    record.behavioral_analysis.to_string(),
                    record.content_analysis.to_string(),
                    record.temporal_analysis.to_string(),
                    record.repository_context.to_string(),
                    serde_json::to_string(&record.high_risk_indicators)?,
                    record.ai_summary,
                    record.detection_timestamp.to_rfc3339(),
                ],
            )?;
            Ok(inserted > 0)
        })
        .await
        .context("anomaly persist task panicked")?
    }

    /// Persist temporal patterns attached to an event's record.
    pub async fn persist_patterns(&self, event_id: &str, patterns: &[TemporalPattern]) -> Result<()> {
        if patterns.is_empty() {
            return Ok(());
        }

        let pool = self.pool.clone();
        let event_id = event_id.to_string();
        let patterns = patterns.to_vec();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = pool.get()?;
            let tx = conn.transaction()?;
            for pattern in &patterns {
                tx.execute(
                    "INSERT INTO temporal_patterns
                         (id, event_id, pattern_type, severity, start_time,
                          duration_minutes, event_count, actor_count,
                          events_per_minute, p_value)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        Uuid::new_v4().to_string(),
                        event_id,
                        pattern.kind,
                        pattern.severity,
                        pattern.start_time.to_rfc3339(),
                        pattern.duration_minutes,
                        pattern.event_count,
                        pattern.actor_count,
                        pattern.events_per_minute,
                        pattern.p_value,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
        .context("pattern persist task panicked")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_memory_pool;
    use crate::types::{DetectionMethod, SeverityLevel};
    use chrono::Utc;

    fn record(event_id: &str) -> AnomalyRecord {
        AnomalyRecord {
            event_id: event_id.to_string(),
            repository_name: "octocat/hello-world".to_string(),
            user_login: "octocat".to_string(),
            event_type: "PushEvent".to_string(),
            timestamp: Utc::now(),
            behavioral_anomaly_score: 0.1,
            content_risk_score: 0.8,
            temporal_anomaly_score: 0.0,
            repository_criticality_score: 0.5,
            final_anomaly_score: 0.42,
            severity_level: SeverityLevel::Medium,
            primary_method: DetectionMethod::Content,
            behavioral_analysis: serde_json::json!({}),
            content_analysis: serde_json::json!({}),
            temporal_analysis: serde_json::json!({}),
            repository_context: serde_json::json!({}),
            high_risk_indicators: vec![],
            ai_summary: None,
            detection_timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_anomaly_write_is_idempotent() {
        let sink = DetectionSink::new(open_memory_pool().unwrap());

        assert!(sink.persist_anomaly(&record("e1")).await.unwrap());
        // Second write for the same event id is a no-op.
        assert!(!sink.persist_anomaly(&record("e1")).await.unwrap());
        assert!(sink.persist_anomaly(&record("e2")).await.unwrap());
    }

    #[tokio::test]
    async fn test_event_write_is_idempotent() {
        use crate::types::{Actor, EventKind, Priority, Repository};

        let sink = DetectionSink::new(open_memory_pool().unwrap());
        let event = RawEvent {
            id: "e1".to_string(),
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
        };

        sink.persist_event(&event).await.unwrap();
        sink.persist_event(&event).await.unwrap();

        let pool = sink.pool.clone();
        let count: i64 = tokio::task::spawn_blocking(move || {
            let conn = pool.get().unwrap();
            conn.query_row("SELECT count(*) FROM events", [], |row| row.get(0))
                .unwrap()
        })
        .await
        .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_patterns_persist() {
        let sink = DetectionSink::new(open_memory_pool().unwrap());
        let patterns = vec![TemporalPattern {
            kind: "activity_burst".to_string(),
            start_time: Utc::now(),
            duration_minutes: 5,
            event_count: 12,
            actor_count: None,
            events_per_minute: Some(2.4),
            p_value: None,
            severity: 0.75,
        }];

        sink.persist_patterns("e1", &patterns).await.unwrap();

        let pool = sink.pool.clone();
        let count: i64 = tokio::task::spawn_blocking(move || {
            let conn = pool.get().unwrap();
            conn.query_row("SELECT count(*) FROM temporal_patterns", [], |row| row.get(0))
                .unwrap()
        })
        .await
        .unwrap();
        assert_eq!(count, 1);
    }
}
