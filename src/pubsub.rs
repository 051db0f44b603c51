//! Real-time fan-out of anomaly records and processing stats.

use anyhow::Result;
use async_nats::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::types::AnomalyRecord;

/// Per-batch statistics published on the `processing_stats` channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchStats {
    pub events_processed: u64,
    pub anomalies_detected: u64,
    pub batch_size: u64,
    pub dropped_by_priority: DroppedByPriority,
    pub detector_timeouts: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DroppedByPriority {
    pub low: u64,
    pub medium: u64,
    pub high: u64,
}

/// Publisher for anomaly channels keyed by severity, actor, and repository.
#[derive(Clone)]
pub struct AnomalyPublisher {
    client: Client,
}

impl AnomalyPublisher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Publish a record to every channel it belongs on:
    /// `anomalies`, `anomalies_<severity>`, `user_<actor_id>`, `repo_<repo_id>`.
    pub async fn publish(&self, record: &AnomalyRecord, actor_id: i64, repo_id: i64) -> Result<()> {
        let payload = serde_json::to_vec(record)?;

        let channels = [
            "anomalies".to_string(),
            format!("anomalies_{}", record.severity_level.as_str()),
            format!("user_{actor_id}"),
            format!("repo_{repo_id}"),
        ];

        for channel in channels {
            if let Err(e) = self
                .client
                .publish(channel.clone(), payload.clone().into())
                .await
            {
                // Fan-out is best effort; subscribers miss one message, the
                // persisted record remains authoritative.
                error!(channel = %channel, error = %e, "Failed to publish anomaly");
            }
        }

        debug!(
            event_id = %record.event_id,
            severity = record.severity_level.as_str(),
            score = record.final_anomaly_score,
            "Published anomaly record"
        );

        Ok(())
    }

    /// Publish one `processing_stats` message per batch.
    pub async fn publish_stats(&self, stats: &BatchStats) -> Result<()> {
        let payload = serde_json::to_vec(stats)?;
        self.client
            .publish("processing_stats".to_string(), payload.into())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_stats_wire_format() {
        let stats = BatchStats {
            events_processed: 50,
            anomalies_detected: 3,
            batch_size: 50,
            dropped_by_priority: DroppedByPriority {
                low: 12,
                medium: 1,
                high: 0,
            },
            detector_timeouts: 1,
        };

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["events_processed"], 50);
        assert_eq!(json["dropped_by_priority"]["low"], 12);
        assert_eq!(json["dropped_by_priority"]["high"], 0);
    }

    // Publishing against a live broker would require a running NATS server.
}
