//! Durable at-least-once event queue over NATS JetStream.

use anyhow::{Context as _, Result};
use async_nats::jetstream::{self, consumer};
use futures::StreamExt;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::NatsConfig;
use crate::types::{Priority, RawEvent};

/// Durable consumer name shared by stream processor instances.
const CONSUMER_NAME: &str = "stream-processor";

/// Outcome of an enqueue attempt under backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// Dropped under the backpressure policy (never for high priority).
    Dropped,
}

/// Producer/consumer handle for the event stream.
#[derive(Clone)]
pub struct EventQueue {
    jetstream: jetstream::Context,
    subject_prefix: String,
}

impl EventQueue {
    /// Ensure the backing stream exists and return a queue handle.
    pub async fn connect(client: async_nats::Client, config: &NatsConfig) -> Result<Self> {
        let jetstream = jetstream::new(client);

        // DiscardPolicy::New makes a full stream reject publishes instead of
        // silently evicting the oldest message; the enqueue() drop policy
        // below depends on that rejection. The default (discard old) would
        // let a new low-priority publish evict an unprocessed high-priority
        // message.
        jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: config.event_stream.clone(),
                subjects: vec![format!("{}.>", config.event_subject_prefix)],
                max_messages: config.queue_capacity,
                discard: jetstream::stream::DiscardPolicy::New,
                ..Default::default()
            })
            .await
            .map_err(|e| anyhow::anyhow!("failed to create event stream: {e}"))?;

        info!(
            stream = %config.event_stream,
            capacity = config.queue_capacity,
            "Event queue ready"
        );

        Ok(Self {
            jetstream,
            subject_prefix: config.event_subject_prefix.clone(),
        })
    }

    fn subject(&self, priority: Priority) -> String {
        format!("{}.{}", self.subject_prefix, priority.as_str())
    }

    /// Enqueue one event.
    ///
    /// High-priority events wait as long as it takes; medium and low are
    /// dropped once the publish has blocked longer than `block`.
    pub async fn enqueue(&self, event: &RawEvent, block: Duration) -> Result<EnqueueOutcome> {
        let subject = self.subject(event.priority);
        let payload = serde_json::to_vec(event).context("failed to serialize event")?;

        match event.priority {
            Priority::High => {
                loop {
                    match timeout(block, self.publish(&subject, payload.clone())).await {
                        Ok(Ok(())) => return Ok(EnqueueOutcome::Enqueued),
                        Ok(Err(e)) => {
                            warn!(event_id = %event.id, error = %e, "High-priority enqueue failed, retrying");
                            tokio::time::sleep(Duration::from_millis(250)).await;
                        }
                        Err(_) => {
                            warn!(event_id = %event.id, "High-priority enqueue blocked, waiting");
                        }
                    }
                }
            }
            Priority::Medium | Priority::Low => {
                match timeout(block, self.publish(&subject, payload)).await {
                    Ok(Ok(())) => Ok(EnqueueOutcome::Enqueued),
                    Ok(Err(e)) => {
                        debug!(event_id = %event.id, error = %e, "Enqueue failed, dropping");
                        Ok(EnqueueOutcome::Dropped)
                    }
                    Err(_) => Ok(EnqueueOutcome::Dropped),
                }
            }
        }
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        self.jetstream
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| anyhow::anyhow!("publish failed: {e}"))?
            .await
            .map_err(|e| anyhow::anyhow!("publish unacknowledged: {e}"))?;
        Ok(())
    }

    /// Create (or attach to) the durable pull consumer.
    pub async fn consumer(&self, stream_name: &str) -> Result<QueueConsumer> {
        let stream = self
            .jetstream
            .get_stream(stream_name)
            .await
            .map_err(|e| anyhow::anyhow!("failed to open stream: {e}"))?;

        let consumer = stream
            .get_or_create_consumer(
                CONSUMER_NAME,
                consumer::pull::Config {
                    durable_name: Some(CONSUMER_NAME.to_string()),
                    ack_policy: consumer::AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| anyhow::anyhow!("failed to create consumer: {e}"))?;

        Ok(QueueConsumer { consumer })
    }
}

/// A queued event together with its delivery handle.
pub struct QueuedEvent {
    pub event: RawEvent,
    message: jetstream::Message,
}

impl QueuedEvent {
    /// Acknowledge after the event has been fully processed; unacked
    /// messages are redelivered (at-least-once).
    pub async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| anyhow::anyhow!("ack failed: {e}"))
    }
}

/// Pull consumer yielding decoded batches.
pub struct QueueConsumer {
    consumer: consumer::PullConsumer,
}

impl QueueConsumer {
    /// Fetch a batch of up to `max` events, waiting at most `max_wait`.
    ///
    /// Returns the decoded events plus the count of corrupt messages that
    /// were acked away.
    pub async fn fetch(&self, max: usize, max_wait: Duration) -> Result<(Vec<QueuedEvent>, u64)> {
        let mut batch = self
            .consumer
            .batch()
            .max_messages(max)
            .expires(max_wait)
            .messages()
            .await
            .map_err(|e| anyhow::anyhow!("batch request failed: {e}"))?;

        let mut events = Vec::new();
        let mut corrupt = 0u64;

        while let Some(message) = batch.next().await {
            let message = match message {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "Batch delivery error");
                    break;
                }
            };

            match serde_json::from_slice::<RawEvent>(&message.payload) {
                Ok(event) if event.is_well_formed() => {
                    events.push(QueuedEvent { event, message });
                }
                _ => {
                    corrupt += 1;
                    // Acking a corrupt message keeps it from redelivering forever.
                    if let Err(e) = message.ack().await {
                        warn!(error = %e, "Failed to ack corrupt message");
                    }
                }
            }
        }

        Ok((events, corrupt))
    }
}

#[cfg(test)]
mod tests {
    // Queue behavior against a live broker is covered by integration
    // deployments; a running NATS server with JetStream would be required
    // here.
}
