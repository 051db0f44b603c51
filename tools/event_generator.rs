//! Test Event Generator
//!
//! Generates and publishes synthetic GitHub-shaped events to the queue for
//! pipeline testing. Supports normal background traffic plus a few
//! suspicious scenarios (bursts, force pushes, leaked credentials).

use anyhow::Result;
use chrono::Utc;
use github_anomaly_pipeline::config::AppConfig;
use github_anomaly_pipeline::queue::EventQueue;
use github_anomaly_pipeline::types::{Actor, EventKind, RawEvent, Repository};
use rand::Rng;
use std::time::Duration;
use tracing::info;

struct EventGenerator {
    rng: rand::rngs::ThreadRng,
    counter: u64,
}

impl EventGenerator {
    fn new() -> Self {
        Self {
            rng: rand::thread_rng(),
            counter: 36_000_000_000,
        }
    }

    fn next_id(&mut self) -> String {
        self.counter += 1;
        self.counter.to_string()
    }

    fn random_actor(&mut self) -> Actor {
        let id = self.rng.gen_range(1..500);
        Actor {
            id,
            login: format!("dev-{id}"),
        }
    }

    fn random_repo(&mut self) -> Repository {
        let id = self.rng.gen_range(1..200);
        Repository {
            id,
            full_name: format!("acme/service-{id}"),
        }
    }

    /// An unremarkable push event.
    fn normal_push(&mut self) -> RawEvent {
        let payload = serde_json::json!({
            "ref": "refs/heads/main",
            "size": 1,
            "forced": false,
            "commits": [{
                "sha": format!("{:040x}", self.rng.gen::<u64>()),
                "message": "fix: adjust retry budget",
                "distinct": true,
            }],
        });
        self.event(EventKind::Push, payload)
    }

    /// A force push to the default branch.
    fn force_push(&mut self) -> RawEvent {
        let payload = serde_json::json!({
            "ref": "refs/heads/main",
            "size": 1,
            "forced": true,
            "commits": [{
                "sha": format!("{:040x}", self.rng.gen::<u64>()),
                "message": "rewrite history",
                "distinct": true,
            }],
        });
        self.event(EventKind::Push, payload)
    }

    /// A push whose commit message leaks an AWS-shaped access key.
    fn leaked_secret(&mut self) -> RawEvent {
        let suffix: String = (0..16)
            .map(|_| {
                let charset = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
                charset[self.rng.gen_range(0..charset.len())] as char
            })
            .collect();
        let payload = serde_json::json!({
            "ref": "refs/heads/main",
            "size": 1,
            "forced": false,
            "commits": [{
                "sha": format!("{:040x}", self.rng.gen::<u64>()),
                "message": format!("deploy config AKIA{suffix}"),
                "distinct": true,
            }],
        });
        self.event(EventKind::Push, payload)
    }

    /// A low-signal watch event.
    fn watch(&mut self) -> RawEvent {
        self.event(EventKind::Watch, serde_json::json!({"action": "started"}))
    }

    fn event(&mut self, kind: EventKind, payload: serde_json::Value) -> RawEvent {
        let priority = kind.priority();
        RawEvent {
            id: self.next_id(),
            kind,
            actor: self.random_actor(),
            repository: self.random_repo(),
            timestamp: Utc::now(),
            payload,
            priority,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    let config = AppConfig::load()?;
    let client = async_nats::connect(&config.nats.url).await?;
    let queue = EventQueue::connect(client, &config.nats).await?;
    info!(url = %config.nats.url, "Publishing synthetic events");

    let mut generator = EventGenerator::new();
    let block = Duration::from_secs(5);

    loop {
        let roll: f64 = rand::thread_rng().gen();
        let event = if roll < 0.02 {
            generator.force_push()
        } else if roll < 0.03 {
            generator.leaked_secret()
        } else if roll < 0.40 {
            generator.watch()
        } else {
            generator.normal_push()
        };

        let id = event.id.clone();
        let priority = event.priority;
        queue.enqueue(&event, block).await?;
        info!(event_id = %id, priority = priority.as_str(), "Published");

        // A burst window every so often, otherwise a steady trickle.
        if rand::thread_rng().gen::<f64>() < 0.05 {
            for _ in 0..15 {
                let event = generator.normal_push();
                queue.enqueue(&event, block).await?;
            }
            info!("Published burst of 15 events");
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}
