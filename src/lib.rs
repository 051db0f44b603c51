//! GitHub Activity Anomaly Detection Pipeline
//!
//! Ingests the public event stream, scores each event against behavioral,
//! temporal, content, and repository-context baselines, and fans detections
//! out to subscribers in near real time.

pub mod config;
pub mod detectors;
pub mod fuser;
pub mod history;
pub mod poller;
pub mod processor;
pub mod profiles;
pub mod pubsub;
pub mod queue;
pub mod sink;
pub mod stats;
pub mod storage;
pub mod summarizer;
pub mod types;

pub use config::AppConfig;
pub use fuser::ScoreFuser;
pub use processor::StreamProcessor;
pub use profiles::ProfileStore;
pub use types::{AnomalyRecord, RawEvent, SeverityLevel};
