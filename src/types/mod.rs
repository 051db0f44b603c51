//! Type definitions for the anomaly detection pipeline

pub mod anomaly;
pub mod event;

pub use anomaly::{
    AnomalyFlag, AnomalyRecord, DetectionMethod, DetectorOutput, SeverityLevel, TemporalPattern,
};
pub use event::{
    Actor, Commit, DeletePayload, EventKind, EventPayload, Priority, PushPayload, RawEvent,
    Repository, WorkflowRunPayload,
};
