//! The four detection engines and their shared input.
//!
//! Detectors are pure CPU-bound functions over a pre-fetched snapshot of
//! `(event, profiles, windows)`; they never touch I/O and never propagate
//! errors. The stream processor runs them concurrently under a shared
//! deadline and treats a timeout as score 0.

pub mod behavioral;
pub mod content;
pub mod contextual;
pub mod temporal;

pub use behavioral::BehavioralDetector;
pub use content::ContentDetector;
pub use contextual::ContextualDetector;
pub use temporal::TemporalDetector;

use crate::history::{ActorEvent, RepoEvent};
use crate::profiles::{RepositoryProfile, UserProfile};
use crate::types::{DetectorOutput, EventPayload, RawEvent};

/// Everything a detector may read, snapshotted before launch.
pub struct DetectionInput {
    pub event: RawEvent,
    pub payload: EventPayload,
    pub user: UserProfile,
    pub repo: RepositoryProfile,
    /// Actor activity over the last 24 h, current event included.
    pub actor_events: Vec<ActorEvent>,
    /// Repository activity over the last hour, current event included.
    pub repo_events: Vec<RepoEvent>,
    /// Behavioral feature vector, extracted once per event.
    pub behavioral_features: Vec<f64>,
}

/// A detection engine producing a component score in [0, 1].
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;

    fn analyze(&self, input: &DetectionInput) -> DetectorOutput;
}

/// Clamp a value into `[lo, hi]`.
pub fn clip(x: f64, lo: f64, hi: f64) -> f64 {
    x.max(lo).min(hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip() {
        assert_eq!(clip(-0.5, 0.0, 1.0), 0.0);
        assert_eq!(clip(0.4, 0.0, 1.0), 0.4);
        assert_eq!(clip(7.0, 0.0, 1.0), 1.0);
    }
}
