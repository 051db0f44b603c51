//! Score fusion: combine detector outputs into a final score and severity.

use serde::{Deserialize, Serialize};

use crate::detectors::clip;
use crate::types::{DetectionMethod, SeverityLevel};

/// Component weights over the three anomaly detectors.
const BEHAVIORAL_WEIGHT: f64 = 0.35;
const TEMPORAL_WEIGHT: f64 = 0.30;
const CONTENT_WEIGHT: f64 = 0.35;

/// How strongly repository criticality amplifies the base score.
const CRITICALITY_GAIN: f64 = 0.5;

/// Fused result for one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusedScore {
    pub base_score: f64,
    pub final_score: f64,
    pub severity: SeverityLevel,
    pub primary_method: DetectionMethod,
}

/// Combines component scores into a final score and severity bucket.
///
/// `base = 0.35·b + 0.30·t + 0.35·c`, then the repository criticality acts
/// as an amplifier: `final = clip(base · (1 + 0.5·r), 0, 1)`.
pub struct ScoreFuser;

impl ScoreFuser {
    pub fn new() -> Self {
        Self
    }

    /// Fuse the four component scores. Inputs are clamped to [0, 1] first so
    /// a misbehaving detector cannot push the final score out of range.
    pub fn fuse(&self, behavioral: f64, temporal: f64, content: f64, criticality: f64) -> FusedScore {
        let b = clip(behavioral, 0.0, 1.0);
        let t = clip(temporal, 0.0, 1.0);
        let c = clip(content, 0.0, 1.0);
        let r = clip(criticality, 0.0, 1.0);

        let base = BEHAVIORAL_WEIGHT * b + TEMPORAL_WEIGHT * t + CONTENT_WEIGHT * c;
        let final_score = clip(base * (1.0 + CRITICALITY_GAIN * r), 0.0, 1.0);

        FusedScore {
            base_score: base,
            final_score,
            severity: SeverityLevel::from_score(final_score),
            primary_method: Self::primary_method(b, t, c),
        }
    }

    /// The detector whose weighted contribution dominates; ties break in the
    /// order content > temporal > behavioral.
    fn primary_method(b: f64, t: f64, c: f64) -> DetectionMethod {
        let content = CONTENT_WEIGHT * c;
        let temporal = TEMPORAL_WEIGHT * t;
        let behavioral = BEHAVIORAL_WEIGHT * b;

        if content >= temporal && content >= behavioral {
            DetectionMethod::Content
        } else if temporal >= behavioral {
            DetectionMethod::Temporal
        } else {
            DetectionMethod::Behavioral
        }
    }
}

impl Default for ScoreFuser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_criticality_leaves_base() {
        let fused = ScoreFuser::new().fuse(0.4, 0.2, 0.6, 0.0);
        let expected = 0.35 * 0.4 + 0.30 * 0.2 + 0.35 * 0.6;
        assert!((fused.base_score - expected).abs() < 1e-12);
        assert_eq!(fused.base_score, fused.final_score);
    }

    #[test]
    fn test_criticality_amplifies() {
        let fuser = ScoreFuser::new();
        let flat = fuser.fuse(0.4, 0.2, 0.6, 0.0);
        let amplified = fuser.fuse(0.4, 0.2, 0.6, 0.8);
        assert!(amplified.final_score > flat.final_score);
        assert!((amplified.final_score - flat.base_score * 1.4).abs() < 1e-12);
    }

    #[test]
    fn test_monotone_in_each_component() {
        let fuser = ScoreFuser::new();
        let baseline = fuser.fuse(0.3, 0.3, 0.3, 0.5).final_score;
        assert!(fuser.fuse(0.5, 0.3, 0.3, 0.5).final_score > baseline);
        assert!(fuser.fuse(0.3, 0.5, 0.3, 0.5).final_score > baseline);
        assert!(fuser.fuse(0.3, 0.3, 0.5, 0.5).final_score > baseline);
    }

    #[test]
    fn test_final_clamped_to_one() {
        let fused = ScoreFuser::new().fuse(1.0, 1.0, 1.0, 1.0);
        assert_eq!(fused.final_score, 1.0);
        assert_eq!(fused.severity, SeverityLevel::Critical);
    }

    #[test]
    fn test_out_of_range_inputs_are_clamped() {
        let fused = ScoreFuser::new().fuse(7.0, -3.0, 2.0, 9.0);
        assert!((0.0..=1.0).contains(&fused.final_score));
    }

    #[test]
    fn test_primary_method_tie_break() {
        // All equal: content wins the tie.
        let fused = ScoreFuser::new().fuse(0.0, 0.0, 0.0, 0.0);
        assert_eq!(fused.primary_method, DetectionMethod::Content);

        // Behavioral and temporal weighted equal (0.35·0.6 = 0.30·0.7): temporal wins.
        let fused = ScoreFuser::new().fuse(0.6, 0.7, 0.0, 0.0);
        assert_eq!(fused.primary_method, DetectionMethod::Temporal);

        let fused = ScoreFuser::new().fuse(0.9, 0.1, 0.1, 0.0);
        assert_eq!(fused.primary_method, DetectionMethod::Behavioral);
    }

    #[test]
    fn test_force_push_scenario() {
        // Content 0.8 on a mid-criticality repo lands at MEDIUM or above.
        let fused = ScoreFuser::new().fuse(0.05, 0.0, 0.8, 0.5);
        assert!(fused.final_score >= 0.35);
        assert_eq!(fused.primary_method, DetectionMethod::Content);
    }
}
