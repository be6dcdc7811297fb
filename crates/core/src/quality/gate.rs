//! Quality gate policy.
//!
//! The gate never blocks: a best candidate under the threshold is still accepted, and the
//! decision records that it was below threshold so callers can log and surface it.

use serde::{Deserialize, Serialize};

use crate::error::ForgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Passed,
    BelowThreshold,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    /// Whether the selected candidate may proceed (always true, the gate fails open)
    pub accept: bool,
    pub outcome: GateOutcome,
    pub best_score: f32,
    pub threshold: f32,
    pub reason: String,
}

impl GateDecision {
    pub fn below_threshold(&self) -> bool {
        self.outcome == GateOutcome::BelowThreshold
    }

    /// The warning carried by a below-threshold decision
    pub fn warning(&self) -> Option<ForgeError> {
        self.below_threshold().then_some(ForgeError::QualityBelowThreshold {
            best: self.best_score,
            threshold: self.threshold,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityGate {
    threshold: f32,
}

impl QualityGate {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn evaluate(&self, best_score: f32) -> GateDecision {
        if best_score >= self.threshold {
            GateDecision {
                accept: true,
                outcome: GateOutcome::Passed,
                best_score,
                threshold: self.threshold,
                reason: format!("Best score {:.3} meets threshold {:.3}", best_score, self.threshold),
            }
        } else {
            GateDecision {
                accept: true,
                outcome: GateOutcome::BelowThreshold,
                best_score,
                threshold: self.threshold,
                reason: format!(
                    "Best score {:.3} is below threshold {:.3}; proceeding with best available",
                    best_score, self.threshold
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_passes_at_threshold() {
        let decision = QualityGate::new(0.6).evaluate(0.6);
        assert!(decision.accept);
        assert_eq!(decision.outcome, GateOutcome::Passed);
        assert!(decision.warning().is_none());
    }

    #[test]
    fn test_gate_fails_open() {
        let decision = QualityGate::new(0.9).evaluate(0.2);
        assert!(decision.accept);
        assert!(decision.below_threshold());
        assert!(matches!(
            decision.warning(),
            Some(ForgeError::QualityBelowThreshold { .. })
        ));
    }

    #[test]
    fn test_threshold_clamped() {
        assert_eq!(QualityGate::new(3.0).threshold(), 1.0);
        assert_eq!(QualityGate::new(-1.0).threshold(), 0.0);
    }
}
