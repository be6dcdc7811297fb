//! Weighted overall score from the per-axis breakdown.

use serde::{Deserialize, Serialize};

use crate::generation::ScoreBreakdown;

/// Axis weights; normalised at scoring time so they need not sum to 1
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub preference: f32,
    pub text_alignment: f32,
    pub aesthetic: f32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            preference: 0.5,
            text_alignment: 0.3,
            aesthetic: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QualityScorer {
    weights: ScoreWeights,
}

fn unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

impl QualityScorer {
    pub fn new(weights: ScoreWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> ScoreWeights {
        self.weights
    }

    /// Overall score in `[0, 1]`. Axes are clamped; negative weights count as zero.
    pub fn overall(&self, scores: &ScoreBreakdown) -> f32 {
        let w = [
            self.weights.preference.max(0.0),
            self.weights.text_alignment.max(0.0),
            self.weights.aesthetic.max(0.0),
        ];
        let total: f32 = w.iter().sum();
        if total <= f32::EPSILON {
            return 0.0;
        }
        let weighted = w[0] * unit(scores.preference)
            + w[1] * unit(scores.text_alignment)
            + w[2] * unit(scores.aesthetic);
        unit(weighted / total)
    }
}
