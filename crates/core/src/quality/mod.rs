//! # Quality
//!
//! Scoring, ranking and gating of generated variants, plus generator/critic prompt refinement.

pub mod gate;
pub mod ranker;
pub mod refinement;
pub mod scorer;

pub use gate::{GateDecision, GateOutcome, QualityGate};
pub use ranker::{RankedBatch, RankingConfig, VariantCandidate, VariantKind, VariantRanker, VariantRequest};
pub use refinement::{Critique, PromptCritic, PromptRefiner, RefinedPrompt, RefinementConfig, StopReason};
pub use scorer::{QualityScorer, ScoreWeights};
