//! # Variant Ranker
//!
//! Fans out K independent generations, scores each one, and orders them best-first.
//! Every variant of a seeded request carries the same session seed.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::gate::{GateDecision, QualityGate};
use super::scorer::{QualityScorer, ScoreWeights};
use crate::coherence::seed::with_seed_fallback;
use crate::error::{ForgeError, ForgeResult, GenerationError};
use crate::generation::{ArtifactRef, Candidate, GenerationAdapter, ScoreBreakdown};

/// Ranking defaults; per-session overrides live on the session's quality profile
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RankingConfig {
    pub text_variants: usize,
    pub image_variants: usize,
    pub video_variants: usize,
    pub quality_threshold: f32,
    pub weights: ScoreWeights,
    /// Cost units charged per text generation call
    pub text_call_cost: f64,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            text_variants: 2,
            image_variants: 4,
            video_variants: 2,
            quality_threshold: 0.55,
            weights: ScoreWeights::default(),
            text_call_cost: 0.1,
        }
    }
}

/// What each variant generates
#[derive(Debug, Clone, PartialEq)]
pub enum VariantKind {
    /// Text with the given system instructions
    Text { instructions: String },
    Image,
    Video,
}

#[derive(Debug, Clone)]
pub struct VariantRequest {
    pub kind: VariantKind,
    pub prompt: String,
    pub conditioning: Vec<ArtifactRef>,
    pub k: usize,
    pub seed: Option<u64>,
}

/// A scored candidate with its position in the batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantCandidate {
    pub candidate: Candidate,
    pub scores: ScoreBreakdown,
    pub overall: f32,
    /// 1-based rank, 1 is selected
    pub rank: usize,
}

/// Ranked result of one fan-out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedBatch {
    /// Best first
    pub candidates: Vec<VariantCandidate>,
    pub decision: GateDecision,
    /// Variants dropped because generation or scoring failed
    pub failures: usize,
    /// Total cost of every generated candidate
    pub cost: f64,
}

impl RankedBatch {
    pub fn selected(&self) -> Option<&VariantCandidate> {
        self.candidates.first()
    }
}

pub struct VariantRanker {
    adapter: Arc<dyn GenerationAdapter>,
    scorer: QualityScorer,
    text_call_cost: f64,
}

impl VariantRanker {
    pub fn new(adapter: Arc<dyn GenerationAdapter>, config: &RankingConfig) -> Self {
        Self {
            adapter,
            scorer: QualityScorer::new(config.weights),
            text_call_cost: config.text_call_cost,
        }
    }

    pub fn adapter(&self) -> Arc<dyn GenerationAdapter> {
        Arc::clone(&self.adapter)
    }

    #[tracing::instrument(skip_all, fields(k = request.k, kind = ?request.kind))]
    pub async fn rank(
        &self,
        request: VariantRequest,
        gate: &QualityGate,
        cancel: &CancellationToken,
    ) -> ForgeResult<RankedBatch> {
        if request.k == 0 {
            return Err(ForgeError::validation("Variant count must be at least 1"));
        }
        let total = request.k;
        let mut join_set = JoinSet::new();

        // SCATTER
        for index in 0..total {
            let adapter = Arc::clone(&self.adapter);
            let kind = request.kind.clone();
            let prompt = request.prompt.clone();
            let conditioning = request.conditioning.clone();
            let seed = request.seed;
            let text_cost = self.text_call_cost;

            join_set.spawn(async move {
                let result =
                    generate_and_score(adapter, kind, prompt, conditioning, seed, text_cost).await;
                (index, result)
            });
        }

        // GATHER
        let mut scored: Vec<(usize, Candidate, ScoreBreakdown)> = Vec::with_capacity(total);
        let mut errors = Vec::new();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    join_set.abort_all();
                    return Err(ForgeError::Cancelled);
                }
                next = join_set.join_next() => next,
            };
            match next {
                Some(Ok((index, Ok((candidate, scores))))) => scored.push((index, candidate, scores)),
                Some(Ok((index, Err(e)))) => errors.push(format!("variant {}: {}", index, e)),
                Some(Err(e)) => errors.push(format!("Task panicked: {}", e)),
                None => break,
            }
        }

        if !errors.is_empty() {
            tracing::warn!(
                "Ranking dropped {} of {} variants: {:?}",
                errors.len(),
                total,
                errors
            );
        }
        if scored.is_empty() {
            return Err(ForgeError::upstream(format!(
                "All {} variants failed: {}",
                total,
                errors.join("; ")
            )));
        }

        // Fan-out index order first so the sort below breaks ties stably
        scored.sort_by_key(|(index, _, _)| *index);
        let cost = scored.iter().map(|(_, c, _)| c.cost).sum();
        let mut candidates: Vec<VariantCandidate> = scored
            .into_iter()
            .map(|(_, candidate, scores)| VariantCandidate {
                overall: self.scorer.overall(&scores),
                candidate,
                scores,
                rank: 0,
            })
            .collect();
        candidates.sort_by(|a, b| b.overall.partial_cmp(&a.overall).unwrap_or(Ordering::Equal));
        for (position, candidate) in candidates.iter_mut().enumerate() {
            candidate.rank = position + 1;
        }

        let best = candidates.first().map(|c| c.overall).unwrap_or(0.0);
        let decision = gate.evaluate(best);
        if decision.below_threshold() {
            tracing::warn!(
                best_score = decision.best_score,
                threshold = decision.threshold,
                "Quality gate: {}",
                decision.reason
            );
        }

        Ok(RankedBatch {
            candidates,
            decision,
            failures: errors.len(),
            cost,
        })
    }
}

async fn generate_and_score(
    adapter: Arc<dyn GenerationAdapter>,
    kind: VariantKind,
    prompt: String,
    conditioning: Vec<ArtifactRef>,
    seed: Option<u64>,
    text_cost: f64,
) -> Result<(Candidate, ScoreBreakdown), GenerationError> {
    let candidate = match kind {
        VariantKind::Text { instructions } => {
            let text = adapter.generate_text(&prompt, &instructions).await?;
            Candidate::text(&prompt, text, text_cost)
        }
        VariantKind::Image => {
            let batch = with_seed_fallback(seed, |seed| {
                let adapter = Arc::clone(&adapter);
                let prompt = prompt.clone();
                let conditioning = conditioning.clone();
                async move {
                    adapter
                        .generate_image_variants(&prompt, &conditioning, 1, seed)
                        .await
                }
            })
            .await?;
            batch
                .into_iter()
                .next()
                .ok_or_else(|| GenerationError::Malformed("Adapter returned no image".into()))?
        }
        VariantKind::Video => {
            with_seed_fallback(seed, |seed| {
                let adapter = Arc::clone(&adapter);
                let prompt = prompt.clone();
                let conditioning = conditioning.clone();
                async move { adapter.generate_video(&prompt, &conditioning, seed).await }
            })
            .await?
        }
    };
    let scores = adapter.score_variant(&candidate).await?;
    Ok((candidate, scores))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::{ArtifactKind, ScriptedAdapter};

    fn ranker(adapter: Arc<ScriptedAdapter>) -> VariantRanker {
        VariantRanker::new(adapter, &RankingConfig::default())
    }

    fn image_request(k: usize, seed: Option<u64>) -> VariantRequest {
        VariantRequest {
            kind: VariantKind::Image,
            prompt: "a red kite over dunes".into(),
            conditioning: vec![],
            k,
            seed,
        }
    }

    #[tokio::test]
    async fn test_selects_maximum_score() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.push_scores([
            ScoreBreakdown::new(0.2, 0.2, 0.2),
            ScoreBreakdown::new(0.9, 0.8, 0.7),
            ScoreBreakdown::new(0.5, 0.5, 0.5),
            ScoreBreakdown::new(0.1, 0.9, 0.3),
        ]);
        let batch = ranker(adapter)
            .rank(image_request(4, None), &QualityGate::new(0.5), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(batch.candidates.len(), 4);
        let best = batch.selected().unwrap();
        assert_eq!(best.rank, 1);
        assert!(batch.candidates.iter().all(|c| c.overall <= best.overall));
        assert!((best.overall - (0.45 + 0.24 + 0.14)).abs() < 1e-5);
        for pair in batch.candidates.windows(2) {
            assert!(pair[0].overall >= pair[1].overall);
            assert_eq!(pair[0].rank + 1, pair[1].rank);
        }
        assert_eq!(batch.cost, 4.0);
    }

    #[tokio::test]
    async fn test_partial_failures_tolerated() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.fail_next_media(2);
        let batch = ranker(adapter)
            .rank(image_request(4, None), &QualityGate::new(0.0), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(batch.candidates.len(), 2);
        assert_eq!(batch.failures, 2);
    }

    #[tokio::test]
    async fn test_all_failures_is_upstream_error() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.fail_next_media(3);
        let err = ranker(adapter)
            .rank(image_request(3, None), &QualityGate::new(0.0), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "upstream_generation_error");
        assert!(err.recoverable());
    }

    #[tokio::test]
    async fn test_below_threshold_still_selects() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.push_scores([ScoreBreakdown::new(0.1, 0.1, 0.1)]);
        let batch = ranker(adapter)
            .rank(image_request(1, None), &QualityGate::new(0.9), &CancellationToken::new())
            .await
            .unwrap();
        assert!(batch.decision.accept);
        assert!(batch.decision.below_threshold());
        assert!(batch.selected().is_some());
    }

    #[tokio::test]
    async fn test_seed_rejection_falls_back_unseeded() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.reject_seeds(true);
        let batch = ranker(Arc::clone(&adapter))
            .rank(
                VariantRequest {
                    kind: VariantKind::Video,
                    prompt: "clip".into(),
                    conditioning: vec![],
                    k: 2,
                    seed: Some(9),
                },
                &QualityGate::new(0.0),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(batch.candidates.len(), 2);
        assert!(batch.candidates.iter().all(|c| c.candidate.seed.is_none()));
        // one rejected seeded attempt plus one unseeded retry per variant
        assert_eq!(adapter.calls_of(ArtifactKind::Video).len(), 4);
    }

    #[tokio::test]
    async fn test_cancel_aborts_fan_out() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.set_delay(std::time::Duration::from_secs(30));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = ranker(adapter)
            .rank(image_request(2, None), &QualityGate::new(0.0), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, ForgeError::Cancelled);
    }

    #[tokio::test]
    async fn test_text_variants_carry_inline_content() {
        let adapter = Arc::new(ScriptedAdapter::new());
        let batch = ranker(adapter)
            .rank(
                VariantRequest {
                    kind: VariantKind::Text {
                        instructions: String::new(),
                    },
                    prompt: "a heist".into(),
                    conditioning: vec![],
                    k: 2,
                    seed: None,
                },
                &QualityGate::new(0.0),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let best = batch.selected().unwrap();
        assert_eq!(best.candidate.artifact.kind, ArtifactKind::Text);
        assert!(best.candidate.text.as_deref().unwrap().contains("a heist"));
    }
}
