//! # Prompt Refinement
//!
//! Generator + critic loop over image prompts. The critic scores the current prompt; the
//! generator rewrites it from the critic's feedback. The loop stops when the critic is
//! satisfied, when a round improves the score by less than `min_improvement`, or after
//! `max_iterations` rewrites.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::generation::{prompts, GenerationAdapter};
use crate::error::GenerationError;

#[derive(Debug, Clone, PartialEq)]
pub struct Critique {
    /// Prompt quality in `[0, 1]`
    pub score: f32,
    pub feedback: String,
}

#[async_trait]
pub trait PromptCritic: Send + Sync {
    async fn critique(&self, prompt: &str, goal: &str) -> Result<Critique, GenerationError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RefinementConfig {
    pub enabled: bool,
    pub max_iterations: u32,
    pub accept_threshold: f32,
    pub min_improvement: f32,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_iterations: 3,
            accept_threshold: 0.8,
            min_improvement: 0.02,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Accepted,
    Converged,
    MaxIterations,
    /// Critic unavailable; the last good prompt is kept
    CriticFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinedPrompt {
    pub prompt: String,
    pub score: f32,
    /// Rewrites performed
    pub rounds: u32,
    pub stop_reason: StopReason,
}

pub struct PromptRefiner {
    adapter: Arc<dyn GenerationAdapter>,
    critic: Arc<dyn PromptCritic>,
    config: RefinementConfig,
}

impl PromptRefiner {
    pub fn new(
        adapter: Arc<dyn GenerationAdapter>,
        critic: Arc<dyn PromptCritic>,
        config: RefinementConfig,
    ) -> Self {
        Self {
            adapter,
            critic,
            config,
        }
    }

    #[tracing::instrument(skip_all)]
    pub async fn refine(&self, draft: &str, goal: &str) -> RefinedPrompt {
        let mut current = draft.to_string();
        let mut critique = match self.critic.critique(&current, goal).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("Prompt critic failed, using draft prompt: {}", e);
                return RefinedPrompt {
                    prompt: current,
                    score: 0.0,
                    rounds: 0,
                    stop_reason: StopReason::CriticFailed,
                };
            }
        };
        let mut rounds = 0;

        loop {
            if critique.score >= self.config.accept_threshold {
                return self.finish(current, critique.score, rounds, StopReason::Accepted);
            }
            if rounds >= self.config.max_iterations {
                return self.finish(current, critique.score, rounds, StopReason::MaxIterations);
            }

            let request = format!(
                "Original prompt:\n{}\n\nGoal:\n{}\n\nCritic feedback:\n{}",
                current, goal, critique.feedback
            );
            let rewritten = match self.adapter.generate_text(&request, prompts::REFINER).await {
                Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
                Ok(_) | Err(_) => {
                    tracing::warn!(round = rounds + 1, "Prompt rewrite failed, keeping current prompt");
                    return self.finish(current, critique.score, rounds, StopReason::Converged);
                }
            };
            rounds += 1;

            let next = match self.critic.critique(&rewritten, goal).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("Prompt critic failed mid-refinement: {}", e);
                    return self.finish(current, critique.score, rounds, StopReason::CriticFailed);
                }
            };
            tracing::debug!(round = rounds, before = critique.score, after = next.score, "Refinement round");

            let improvement = next.score - critique.score;
            if improvement < self.config.min_improvement {
                // Keep whichever version scored higher
                if next.score > critique.score {
                    return self.finish(rewritten, next.score, rounds, StopReason::Converged);
                }
                return self.finish(current, critique.score, rounds, StopReason::Converged);
            }
            current = rewritten;
            critique = next;
        }
    }

    fn finish(&self, prompt: String, score: f32, rounds: u32, stop_reason: StopReason) -> RefinedPrompt {
        tracing::info!(rounds, score, ?stop_reason, "Prompt refinement finished");
        RefinedPrompt {
            prompt,
            score,
            rounds,
            stop_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::ScriptedAdapter;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct QueueCritic {
        scores: Mutex<VecDeque<Result<f32, GenerationError>>>,
    }

    impl QueueCritic {
        fn new(scores: Vec<Result<f32, GenerationError>>) -> Arc<Self> {
            Arc::new(Self {
                scores: Mutex::new(scores.into()),
            })
        }
    }

    #[async_trait]
    impl PromptCritic for QueueCritic {
        async fn critique(&self, _prompt: &str, _goal: &str) -> Result<Critique, GenerationError> {
            let next = self.scores.lock().unwrap().pop_front().unwrap_or(Ok(0.0));
            next.map(|score| Critique {
                score,
                feedback: "add lighting".into(),
            })
        }
    }

    fn refiner(critic: Arc<QueueCritic>) -> PromptRefiner {
        PromptRefiner::new(
            Arc::new(ScriptedAdapter::new()),
            critic,
            RefinementConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_accepts_good_draft_without_rewrite() {
        let refined = refiner(QueueCritic::new(vec![Ok(0.9)]))
            .refine("a castle at dusk", "castle")
            .await;
        assert_eq!(refined.rounds, 0);
        assert_eq!(refined.stop_reason, StopReason::Accepted);
        assert_eq!(refined.prompt, "a castle at dusk");
    }

    #[tokio::test]
    async fn test_improves_until_accepted() {
        let refined = refiner(QueueCritic::new(vec![Ok(0.3), Ok(0.6), Ok(0.85)]))
            .refine("castle", "castle")
            .await;
        assert_eq!(refined.rounds, 2);
        assert_eq!(refined.stop_reason, StopReason::Accepted);
        assert_ne!(refined.prompt, "castle");
    }

    #[tokio::test]
    async fn test_stops_when_converged() {
        let refined = refiner(QueueCritic::new(vec![Ok(0.4), Ok(0.41)]))
            .refine("castle", "castle")
            .await;
        assert_eq!(refined.rounds, 1);
        assert_eq!(refined.stop_reason, StopReason::Converged);
        assert!((refined.score - 0.41).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_bounded_by_max_iterations() {
        let refined = refiner(QueueCritic::new(vec![Ok(0.1), Ok(0.2), Ok(0.3), Ok(0.4), Ok(0.5)]))
            .refine("castle", "castle")
            .await;
        assert_eq!(refined.rounds, 3);
        assert_eq!(refined.stop_reason, StopReason::MaxIterations);
        assert!((refined.score - 0.4).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_critic_failure_keeps_draft() {
        let refined = refiner(QueueCritic::new(vec![Err(GenerationError::Backend("down".into()))]))
            .refine("castle", "castle")
            .await;
        assert_eq!(refined.prompt, "castle");
        assert_eq!(refined.stop_reason, StopReason::CriticFailed);
    }
}
