//! # LLM Text Backend
//!
//! Story writing, story judging and prompt critique through radkit structured outputs.

use anyhow::Context as _;
use async_trait::async_trait;
use radkit::macros::LLMOutput;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{prompts, Candidate, ScoreBreakdown};
use crate::error::GenerationError;
use crate::models::{ModelConfig, ModelsConfig};
use crate::quality::refinement::{Critique, PromptCritic};
use crate::run_llm_function;

/// Free-form text produced by the writer
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, LLMOutput)]
pub struct WrittenText {
    /// The full generated text
    pub text: String,
}

/// Judge verdict for one text candidate
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, LLMOutput)]
pub struct TextJudgement {
    /// Predicted reader preference (0.0 - 1.0)
    pub preference: f32,
    /// Faithfulness to the request and revision notes (0.0 - 1.0)
    pub text_alignment: f32,
    /// How vivid and filmable the scenes are (0.0 - 1.0)
    pub aesthetic: f32,
    /// One-sentence justification
    #[serde(default)]
    pub rationale: String,
}

/// Critic verdict for an image prompt
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, LLMOutput)]
pub struct PromptCritiqueOutput {
    /// Prompt quality (0.0 - 1.0)
    pub score: f32,
    /// Concrete changes that would raise the score
    pub feedback: String,
}

/// Writer and judge for text candidates
#[derive(Debug, Clone)]
pub struct LlmTextBackend {
    writer: ModelConfig,
    judge: ModelConfig,
}

impl LlmTextBackend {
    pub fn new(models: &ModelsConfig) -> Self {
        Self {
            writer: models.writer.clone(),
            judge: models.judge.clone(),
        }
    }

    /// Generate text. `instructions` is the system prompt for this call.
    pub async fn write(&self, prompt: &str, instructions: &str) -> anyhow::Result<String> {
        let instructions = if instructions.trim().is_empty() {
            prompts::WRITER
        } else {
            instructions
        };
        let output = run_llm_function!(&self.writer, WrittenText, instructions, prompt.to_string())?;
        if output.text.trim().is_empty() {
            anyhow::bail!("Writer returned empty text");
        }
        Ok(output.text)
    }

    pub async fn judge(&self, candidate: &Candidate) -> anyhow::Result<ScoreBreakdown> {
        let text = candidate
            .text
            .as_deref()
            .context("Text candidate has no inline content")?;
        let input = format!("Request:\n{}\n\nCandidate story:\n{}", candidate.prompt, text);
        let verdict = run_llm_function!(&self.judge, TextJudgement, prompts::JUDGE, input)?;
        tracing::debug!(
            uri = %candidate.artifact.uri,
            preference = verdict.preference,
            alignment = verdict.text_alignment,
            aesthetic = verdict.aesthetic,
            rationale = %verdict.rationale,
            "Judged text candidate"
        );
        Ok(ScoreBreakdown::new(
            verdict.preference,
            verdict.text_alignment,
            verdict.aesthetic,
        ))
    }
}

/// Prompt critic backed by an LLM
#[derive(Debug, Clone)]
pub struct LlmPromptCritic {
    config: ModelConfig,
}

impl LlmPromptCritic {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }

    async fn run(&self, prompt: &str, goal: &str) -> anyhow::Result<PromptCritiqueOutput> {
        let input = format!("Goal:\n{}\n\nPrompt to review:\n{}", goal, prompt);
        run_llm_function!(&self.config, PromptCritiqueOutput, prompts::PROMPT_CRITIC, input)
    }
}

#[async_trait]
impl PromptCritic for LlmPromptCritic {
    async fn critique(&self, prompt: &str, goal: &str) -> Result<Critique, GenerationError> {
        let output = self
            .run(prompt, goal)
            .await
            .map_err(|e| GenerationError::Backend(format!("{:#}", e)))?;
        Ok(Critique {
            score: output.score.clamp(0.0, 1.0),
            feedback: output.feedback,
        })
    }
}
