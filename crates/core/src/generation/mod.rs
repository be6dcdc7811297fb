//! # Generation Adapter
//!
//! The narrow contract the pipeline uses to reach content-generation models.
//!
//! - `studio` - production adapter (radkit LLMs for text, HTTP media backend for images/video)
//! - `scripted` - deterministic offline adapter used by `--offline` mode and tests
//! - `llm_backend` - radkit-backed writer, judge and prompt critic
//! - `http_media` - reqwest client for the media synthesis/scoring service

pub mod http_media;
pub mod llm_backend;
pub mod llm_helpers;
pub mod prompts;
pub mod scripted;
pub mod studio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GenerationError;

pub use http_media::{HttpMediaBackend, MediaBackendConfig};
pub use scripted::ScriptedAdapter;
pub use studio::StudioAdapter;

/// Kind of artifact a candidate holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Text,
    Image,
    Video,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Text => "text",
            ArtifactKind::Image => "image",
            ArtifactKind::Video => "video",
        }
    }
}

/// Opaque pointer to a generated or uploaded artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub uri: String,
    pub kind: ArtifactKind,
}

impl ArtifactRef {
    pub fn image(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            kind: ArtifactKind::Image,
        }
    }

    pub fn video(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            kind: ArtifactKind::Video,
        }
    }
}

/// One generated output, before scoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub artifact: ArtifactRef,
    /// Prompt the candidate was generated from (needed for alignment scoring)
    pub prompt: String,
    /// Inline content for text candidates
    #[serde(default)]
    pub text: Option<String>,
    /// Seed actually used, `None` when generated unseeded
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub model: Option<String>,
    /// Cost units charged for producing this candidate
    #[serde(default)]
    pub cost: f64,
}

impl Candidate {
    pub fn text(prompt: &str, content: String, cost: f64) -> Self {
        Self {
            artifact: ArtifactRef {
                uri: format!("text://{}", uuid::Uuid::new_v4()),
                kind: ArtifactKind::Text,
            },
            prompt: prompt.to_string(),
            text: Some(content),
            seed: None,
            model: None,
            cost,
        }
    }
}

/// Per-axis scores, each nominally in `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    /// Predicted human preference
    pub preference: f32,
    /// How well the output matches its prompt
    pub text_alignment: f32,
    pub aesthetic: f32,
}

impl ScoreBreakdown {
    pub fn new(preference: f32, text_alignment: f32, aesthetic: f32) -> Self {
        Self {
            preference,
            text_alignment,
            aesthetic,
        }
    }
}

/// Contract every generation backend implements
#[async_trait]
pub trait GenerationAdapter: Send + Sync {
    async fn generate_text(&self, prompt: &str, context: &str) -> Result<String, GenerationError>;

    async fn generate_image_variants(
        &self,
        prompt: &str,
        conditioning: &[ArtifactRef],
        k: usize,
        seed: Option<u64>,
    ) -> Result<Vec<Candidate>, GenerationError>;

    async fn generate_video(
        &self,
        prompt: &str,
        conditioning: &[ArtifactRef],
        seed: Option<u64>,
    ) -> Result<Candidate, GenerationError>;

    async fn score_variant(&self, candidate: &Candidate) -> Result<ScoreBreakdown, GenerationError>;
}
