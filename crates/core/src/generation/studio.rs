//! Production adapter: LLM providers for text, the HTTP media service for everything else.

use async_trait::async_trait;

use super::llm_backend::LlmTextBackend;
use super::{
    ArtifactKind, ArtifactRef, Candidate, GenerationAdapter, HttpMediaBackend, MediaBackendConfig,
    ScoreBreakdown,
};
use crate::error::GenerationError;
use crate::models::ModelsConfig;

pub struct StudioAdapter {
    text: LlmTextBackend,
    media: Option<HttpMediaBackend>,
}

impl StudioAdapter {
    pub fn new(models: &ModelsConfig, media: &MediaBackendConfig) -> Result<Self, GenerationError> {
        let media = match media.endpoint {
            Some(_) => Some(HttpMediaBackend::new(media.clone())?),
            None => {
                tracing::warn!("No media endpoint configured; image and video stages will fail");
                None
            }
        };
        Ok(Self {
            text: LlmTextBackend::new(models),
            media,
        })
    }

    fn media(&self) -> Result<&HttpMediaBackend, GenerationError> {
        self.media
            .as_ref()
            .ok_or_else(|| GenerationError::Backend("Media backend is not configured".into()))
    }
}

#[async_trait]
impl GenerationAdapter for StudioAdapter {
    async fn generate_text(&self, prompt: &str, context: &str) -> Result<String, GenerationError> {
        self.text
            .write(prompt, context)
            .await
            .map_err(|e| GenerationError::Backend(format!("{:#}", e)))
    }

    async fn generate_image_variants(
        &self,
        prompt: &str,
        conditioning: &[ArtifactRef],
        k: usize,
        seed: Option<u64>,
    ) -> Result<Vec<Candidate>, GenerationError> {
        self.media()?
            .generate_images(prompt, conditioning, k, seed)
            .await
    }

    async fn generate_video(
        &self,
        prompt: &str,
        conditioning: &[ArtifactRef],
        seed: Option<u64>,
    ) -> Result<Candidate, GenerationError> {
        self.media()?.generate_video(prompt, conditioning, seed).await
    }

    async fn score_variant(&self, candidate: &Candidate) -> Result<ScoreBreakdown, GenerationError> {
        match candidate.artifact.kind {
            ArtifactKind::Text => self
                .text
                .judge(candidate)
                .await
                .map_err(|e| GenerationError::Backend(format!("{:#}", e))),
            ArtifactKind::Image | ArtifactKind::Video => self.media()?.score(candidate).await,
        }
    }
}
