//! # HTTP Media Backend
//!
//! Client for the image/video synthesis and media scoring service.
//!
//! - `POST {endpoint}/v1/images` - `{model, prompt, conditioning, n, seed?}` -> `{candidates: [...]}`
//! - `POST {endpoint}/v1/videos` - `{model, prompt, conditioning, seed?}` -> `{uri, seed?, cost}`
//! - `POST {endpoint}/v1/scores` - `{uri, kind, prompt}` -> `{preference, text_alignment, aesthetic}`
//!
//! A 400/422 whose error names the `seed` parameter means the model cannot be seeded.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ArtifactKind, ArtifactRef, Candidate, ScoreBreakdown};
use crate::error::GenerationError;

/// Media service connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MediaBackendConfig {
    /// Base URL; `None` leaves the media backend unconfigured
    pub endpoint: Option<String>,
    /// Environment variable holding the bearer token
    pub api_key_env: String,
    pub image_model: String,
    pub video_model: String,
    pub timeout_secs: u64,
}

impl Default for MediaBackendConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key_env: "STORYFORGE_MEDIA_API_KEY".to_string(),
            image_model: "sdxl-turbo".to_string(),
            video_model: "svd-xt".to_string(),
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Serialize)]
struct ImageRequestBody<'a> {
    model: &'a str,
    prompt: &'a str,
    conditioning: Vec<&'a str>,
    n: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Debug, Serialize)]
struct VideoRequestBody<'a> {
    model: &'a str,
    prompt: &'a str,
    conditioning: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ScoreRequestBody<'a> {
    uri: &'a str,
    kind: ArtifactKind,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct MediaItem {
    uri: String,
    #[serde(default)]
    seed: Option<u64>,
    #[serde(default)]
    cost: f64,
}

#[derive(Debug, Deserialize)]
struct MediaBatch {
    candidates: Vec<MediaItem>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: String,
    #[serde(default)]
    param: Option<String>,
    #[serde(default)]
    message: String,
}

/// reqwest client for the media service
#[derive(Debug, Clone)]
pub struct HttpMediaBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    config: MediaBackendConfig,
}

impl HttpMediaBackend {
    pub fn new(config: MediaBackendConfig) -> Result<Self, GenerationError> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| GenerationError::Backend("Media endpoint is not configured".into()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let api_key = std::env::var(&config.api_key_env).ok();
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            config,
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.post(format!("{}{}", self.endpoint, path));
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// Map a non-success response onto the generation error taxonomy
    async fn reject(response: reqwest::Response, model: &str) -> GenerationError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 400 || status.as_u16() == 422 {
            if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&body) {
                let detail = envelope.error;
                let names_seed = detail.param.as_deref() == Some("seed")
                    || (detail.code == "unsupported_parameter" && detail.message.contains("seed"));
                if names_seed {
                    return GenerationError::SeedUnsupported {
                        model: model.to_string(),
                    };
                }
            }
        }
        GenerationError::Backend(format!("{} from media service: {}", status, body))
    }

    pub async fn generate_images(
        &self,
        prompt: &str,
        conditioning: &[ArtifactRef],
        k: usize,
        seed: Option<u64>,
    ) -> Result<Vec<Candidate>, GenerationError> {
        let model = self.config.image_model.as_str();
        let body = ImageRequestBody {
            model,
            prompt,
            conditioning: conditioning.iter().map(|a| a.uri.as_str()).collect(),
            n: k,
            seed,
        };
        let response = self.post("/v1/images").json(&body).send().await?;
        if !response.status().is_success() {
            return Err(Self::reject(response, model).await);
        }
        let batch: MediaBatch = response.json().await?;
        if batch.candidates.is_empty() {
            return Err(GenerationError::Malformed("Image batch was empty".into()));
        }
        Ok(batch
            .candidates
            .into_iter()
            .map(|item| Candidate {
                artifact: ArtifactRef::image(item.uri),
                prompt: prompt.to_string(),
                text: None,
                seed: item.seed.or(seed),
                model: Some(model.to_string()),
                cost: item.cost,
            })
            .collect())
    }

    pub async fn generate_video(
        &self,
        prompt: &str,
        conditioning: &[ArtifactRef],
        seed: Option<u64>,
    ) -> Result<Candidate, GenerationError> {
        let model = self.config.video_model.as_str();
        let body = VideoRequestBody {
            model,
            prompt,
            conditioning: conditioning.iter().map(|a| a.uri.as_str()).collect(),
            seed,
        };
        let response = self.post("/v1/videos").json(&body).send().await?;
        if !response.status().is_success() {
            return Err(Self::reject(response, model).await);
        }
        let item: MediaItem = response.json().await?;
        Ok(Candidate {
            artifact: ArtifactRef::video(item.uri),
            prompt: prompt.to_string(),
            text: None,
            seed: item.seed.or(seed),
            model: Some(model.to_string()),
            cost: item.cost,
        })
    }

    pub async fn score(&self, candidate: &Candidate) -> Result<ScoreBreakdown, GenerationError> {
        let body = ScoreRequestBody {
            uri: &candidate.artifact.uri,
            kind: candidate.artifact.kind,
            prompt: &candidate.prompt,
        };
        let response = self.post("/v1/scores").json(&body).send().await?;
        if !response.status().is_success() {
            return Err(Self::reject(response, "scorer").await);
        }
        Ok(response.json().await?)
    }
}
