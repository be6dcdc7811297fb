//! # Model Configuration
//!
//! LLM provider selection for the text side of generation: the story writer, the text
//! judge used when ranking story variants, and the prompt critic used by refinement.
//! API keys are read from the provider's environment variable by radkit's `from_env`.

use serde::{Deserialize, Serialize};

/// Supported LLM providers
///
/// - Anthropic - `ANTHROPIC_API_KEY`
/// - OpenAI - `OPENAI_API_KEY`
/// - Gemini - `GEMINI_API_KEY`
/// - OpenRouter - `OPENROUTER_API_KEY`
/// - Grok (xAI) - `XAI_API_KEY`
/// - DeepSeek - `DEEPSEEK_API_KEY`
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    Anthropic,
    #[serde(rename = "openai")]
    OpenAI,
    Gemini,
    OpenRouter,
    Grok,
    DeepSeek,
}

impl LlmProvider {
    pub fn display_name(&self) -> &'static str {
        match self {
            LlmProvider::Anthropic => "Anthropic",
            LlmProvider::OpenAI => "OpenAI",
            LlmProvider::Gemini => "Gemini",
            LlmProvider::OpenRouter => "OpenRouter",
            LlmProvider::Grok => "Grok",
            LlmProvider::DeepSeek => "DeepSeek",
        }
    }

    /// Environment variable radkit reads the key from
    pub fn api_key_env(&self) -> &'static str {
        match self {
            LlmProvider::Anthropic => "ANTHROPIC_API_KEY",
            LlmProvider::OpenAI => "OPENAI_API_KEY",
            LlmProvider::Gemini => "GEMINI_API_KEY",
            LlmProvider::OpenRouter => "OPENROUTER_API_KEY",
            LlmProvider::Grok => "XAI_API_KEY",
            LlmProvider::DeepSeek => "DEEPSEEK_API_KEY",
        }
    }

    /// Whether this provider supports custom base URL
    pub fn supports_base_url(&self) -> bool {
        matches!(self, LlmProvider::OpenAI)
    }
}

/// Provider + model for one role
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    #[serde(default)]
    pub provider: LlmProvider,
    pub model: String,
    /// Optional base URL override for OpenAI-compatible APIs
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Anthropic,
            model: "claude-sonnet-4-20250514".to_string(),
            base_url: None,
        }
    }
}

impl ModelConfig {
    pub fn with_provider(provider: LlmProvider, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            base_url: None,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Whether the provider's API key is present in the environment
    pub fn has_credentials(&self) -> bool {
        std::env::var(self.provider.api_key_env())
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false)
    }
}

/// Per-role model selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelsConfig {
    /// Writes stories and folds feedback into revisions
    pub writer: ModelConfig,
    /// Scores text candidates on the three ranking axes
    pub judge: ModelConfig,
    /// Critiques image prompts during refinement
    pub critic: ModelConfig,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        let fast = ModelConfig {
            model: "claude-3-5-haiku-20241022".to_string(),
            ..ModelConfig::default()
        };
        Self {
            writer: ModelConfig::default(),
            judge: fast.clone(),
            critic: fast,
        }
    }
}
