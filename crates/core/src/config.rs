//! # Configuration
//!
//! `ForgeConfig` aggregates every tunable section. It is read from
//! `.storyforge/config.json` (missing file means defaults) and then overridden from
//! `STORYFORGE_*` environment variables.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::channel::{ChannelConfig, ReconnectPolicy};
use crate::generation::MediaBackendConfig;
use crate::group::{GroupConfig, QuotaConfig};
use crate::models::ModelsConfig;
use crate::pipeline::OrchestratorConfig;
use crate::quality::{RankingConfig, RefinementConfig};
use crate::state::{Deployment, StoreConfig};

pub const CONFIG_DIR: &str = ".storyforge";
pub const CONFIG_FILE: &str = "config.json";

pub fn default_config_path() -> PathBuf {
    Path::new(CONFIG_DIR).join(CONFIG_FILE)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    pub store: StoreConfig,
    pub orchestrator: OrchestratorConfig,
    pub ranking: RankingConfig,
    pub refinement: RefinementConfig,
    pub channel: ChannelConfig,
    pub reconnect: ReconnectPolicy,
    pub groups: GroupConfig,
    pub quota: QuotaConfig,
    pub models: ModelsConfig,
    pub media: MediaBackendConfig,
}

impl ForgeConfig {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Load from `path` and apply environment overrides
    pub async fn resolve(path: &Path) -> anyhow::Result<Self> {
        let mut config = Self::load(path).await?;
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = var("STORYFORGE_REMOTE_STORE_URL") {
            self.store.remote_url = Some(url);
        }
        if let Some(path) = var("STORYFORGE_SQLITE_PATH") {
            self.store.sqlite_path = Some(path);
        }
        if let Some(endpoint) = var("STORYFORGE_MEDIA_ENDPOINT") {
            self.media.endpoint = Some(endpoint);
        }
        if let Some(deployment) = var("STORYFORGE_DEPLOYMENT") {
            self.store.deployment = match deployment.trim().to_lowercase().as_str() {
                "single_process" | "single" => Deployment::SingleProcess,
                "multi_process" | "multi" => Deployment::MultiProcess,
                other => anyhow::bail!("Unknown STORYFORGE_DEPLOYMENT '{}'", other),
            };
        }
        if let Some(allow) = var("STORYFORGE_ALLOW_IN_MEMORY") {
            self.store.allow_in_memory = allow
                .trim()
                .parse()
                .with_context(|| format!("STORYFORGE_ALLOW_IN_MEMORY must be true or false, got '{}'", allow))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = ForgeConfig::load(&dir.path().join("nope.json")).await.unwrap();
        assert_eq!(config, ForgeConfig::default());
    }

    #[tokio::test]
    async fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, r#"{"ranking": {"image_variants": 6}, "quota": {"units_per_window": 3}}"#)
            .await
            .unwrap();

        let config = ForgeConfig::load(&path).await.unwrap();
        assert_eq!(config.ranking.image_variants, 6);
        assert_eq!(config.ranking.text_variants, RankingConfig::default().text_variants);
        assert_eq!(config.quota.units_per_window, 3);
        assert_eq!(config.channel, ChannelConfig::default());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = ForgeConfig::default();
        config.groups.max_concurrent_siblings = Some(2);
        config.save(&path).await.unwrap();
        assert_eq!(ForgeConfig::load(&path).await.unwrap(), config);
    }

    #[tokio::test]
    async fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, "{not json").await.unwrap();
        assert!(ForgeConfig::load(&path).await.is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars = env(&[
            ("STORYFORGE_REMOTE_STORE_URL", "http://kv:9000"),
            ("STORYFORGE_SQLITE_PATH", "/tmp/s.db"),
            ("STORYFORGE_MEDIA_ENDPOINT", "http://media"),
            ("STORYFORGE_DEPLOYMENT", "multi_process"),
            ("STORYFORGE_ALLOW_IN_MEMORY", "false"),
        ]);
        let mut config = ForgeConfig::default();
        config.apply_overrides(|k| vars.get(k).cloned()).unwrap();

        assert_eq!(config.store.remote_url.as_deref(), Some("http://kv:9000"));
        assert_eq!(config.store.sqlite_path.as_deref(), Some("/tmp/s.db"));
        assert_eq!(config.media.endpoint.as_deref(), Some("http://media"));
        assert_eq!(config.store.deployment, Deployment::MultiProcess);
        assert!(!config.store.allow_in_memory);
    }

    #[test]
    fn test_bad_env_values_rejected() {
        let vars = env(&[("STORYFORGE_DEPLOYMENT", "cluster")]);
        let mut config = ForgeConfig::default();
        assert!(config.apply_overrides(|k| vars.get(k).cloned()).is_err());

        let vars = env(&[("STORYFORGE_ALLOW_IN_MEMORY", "maybe")]);
        assert!(config.apply_overrides(|k| vars.get(k).cloned()).is_err());
    }

    #[test]
    fn test_blank_env_ignored() {
        let vars = env(&[("STORYFORGE_SQLITE_PATH", "  ")]);
        let mut config = ForgeConfig::default();
        config.apply_overrides(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(config.store, StoreConfig::default());
    }
}
