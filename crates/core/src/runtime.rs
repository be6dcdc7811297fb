//! Wires a `ForgeConfig` into a running orchestrator and group coordinator.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;

use crate::channel::{LocalConnector, NotificationHub};
use crate::config::ForgeConfig;
use crate::generation::llm_backend::LlmPromptCritic;
use crate::generation::{GenerationAdapter, ScriptedAdapter, StudioAdapter};
use crate::group::{GroupCoordinator, QuotaLedger};
use crate::pipeline::{Orchestrator, StageExecutor};
use crate::quality::{PromptCritic, PromptRefiner};
use crate::state::{open_session_store, SessionRepository, SessionStore};

/// Which generation backend to run against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterMode {
    /// Deterministic scripted backend, no credentials needed
    Offline,
    /// LLM providers plus the HTTP media service
    Studio,
}

#[derive(Clone)]
pub struct ForgeRuntime {
    pub config: ForgeConfig,
    pub orchestrator: Orchestrator,
    pub groups: GroupCoordinator,
    pub quota: QuotaLedger,
}

impl ForgeRuntime {
    pub async fn build(config: ForgeConfig, mode: AdapterMode) -> anyhow::Result<Self> {
        let store = open_session_store(&config.store)
            .await
            .context("Failed to open a session store")?;

        let (adapter, critic): (Arc<dyn GenerationAdapter>, Option<Arc<dyn PromptCritic>>) = match mode {
            AdapterMode::Offline => (Arc::new(ScriptedAdapter::new()), None),
            AdapterMode::Studio => {
                if !config.models.writer.has_credentials() {
                    tracing::warn!(
                        env = config.models.writer.provider.api_key_env(),
                        "Writer model has no API key in the environment"
                    );
                }
                let adapter = StudioAdapter::new(&config.models, &config.media)
                    .context("Failed to build the studio adapter")?;
                let critic: Arc<dyn PromptCritic> =
                    Arc::new(LlmPromptCritic::new(config.models.critic.clone()));
                (Arc::new(adapter), Some(critic))
            }
        };
        tracing::info!(mode = ?mode, backend = ?store.backend(), "Runtime assembled");

        Ok(Self::assemble(config, store, adapter, critic))
    }

    /// Build over explicit parts; tests and embedders use this directly
    pub fn assemble(
        config: ForgeConfig,
        store: Arc<dyn SessionStore>,
        adapter: Arc<dyn GenerationAdapter>,
        critic: Option<Arc<dyn PromptCritic>>,
    ) -> Self {
        let repo = SessionRepository::new(store)
            .with_record_ttl(config.store.record_ttl())
            .with_max_retries(config.store.max_put_retries);

        let mut executor = StageExecutor::new(Arc::clone(&adapter), config.ranking.clone())
            .with_storyboard_frames(config.orchestrator.storyboard_frames);
        if let Some(critic) = critic.filter(|_| config.refinement.enabled) {
            executor = executor.with_refiner(PromptRefiner::new(
                adapter,
                critic,
                config.refinement.clone(),
            ));
        }

        let orchestrator = Orchestrator::new(
            repo,
            executor,
            NotificationHub::new(config.channel.buffer),
            config.orchestrator.clone(),
        );
        let quota = QuotaLedger::new(config.quota.clone());
        let groups = GroupCoordinator::new(orchestrator.clone(), quota.clone(), config.groups.clone());

        Self {
            config,
            orchestrator,
            groups,
            quota,
        }
    }

    /// In-process connector for clients living next to the server
    pub fn local_connector(&self) -> LocalConnector {
        LocalConnector::new(
            self.orchestrator.hub().clone(),
            Arc::new(self.orchestrator.clone()),
            self.config.channel.clone(),
        )
    }

    /// Periodic housekeeping: forget quota windows that have long passed
    pub fn spawn_maintenance(&self) -> tokio::task::JoinHandle<()> {
        let quota = self.quota.clone();
        let every = Duration::from_secs(self.config.quota.window_secs.max(60));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                quota.cleanup_expired().await;
                tracing::debug!("Quota windows swept");
            }
        })
    }
}
