#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use storyforge_core::generation::ScriptedAdapter;
use storyforge_core::state::{MemorySessionStore, SessionStore};
use storyforge_core::{ForgeConfig, ForgeRuntime};

/// Defaults trimmed for fast scripted runs
pub fn test_config() -> ForgeConfig {
    let mut config = ForgeConfig::default();
    config.store.sqlite_path = None;
    config.orchestrator.storyboard_frames = 2;
    config
}

pub fn runtime(adapter: Arc<ScriptedAdapter>, config: ForgeConfig) -> ForgeRuntime {
    runtime_over(Arc::new(MemorySessionStore::new()), adapter, config)
}

pub fn runtime_over(
    store: Arc<dyn SessionStore>,
    adapter: Arc<ScriptedAdapter>,
    config: ForgeConfig,
) -> ForgeRuntime {
    ForgeRuntime::assemble(config, store, adapter, None)
}

/// Poll `check` until it yields a value or five seconds pass
pub async fn eventually<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = check().await {
            return value;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
