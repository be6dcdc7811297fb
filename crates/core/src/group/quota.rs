//! Per-owner generation quota over a fixed window.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::error::{ForgeError, ForgeResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Sessions an owner may start per window
    pub units_per_window: u32,
    pub window_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            units_per_window: 20,
            window_secs: 3600,
        }
    }
}

#[derive(Debug, Clone)]
struct Usage {
    used: u32,
    window_start: Instant,
}

#[derive(Clone)]
pub struct QuotaLedger {
    config: QuotaConfig,
    usage: Arc<RwLock<HashMap<String, Usage>>>,
}

impl QuotaLedger {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            config,
            usage: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.config.window_secs)
    }

    /// Consume `units` all at once or not at all; returns what remains in the window
    pub async fn try_consume(&self, owner_id: &str, units: u32) -> ForgeResult<u32> {
        let mut usage = self.usage.write().await;
        let now = Instant::now();
        let entry = usage.entry(owner_id.to_string()).or_insert(Usage {
            used: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) > self.window() {
            entry.used = 0;
            entry.window_start = now;
        }

        let limit = self.config.units_per_window;
        let remaining = limit.saturating_sub(entry.used);
        if units > remaining {
            tracing::warn!(
                owner_id,
                requested = units,
                remaining,
                "Generation quota exceeded"
            );
            return Err(ForgeError::QuotaExceeded {
                owner: owner_id.to_string(),
                requested: units,
                remaining,
            });
        }

        entry.used += units;
        tracing::debug!(owner_id, used = entry.used, limit, "Quota consumed");
        Ok(limit - entry.used)
    }

    /// Give back units consumed by an operation that was rolled back
    pub async fn refund(&self, owner_id: &str, units: u32) {
        if let Some(entry) = self.usage.write().await.get_mut(owner_id) {
            entry.used = entry.used.saturating_sub(units);
        }
    }

    pub async fn remaining(&self, owner_id: &str) -> u32 {
        let usage = self.usage.read().await;
        match usage.get(owner_id) {
            Some(entry) if entry.window_start.elapsed() <= self.window() => {
                self.config.units_per_window.saturating_sub(entry.used)
            }
            _ => self.config.units_per_window,
        }
    }

    /// Drop owners whose window has long passed
    pub async fn cleanup_expired(&self) {
        let window = self.window();
        self.usage
            .write()
            .await
            .retain(|_, entry| entry.window_start.elapsed() < window * 2);
    }
}
