//! # Coherence
//!
//! Keeps a session's outputs visually consistent: a fixed per-session seed, and
//! frame-to-frame conditioning chains.

pub mod chain;
pub mod seed;

use serde::{Deserialize, Serialize};

pub use chain::SequentialChain;
pub use seed::{fresh_seed, with_seed_fallback, SeedController};

/// Per-session coherence knobs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct CoherenceSettings {
    pub seed_control: bool,
    /// Assigned once, never changed afterwards
    pub seed: Option<u64>,
    /// Reserved. Stored and logged, not acted upon.
    pub latent_reuse: bool,
}

impl Default for CoherenceSettings {
    fn default() -> Self {
        Self {
            seed_control: true,
            seed: None,
            latent_reuse: false,
        }
    }
}

impl CoherenceSettings {
    pub fn without_seed_control() -> Self {
        Self {
            seed_control: false,
            ..Self::default()
        }
    }

    /// Seed to pass to the adapter, `None` when seed control is off
    pub fn effective_seed(&self) -> Option<u64> {
        if self.seed_control {
            self.seed
        } else {
            None
        }
    }

    /// Assign a seed if none exists yet; returns the effective seed
    pub fn assign_seed_once(&mut self) -> Option<u64> {
        if !self.seed_control {
            return None;
        }
        Some(*self.seed.get_or_insert_with(fresh_seed))
    }
}
