//! # Storyforge Core
//!
//! Drives multi-stage generation sessions (story, reference image, storyboard, video)
//! with a human checkpoint after every stage.
//!
//! ## Architecture
//!
//! - `pipeline/` - stage graph, per-session actors, the orchestrator
//! - `state/` - session model and the pluggable versioned store
//! - `channel/` - per-session notification channel, server driver and reconnecting client
//! - `quality/` - variant ranking, quality gate, prompt refinement
//! - `coherence/` - seeds and sequential conditioning chains
//! - `group/` - side-by-side sibling runs and the owner quota
//! - `generation/` - backend adapters (LLM + media service, scripted offline)
//! - `models` - LLM provider configuration
//!
//! ## Usage
//!
//! ```rust,ignore
//! use storyforge_core::{AdapterMode, ForgeConfig, ForgeRuntime, SessionInput};
//!
//! let runtime = ForgeRuntime::build(ForgeConfig::default(), AdapterMode::Offline).await?;
//! let id = runtime.orchestrator.start("alice", SessionInput::new("A fox learns to fly")).await?;
//! let story = runtime.orchestrator.run_stage_with_pause(&id).await?;
//! runtime.orchestrator.approve(&id, Some(story.stage)).await?;
//! ```

pub mod channel;
pub mod coherence;
pub mod config;
pub mod error;
pub mod generation;
pub mod group;
pub mod models;
pub mod pipeline;
pub mod quality;
pub mod runtime;
pub mod state;

pub use config::ForgeConfig;
pub use error::{ErrorReport, ForgeError, ForgeResult, GenerationError};
pub use pipeline::{Orchestrator, SessionStatus, Stage};
pub use runtime::{AdapterMode, ForgeRuntime};
pub use state::{GenerationSession, SessionInput};

/// Startup banner
pub fn ignite() {
    println!("🎬 Storyforge Core Online");
}
