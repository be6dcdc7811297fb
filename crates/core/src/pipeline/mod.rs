//! # Pipeline
//!
//! The stage state machine and everything that drives a session through it.
//!
//! - `stage` - the static stage graph and session statuses
//! - `executor` - generates one stage's result through the variant ranker
//! - `actor` - the per-session owning task
//! - `orchestrator` - routes operations to actors

mod actor;
pub mod executor;
pub mod orchestrator;
pub mod stage;

pub use executor::StageExecutor;
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use stage::{next_stage, state_label, SessionStatus, Stage, FIRST_STAGE, STAGE_GRAPH};
