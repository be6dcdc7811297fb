//! # Pipeline Stages
//!
//! The creative pipeline is a fixed line of stages. Transitions are looked up in
//! [`STAGE_GRAPH`] rather than computed, so the graph can be inspected and tested as data.

use serde::{Deserialize, Serialize};

/// Stage of the generation pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Narrative text from the user prompt
    Story,
    /// Single anchoring image for the whole session
    ReferenceImage,
    /// Ordered frames, each conditioned on the previous one
    Storyboard,
    /// Clips animated from the storyboard frames
    Video,
    /// Terminal
    Complete,
}

/// Static transition table: `(from, to)`
pub const STAGE_GRAPH: [(Stage, Stage); 4] = [
    (Stage::Story, Stage::ReferenceImage),
    (Stage::ReferenceImage, Stage::Storyboard),
    (Stage::Storyboard, Stage::Video),
    (Stage::Video, Stage::Complete),
];

/// Stage every session starts in
pub const FIRST_STAGE: Stage = Stage::Story;

/// Next stage after `stage`, or `None` for the terminal stage
pub fn next_stage(stage: Stage) -> Option<Stage> {
    STAGE_GRAPH
        .iter()
        .find(|(from, _)| *from == stage)
        .map(|(_, to)| *to)
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Story => "story",
            Stage::ReferenceImage => "reference_image",
            Stage::Storyboard => "storyboard",
            Stage::Video => "video",
            Stage::Complete => "complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "story" => Some(Stage::Story),
            "reference_image" => Some(Stage::ReferenceImage),
            "storyboard" => Some(Stage::Storyboard),
            "video" => Some(Stage::Video),
            "complete" => Some(Stage::Complete),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        next_stage(*self).is_none()
    }

    /// Stages that perform generation, in pipeline order
    pub fn executable() -> Vec<Stage> {
        STAGE_GRAPH.iter().map(|(from, _)| *from).collect()
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a session within its current stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Persisted but the first stage has not started
    Created,
    /// The current stage is generating
    Running,
    /// Waiting at a checkpoint for approve or regenerate
    Paused,
    Complete,
    Failed,
    /// Idle past the session TTL; cannot be resumed
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Complete => "complete",
            SessionStatus::Failed => "failed",
            SessionStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Complete | SessionStatus::Failed | SessionStatus::Expired
        )
    }
}

/// Combined state label, e.g. `storyboard_paused`
pub fn state_label(stage: Stage, status: SessionStatus) -> String {
    match status {
        SessionStatus::Running | SessionStatus::Paused => {
            format!("{}_{}", stage.as_str(), status.as_str())
        }
        other => other.as_str().to_string(),
    }
}
