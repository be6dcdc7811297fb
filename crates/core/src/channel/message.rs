//! Wire envelope, JSON tagged by `type`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ForgeError;
use crate::pipeline::stage::{SessionStatus, Stage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    /// Client to server: revise the current stage
    Feedback { content: String },
    /// Generated text for display
    LlmResponse {
        session_id: String,
        stage: Stage,
        content: String,
    },
    /// A stage finished generating and is waiting at its checkpoint
    StageComplete {
        session_id: String,
        stage: Stage,
        status: SessionStatus,
        version: u64,
        selected_score: f32,
        below_threshold: bool,
    },
    Error {
        #[serde(default)]
        session_id: Option<String>,
        code: String,
        message: String,
        recoverable: bool,
    },
    /// Sent by both sides
    Heartbeat { timestamp: DateTime<Utc> },
}

impl ChannelMessage {
    pub fn heartbeat() -> Self {
        ChannelMessage::Heartbeat {
            timestamp: Utc::now(),
        }
    }

    pub fn error(session_id: Option<&str>, err: &ForgeError) -> Self {
        ChannelMessage::Error {
            session_id: session_id.map(str::to_string),
            code: err.code().to_string(),
            message: err.to_string(),
            recoverable: err.recoverable(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChannelMessage::Feedback { .. } => "feedback",
            ChannelMessage::LlmResponse { .. } => "llm_response",
            ChannelMessage::StageComplete { .. } => "stage_complete",
            ChannelMessage::Error { .. } => "error",
            ChannelMessage::Heartbeat { .. } => "heartbeat",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
