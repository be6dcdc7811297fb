//! # Error Taxonomy
//!
//! Every error that can reach a client carries an explicit `recoverable` flag so the
//! caller knows whether retrying the same session makes sense or whether a new session
//! has to be started.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used across the core crate
pub type ForgeResult<T> = Result<T, ForgeError>;

/// Errors surfaced by the orchestration core
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ForgeError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Upstream generation failed: {0}")]
    UpstreamGeneration(String),

    #[error("Best candidate scored {best:.3}, below quality threshold {threshold:.3}")]
    QualityBelowThreshold { best: f32, threshold: f32 },

    #[error("Session '{0}' has expired; start a new session")]
    SessionExpired(String),

    #[error("Group '{group_id}' has {} failed member(s): {}", failed.len(), failed.join(", "))]
    PartialGroupFailure {
        group_id: String,
        failed: Vec<String>,
    },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Concurrent update conflict on '{0}'")]
    Conflict(String),

    #[error("Quota exceeded for '{owner}': requested {requested}, remaining {remaining}")]
    QuotaExceeded {
        owner: String,
        requested: u32,
        remaining: u32,
    },

    #[error("Session store error: {0}")]
    Store(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ForgeError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::UpstreamGeneration(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn session_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "Session",
            id: id.into(),
        }
    }

    pub fn group_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "Group",
            id: id.into(),
        }
    }

    /// Whether retrying against the same session/group can succeed
    pub fn recoverable(&self) -> bool {
        match self {
            ForgeError::Validation(_)
            | ForgeError::UpstreamGeneration(_)
            | ForgeError::QualityBelowThreshold { .. }
            | ForgeError::Conflict(_)
            | ForgeError::QuotaExceeded { .. }
            | ForgeError::Store(_)
            | ForgeError::Cancelled => true,
            ForgeError::SessionExpired(_)
            | ForgeError::PartialGroupFailure { .. }
            | ForgeError::NotFound { .. }
            | ForgeError::Internal(_) => false,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            ForgeError::Validation(_) => "validation_error",
            ForgeError::UpstreamGeneration(_) => "upstream_generation_error",
            ForgeError::QualityBelowThreshold { .. } => "quality_below_threshold",
            ForgeError::SessionExpired(_) => "session_expired",
            ForgeError::PartialGroupFailure { .. } => "partial_group_failure",
            ForgeError::NotFound { .. } => "not_found",
            ForgeError::Conflict(_) => "conflict",
            ForgeError::QuotaExceeded { .. } => "quota_exceeded",
            ForgeError::Store(_) => "store_error",
            ForgeError::Cancelled => "cancelled",
            ForgeError::Internal(_) => "internal_error",
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            code: self.code().to_string(),
            message: self.to_string(),
            recoverable: self.recoverable(),
        }
    }
}

/// Serialisable form of an error, attached to sessions and sent to clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorReport {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
}

impl From<&ForgeError> for ErrorReport {
    fn from(err: &ForgeError) -> Self {
        err.report()
    }
}

/// Failures reported by a generation backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    #[error("Model '{model}' does not accept a seed parameter")]
    SeedUnsupported { model: String },

    #[error("Generation backend error: {0}")]
    Backend(String),

    #[error("Malformed backend response: {0}")]
    Malformed(String),

    #[error("Generation cancelled")]
    Cancelled,
}

impl From<GenerationError> for ForgeError {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::Cancelled => ForgeError::Cancelled,
            other => ForgeError::UpstreamGeneration(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GenerationError::Malformed(err.to_string())
        } else {
            GenerationError::Backend(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ForgeError {
    fn from(err: serde_json::Error) -> Self {
        ForgeError::Store(format!("Serialization failed: {}", err))
    }
}

impl From<rusqlite::Error> for ForgeError {
    fn from(err: rusqlite::Error) -> Self {
        ForgeError::Store(err.to_string())
    }
}
