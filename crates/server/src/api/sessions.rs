//! # Session API
//!
//! Start, inspect, approve and regenerate single sessions.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use storyforge_core::coherence::CoherenceSettings;
use storyforge_core::generation::ArtifactRef;
use storyforge_core::state::QualityProfile;
use storyforge_core::{ForgeError, GenerationSession, SessionInput, Stage};
use utoipa::ToSchema;

use super::channel::channel_socket;
use super::ApiError;
use crate::SharedState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct StartSessionRequest {
    pub owner_id: String,
    pub prompt: String,
    /// URI of an uploaded reference image
    #[serde(default)]
    pub reference_uri: Option<String>,
    #[serde(default)]
    pub coherence: Option<CoherenceRequest>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub quality: Option<QualityProfile>,
}

/// Client-selectable coherence options. The seed itself is always generated server side.
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct CoherenceRequest {
    /// Defaults to on
    pub seed_control: Option<bool>,
    pub latent_reuse: bool,
}

impl From<CoherenceRequest> for CoherenceSettings {
    fn from(req: CoherenceRequest) -> Self {
        Self {
            seed_control: req.seed_control.unwrap_or(true),
            seed: None,
            latent_reuse: req.latent_reuse,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StartSessionResponse {
    pub session_id: String,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct ApproveRequest {
    /// Stage the caller is approving; a repeat for an already approved stage is a no-op
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub expected_stage: Option<Stage>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RegenerateRequest {
    pub feedback: String,
}

/// Session snapshot plus its combined `stage_status` label
#[derive(Debug, Serialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub session: GenerationSession,
    pub state: String,
}

impl From<GenerationSession> for SessionView {
    fn from(session: GenerationSession) -> Self {
        Self {
            state: session.state(),
            session,
        }
    }
}

pub fn session_routes() -> Router<SharedState> {
    Router::new()
        .route("/", post(start_session))
        .route("/:id", get(get_session))
        .route("/:id/run", post(run_session))
        .route("/:id/approve", post(approve_session))
        .route("/:id/regenerate", post(regenerate_session))
        .route("/:id/channel", get(channel_socket))
}

/// Create a session and start its first stage
#[utoipa::path(
    post,
    path = "/api/v1/sessions",
    tag = "sessions",
    request_body = StartSessionRequest,
    responses(
        (status = 201, description = "Session created, story stage running", body = StartSessionResponse),
        (status = 400, description = "Invalid input"),
        (status = 429, description = "Owner quota exhausted")
    )
)]
pub async fn start_session(
    State(state): State<SharedState>,
    Json(req): Json<StartSessionRequest>,
) -> Result<(StatusCode, Json<StartSessionResponse>), ApiError> {
    let mut input = SessionInput::new(req.prompt);
    if let Some(uri) = req.reference_uri {
        input = input.with_reference(ArtifactRef::image(uri));
    }

    let runtime = &state.runtime;
    runtime.orchestrator.validate_input(&req.owner_id, &input)?;
    runtime.quota.try_consume(&req.owner_id, 1).await?;

    let mut session = GenerationSession::new(&req.owner_id, input);
    if let Some(coherence) = req.coherence {
        session.coherence = coherence.into();
    }
    if let Some(quality) = req.quality {
        session.quality = quality;
    }
    let session_id = match runtime.orchestrator.start_session(session).await {
        Ok(id) => id,
        Err(e) => {
            runtime.quota.refund(&req.owner_id, 1).await;
            return Err(e.into());
        }
    };
    Ok((StatusCode::CREATED, Json(StartSessionResponse { session_id })))
}

/// Current session snapshot
#[utoipa::path(
    get,
    path = "/api/v1/sessions/{id}",
    tag = "sessions",
    params(("id" = String, Path, description = "Session id")),
    responses(
        (status = 200, description = "Session snapshot"),
        (status = 404, description = "Unknown session"),
        (status = 410, description = "Session expired")
    )
)]
pub async fn get_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    let session = state.runtime.orchestrator.status(&id).await?;
    Ok(Json(session.into()))
}

/// Start the current stage again without feedback: retries a stage that paused on a
/// recoverable error. A stage already running or waiting for review is left as is.
#[utoipa::path(
    post,
    path = "/api/v1/sessions/{id}/run",
    tag = "sessions",
    params(("id" = String, Path, description = "Session id")),
    responses(
        (status = 202, description = "Stage scheduled"),
        (status = 404, description = "Unknown session"),
        (status = 410, description = "Session expired")
    )
)]
pub async fn run_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<SessionView>), ApiError> {
    let orchestrator = &state.runtime.orchestrator;
    let session = orchestrator.status(&id).await?;
    if session.status.is_terminal() {
        return Err(ForgeError::validation(format!(
            "Session is {}; there is nothing to run",
            session.status.as_str()
        ))
        .into());
    }
    orchestrator.launch(&id).await?;
    let session = orchestrator.status(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(session.into())))
}

/// Commit the paused stage and advance
#[utoipa::path(
    post,
    path = "/api/v1/sessions/{id}/approve",
    tag = "sessions",
    params(("id" = String, Path, description = "Session id")),
    request_body = ApproveRequest,
    responses(
        (status = 200, description = "Stage committed"),
        (status = 400, description = "Session is not waiting for approval"),
        (status = 404, description = "Unknown session")
    )
)]
pub async fn approve_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Option<Json<ApproveRequest>>,
) -> Result<Json<SessionView>, ApiError> {
    let expected_stage = body.and_then(|Json(req)| req.expected_stage);
    let session = state.runtime.orchestrator.approve(&id, expected_stage).await?;
    Ok(Json(session.into()))
}

/// Re-run the current stage with feedback
#[utoipa::path(
    post,
    path = "/api/v1/sessions/{id}/regenerate",
    tag = "sessions",
    params(("id" = String, Path, description = "Session id")),
    request_body = RegenerateRequest,
    responses(
        (status = 200, description = "Regeneration started"),
        (status = 400, description = "Empty feedback or finished session"),
        (status = 404, description = "Unknown session")
    )
)]
pub async fn regenerate_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<RegenerateRequest>,
) -> Result<Json<SessionView>, ApiError> {
    let session = state.runtime.orchestrator.regenerate(&id, req.feedback).await?;
    Ok(Json(session.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_request_never_carries_a_seed() {
        let req: StartSessionRequest = serde_json::from_str(
            r#"{"owner_id": "u1", "prompt": "a fox", "coherence": {"seed": 42, "latent_reuse": true}}"#,
        )
        .unwrap();
        let settings: CoherenceSettings = req.coherence.unwrap().into();
        assert_eq!(settings.seed, None);
        assert!(settings.seed_control);
        assert!(settings.latent_reuse);
    }
}
