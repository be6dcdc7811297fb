//! # Group API
//!
//! Side-by-side comparison runs.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use storyforge_core::group::{GenerationGroup, GroupComparison, GroupReport, StartGroupRequest};
use utoipa::ToSchema;

use super::ApiError;
use crate::SharedState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct StartGroupBody {
    pub owner_id: String,
    /// `{"type": "settings", "prompt", "profiles"}` or `{"type": "prompt", "prompts", "profile"}`
    #[schema(value_type = Object)]
    pub comparison: GroupComparison,
    #[serde(default)]
    pub auto_approve: bool,
}

impl From<StartGroupBody> for StartGroupRequest {
    fn from(body: StartGroupBody) -> Self {
        Self {
            owner_id: body.owner_id,
            comparison: body.comparison,
            auto_approve: body.auto_approve,
        }
    }
}

pub fn group_routes() -> Router<SharedState> {
    Router::new()
        .route("/", post(start_group))
        .route("/:id", get(get_group))
        .route("/:id/cancel", post(cancel_group))
}

/// Start 2-5 sibling sessions
#[utoipa::path(
    post,
    path = "/api/v1/groups",
    tag = "groups",
    request_body = StartGroupBody,
    responses(
        (status = 201, description = "Group created, siblings scheduled"),
        (status = 400, description = "Invalid member list"),
        (status = 429, description = "Owner quota cannot cover every sibling")
    )
)]
pub async fn start_group(
    State(state): State<SharedState>,
    Json(body): Json<StartGroupBody>,
) -> Result<(StatusCode, Json<GenerationGroup>), ApiError> {
    let group = state.runtime.groups.start_group(body.into()).await?;
    Ok((StatusCode::CREATED, Json(group)))
}

/// Per-sibling report and aggregate status
#[utoipa::path(
    get,
    path = "/api/v1/groups/{id}",
    tag = "groups",
    params(("id" = String, Path, description = "Group id")),
    responses(
        (status = 200, description = "Group report"),
        (status = 404, description = "Unknown group")
    )
)]
pub async fn get_group(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<GroupReport>, ApiError> {
    Ok(Json(state.runtime.groups.group_status(&id).await?))
}

/// Fail siblings that have not started; running siblings continue
#[utoipa::path(
    post,
    path = "/api/v1/groups/{id}/cancel",
    tag = "groups",
    params(("id" = String, Path, description = "Group id")),
    responses(
        (status = 200, description = "Group report after cancellation"),
        (status = 404, description = "Unknown group")
    )
)]
pub async fn cancel_group(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<GroupReport>, ApiError> {
    Ok(Json(state.runtime.groups.cancel_group(&id).await?))
}
