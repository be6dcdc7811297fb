//! `ForgeError` to HTTP response mapping. The body is always the error report.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use storyforge_core::ForgeError;

#[derive(Debug)]
pub struct ApiError(pub ForgeError);

impl From<ForgeError> for ApiError {
    fn from(err: ForgeError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ForgeError::Validation(_) => StatusCode::BAD_REQUEST,
            ForgeError::NotFound { .. } => StatusCode::NOT_FOUND,
            ForgeError::Conflict(_) => StatusCode::CONFLICT,
            ForgeError::SessionExpired(_) => StatusCode::GONE,
            ForgeError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ForgeError::UpstreamGeneration(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.0.code(), "Request failed: {}", self.0);
        } else {
            tracing::debug!(code = self.0.code(), "Request rejected: {}", self.0);
        }
        (status, Json(self.0.report())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ForgeError::validation("x"), StatusCode::BAD_REQUEST),
            (ForgeError::session_not_found("s"), StatusCode::NOT_FOUND),
            (ForgeError::Conflict("s".into()), StatusCode::CONFLICT),
            (ForgeError::SessionExpired("s".into()), StatusCode::GONE),
            (
                ForgeError::QuotaExceeded {
                    owner: "a".into(),
                    requested: 3,
                    remaining: 1,
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (ForgeError::upstream("503"), StatusCode::BAD_GATEWAY),
            (ForgeError::internal("boom"), StatusCode::INTERNAL_SERVER_ERROR),
            (ForgeError::store("down"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError(err).status(), expected);
        }
    }
}
