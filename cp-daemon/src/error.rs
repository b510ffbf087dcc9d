use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cp_core::ControlPlaneError;
use serde_json::json;

/// Maps the kernel's domain errors onto HTTP status codes, the same way
/// `AppError`'s `IntoResponse` does: client-caused errors (not-found, bad
/// state, bad request body) get their own status, anything else collapses
/// to 500 with the detail logged rather than exposed.
pub struct ApiError(pub ControlPlaneError);

impl From<ControlPlaneError> for ApiError {
    fn from(err: ControlPlaneError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ControlPlaneError::WorkflowNotFound { .. } => StatusCode::NOT_FOUND,
            ControlPlaneError::InvalidSpec { .. } => StatusCode::BAD_REQUEST,
            ControlPlaneError::InvalidState { .. }
            | ControlPlaneError::InvalidStateTransition { .. }
            | ControlPlaneError::UncommittedChanges { .. } => StatusCode::CONFLICT,
            ControlPlaneError::WorktreeBranchConflict { .. }
            | ControlPlaneError::WorktreePathConflict { .. } => StatusCode::CONFLICT,
            ControlPlaneError::WorktreeTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ControlPlaneError::InvalidRecoveryAction { .. } => StatusCode::BAD_REQUEST,
            ControlPlaneError::Persistence { .. } | ControlPlaneError::Infrastructure { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "request failed");
        }

        let body = Json(json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}
