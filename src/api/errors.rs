use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::error::{OrchestratorError, PersistenceError};

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Application error type that converts to HTTP responses.
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    /// The request is valid but conflicts with the session's current state.
    Conflict(String),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, details) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg, None),
            AppError::Internal(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                Some(format!("{:#}", err)),
            ),
        };

        (status, Json(ErrorResponse { error, details })).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::WorkflowPlanning(_) => AppError::BadRequest(err.to_string()),
            OrchestratorError::SessionNotFound(_) => AppError::NotFound(err.to_string()),
            OrchestratorError::InvalidModification(_)
            | OrchestratorError::InvalidTransition { .. } => AppError::Conflict(err.to_string()),
            OrchestratorError::Persistence(
                PersistenceError::SessionNotFound(_) | PersistenceError::VersionNotFound { .. },
            ) => AppError::NotFound(err.to_string()),
            OrchestratorError::Persistence(PersistenceError::InvalidSessionId(_)) => {
                AppError::BadRequest(err.to_string())
            }
            other => AppError::Internal(other.into()),
        }
    }
}
