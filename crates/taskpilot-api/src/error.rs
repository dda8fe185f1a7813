//! API error types and JSON error response formatting.
//!
//! Every failure is rendered as `{error, message, details?}` with a status
//! code derived from the engine error that caused it.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use taskpilot_core::error::TaskPilotError;
use taskpilot_core::types::TaskState;
use taskpilot_engine::EngineError;

/// JSON error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Machine-readable error code (e.g., "bad_request", "not_found").
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    /// The task already reached a terminal state.
    #[error("Task {task_id} is already {state}")]
    TaskTerminal { task_id: Uuid, state: TaskState },
    /// Another operation holds the task's lock.
    #[error("Task {0} is busy with another operation")]
    TaskBusy(Uuid),
    #[error("{0}")]
    UnprocessableEntity(String),
    #[error("{0}")]
    Internal(String),
    /// An external collaborator (mail, telephony) is unavailable.
    #[error("{0}")]
    ServiceUnavailable(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, Option<Value>) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request", None),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found", None),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "conflict", None),
            ApiError::TaskTerminal { task_id, state } => (
                StatusCode::CONFLICT,
                "task_terminal",
                Some(json!({"task_id": task_id, "state": state})),
            ),
            ApiError::TaskBusy(task_id) => (
                StatusCode::CONFLICT,
                "task_busy",
                Some(json!({"task_id": task_id, "retryable": true})),
            ),
            ApiError::UnprocessableEntity(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "unprocessable_entity", None)
            }
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", None),
            ApiError::ServiceUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", None)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, details) = self.parts();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = ErrorBody {
            error: error_code.to_string(),
            message: self.to_string(),
            details,
        };
        (status, Json(body)).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound(msg) => ApiError::NotFound(msg),
            EngineError::InvalidInput(msg) => ApiError::BadRequest(msg),
            EngineError::Conflict(msg) => ApiError::Conflict(msg),
            EngineError::TerminalTask(task_id, state) => ApiError::TaskTerminal { task_id, state },
            EngineError::LockContention(task_id) => ApiError::TaskBusy(task_id),
            e @ (EngineError::InvalidTransition(..) | EngineError::UnexpectedTrigger(..)) => {
                ApiError::Conflict(e.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<TaskPilotError> for ApiError {
    fn from(err: TaskPilotError) -> Self {
        EngineError::from(err).into()
    }
}
