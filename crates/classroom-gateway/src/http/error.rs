use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use classroom_core::ClassroomError;
use classroom_lifecycle::LifecycleError;
use classroom_scheduler::SchedulerError;
use serde::Serialize;
use tracing::error;

/// JSON error body returned by every route: `{ "error": ..., "code": ... }`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: message.into(),
                code,
            },
        }
    }

    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        error!("request failed: {message}");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::JobNotFound { .. } => {
                Self::new(StatusCode::NOT_FOUND, "JOB_NOT_FOUND", e.to_string())
            }
            SchedulerError::JobRunning { .. } => Self::conflict("JOB_RUNNING", e.to_string()),
            SchedulerError::InvalidSchedule(_) => {
                Self::new(StatusCode::BAD_REQUEST, "INVALID_SCHEDULE", e.to_string())
            }
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<ClassroomError> for ApiError {
    fn from(e: ClassroomError) -> Self {
        let status = match e {
            ClassroomError::ClassNotFound { .. } => StatusCode::NOT_FOUND,
            ClassroomError::InvalidTransition { .. } => StatusCode::CONFLICT,
            ClassroomError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            _ => return Self::internal(e.to_string()),
        };
        Self::new(status, e.code(), e.to_string())
    }
}

impl From<LifecycleError> for ApiError {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::ClassNotFound { id } => ClassroomError::ClassNotFound { id }.into(),
            LifecycleError::Transition(inner) => inner.into(),
            LifecycleError::Scheduler(inner) => inner.into(),
            other => Self::internal(other.to_string()),
        }
    }
}
