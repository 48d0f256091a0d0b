//! Server-layer error taxonomy. Pure-logic failures use
//! `dispatch_core::CoreError`; everything here is about I/O (database,
//! timed locks) and is inherently retriable unless stated otherwise.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Core(#[from] dispatch_core::CoreError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("operation timed out: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("lock wait timed out: {0}")]
    LockTimeout(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl ServerError {
    /// True for failures the task queue should retry rather than fail the order outright.
    pub fn is_transient(&self) -> bool {
        matches!(self, ServerError::Database(_) | ServerError::Timeout(_) | ServerError::LockTimeout(_))
    }
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Maps the error taxonomy of §7 onto HTTP status codes: validation/conflict
/// errors are the caller's fault and never retried, `NotFound` is a 404, and
/// infrastructure failures (DB, lock timeout) come back as a retriable 503
/// rather than a 500 since the task queue would retry the same operation.
impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::Core(dispatch_core::CoreError::Validation(_)) => StatusCode::BAD_REQUEST,
            ServerError::Core(dispatch_core::CoreError::NotFound(_)) | ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Core(dispatch_core::CoreError::Conflict(_)) => StatusCode::CONFLICT,
            ServerError::Core(dispatch_core::CoreError::Fatal(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ServerError::Database(_) | ServerError::Timeout(_) | ServerError::LockTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
