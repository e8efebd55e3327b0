//! Error types for famtree-ingest HTTP handlers

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

use crate::models::PartialSummary;
use crate::services::IngestError;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Upload evicted after the retention window (410)
    #[error("Upload expired: {0}")]
    Gone(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Decision rejected; names the offending individual (400)
    #[error("Invalid decision for {source_id}: {message}")]
    Validation { source_id: String, message: String },

    /// Upload larger than the configured limit (413)
    #[error("Upload too large: {0}")]
    PayloadTooLarge(String),

    /// Conflict (409), e.g. commit of a committed upload
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Commit failed; carries the counts reached before the failure (500)
    #[error("Commit failed: {message}")]
    CommitFailed { message: String, summary: PartialSummary },

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// famtree-common error
    #[error("Common error: {0}")]
    Common(#[from] famtree_common::Error),
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Validation { source_id, reason } => ApiError::Validation {
                source_id,
                message: reason,
            },
            IngestError::Decode(e) => ApiError::BadRequest(e.to_string()),
            IngestError::SessionNotFound(_) => ApiError::NotFound(err.to_string()),
            IngestError::SessionExpired(_) => ApiError::Gone(err.to_string()),
            IngestError::InvalidState { .. } | IngestError::AlreadyCommitted(_) | IngestError::Cancelled(_) => {
                ApiError::Conflict(err.to_string())
            }
            IngestError::Storage { summary, message, .. } => ApiError::CommitFailed { message, summary },
            IngestError::Common(e) => ApiError::Common(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut details: Option<(&str, Value)> = None;

        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::Gone(msg) => (StatusCode::GONE, "UPLOAD_EXPIRED", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Validation { source_id, message } => {
                details = Some(("sourceId", Value::String(source_id)));
                (StatusCode::BAD_REQUEST, "INVALID_DECISION", message)
            }
            ApiError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::CommitFailed { message, summary } => {
                details = Some(("summary", serde_json::to_value(&summary).unwrap_or(Value::Null)));
                (StatusCode::INTERNAL_SERVER_ERROR, "COMMIT_FAILED", message)
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
            ApiError::Common(ref err) => (StatusCode::INTERNAL_SERVER_ERROR, "COMMON_ERROR", err.to_string()),
        };

        let mut error = json!({
            "code": error_code,
            "message": message,
        });
        if let (Some((key, value)), Some(object)) = (details, error.as_object_mut()) {
            object.insert(key.to_string(), value);
        }

        (status, Json(json!({ "error": error }))).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
