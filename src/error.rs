//! Error taxonomy shared by the identity model, the reverse job engine and
//! reconciliation sessions, plus its HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::model::QrStatus;

#[derive(Debug, Error)]
pub enum TraceError {
    /// Malformed or ambiguous input.
    #[error("validation error: {0}")]
    Validation(String),

    /// State-machine or ownership violation.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: QrStatus, to: QrStatus },

    #[error("not found: {0}")]
    NotFound(String),

    /// Missing linkage that should have been populated upstream.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = TraceError> = std::result::Result<T, E>;

impl TraceError {
    pub fn validation(msg: impl Into<String>) -> Self {
        TraceError::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        TraceError::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        TraceError::NotFound(msg.into())
    }

    /// Stable machine-readable category.
    pub fn kind(&self) -> &'static str {
        match self {
            TraceError::Validation(_) => "validation_error",
            TraceError::Conflict(_) => "conflict_error",
            TraceError::InvalidTransition { .. } => "invalid_transition",
            TraceError::NotFound(_) => "not_found",
            TraceError::Configuration(_) => "configuration_error",
            TraceError::Storage(_) | TraceError::Serialization(_) => "storage_error",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            TraceError::Validation(_) => StatusCode::BAD_REQUEST,
            TraceError::NotFound(_) => StatusCode::NOT_FOUND,
            TraceError::Conflict(_) | TraceError::InvalidTransition { .. } => StatusCode::CONFLICT,
            TraceError::Configuration(_) => StatusCode::UNPROCESSABLE_ENTITY,
            TraceError::Storage(_) | TraceError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

impl IntoResponse for TraceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Storage details stay in the logs.
        let message = match &self {
            TraceError::Storage(_) | TraceError::Serialization(_) => {
                "a storage error occurred".to_string()
            }
            other => other.to_string(),
        };
        if status.is_server_error() {
            tracing::error!(error = %self, kind = self.kind(), "request failed");
        } else {
            tracing::warn!(error = %self, kind = self.kind(), "request rejected");
        }
        (
            status,
            Json(ErrorBody {
                error: self.kind(),
                message,
            }),
        )
            .into_response()
    }
}

/// True for SQLite busy/locked conditions and pool exhaustion, which are worth
/// retrying within the same write attempt.
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some("5") | Some("6") | Some("261") | Some("262") | Some("517")
        ),
        _ => false,
    }
}

/// True when the error is a UNIQUE constraint violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(TraceError::validation("x").kind(), "validation_error");
        assert_eq!(TraceError::conflict("x").kind(), "conflict_error");
        assert_eq!(
            TraceError::InvalidTransition {
                from: QrStatus::Spoiled,
                to: QrStatus::Packed
            }
            .kind(),
            "invalid_transition"
        );
        assert_eq!(TraceError::not_found("x").kind(), "not_found");
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(
            TraceError::validation("bad").into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            TraceError::not_found("job 1").into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            TraceError::conflict("processed").into_response().status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            TraceError::Configuration("missing case".into())
                .into_response()
                .status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }
}
