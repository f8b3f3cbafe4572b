//! Error types and error handling for the application
//!
//! This module defines custom error types that can be converted to HTTP responses.
//! All errors implement `IntoResponse` to provide consistent error formatting:
//! `{"error": ..., "message"?: ..., "stage"?: ..., "details"?: ..., "status": ...}`.

use crate::onboarding::orchestrator::{Stage, StageFailure};
use crate::onboarding::types::FailureKind;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Application-level error types
///
/// All errors that can occur in the application are represented by this enum.
/// Each variant implements automatic conversion to HTTP responses via `IntoResponse`.
#[derive(Error, Debug)]
pub enum AppError {
    /// Missing or malformed input, reported before any remote call
    #[error("{0}")]
    Validation(String),

    /// Organization name taken or duplicate resource
    #[error("{error}")]
    NameConflict {
        /// Failing stage
        stage: Stage,
        /// Short summary
        error: String,
        /// Longer description
        message: Option<String>,
        /// Upstream error body
        details: Option<Value>,
    },

    /// Platform declined a step; its status is passed through
    #[error("{error} (HTTP {status})")]
    UpstreamRejected {
        /// Failing stage
        stage: Stage,
        /// Upstream HTTP status
        status: u16,
        /// Short summary
        error: String,
        /// Longer description
        message: Option<String>,
        /// Upstream error body
        details: Option<Value>,
    },

    /// Application or role the run depends on does not exist
    #[error("{error}")]
    NotFound {
        /// Failing stage
        stage: Stage,
        /// Short summary
        error: String,
    },

    /// A poller exhausted its budget
    #[error("{error}")]
    ProvisioningTimeout {
        /// Stage that timed out
        stage: Stage,
        /// Short summary naming what was awaited
        error: String,
        /// Longer description
        message: Option<String>,
    },

    /// Identity platform could not be reached
    #[error("Identity platform unavailable: {message}")]
    UpstreamUnavailable {
        /// Failing stage
        stage: Stage,
        /// Transport error description
        message: String,
    },

    /// Internal server error (catch-all for unexpected errors)
    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<StageFailure> for AppError {
    fn from(failure: StageFailure) -> Self {
        let StageFailure {
            stage,
            kind,
            status,
            error,
            message,
            details,
        } = failure;

        match kind {
            FailureKind::Timeout => AppError::ProvisioningTimeout {
                stage,
                error,
                message,
            },
            FailureKind::Conflict => AppError::NameConflict {
                stage,
                error,
                message,
                details,
            },
            FailureKind::NotFound => AppError::NotFound {
                stage,
                error: message.unwrap_or(error),
            },
            FailureKind::Unavailable => AppError::UpstreamUnavailable {
                stage,
                message: message.unwrap_or(error),
            },
            FailureKind::Rejected => AppError::UpstreamRejected {
                stage,
                status,
                error,
                message,
                details,
            },
            FailureKind::Internal => AppError::Internal(anyhow::anyhow!(
                "{} at stage {}: {}",
                error,
                stage,
                message.unwrap_or_default()
            )),
        }
    }
}

/// Status to report for an upstream rejection
///
/// A rejection carrying a non-error status (e.g. 200 where 201 was
/// required) is reported as a bad gateway.
fn passthrough_status(status: u16) -> StatusCode {
    match StatusCode::from_u16(status) {
        Ok(code) if code.is_client_error() || code.is_server_error() => code,
        _ => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut body = Map::new();

        let status = match self {
            AppError::Validation(msg) => {
                body.insert("error".into(), json!(msg));
                StatusCode::BAD_REQUEST
            }
            AppError::NameConflict {
                stage,
                error,
                message,
                details,
            } => {
                body.insert("error".into(), json!(error));
                body.insert("stage".into(), json!(stage));
                insert_optional(&mut body, "message", message.map(Value::String));
                insert_optional(&mut body, "details", details);
                StatusCode::CONFLICT
            }
            AppError::UpstreamRejected {
                stage,
                status,
                error,
                message,
                details,
            } => {
                body.insert("error".into(), json!(error));
                body.insert("stage".into(), json!(stage));
                insert_optional(&mut body, "message", message.map(Value::String));
                insert_optional(&mut body, "details", details);
                passthrough_status(status)
            }
            AppError::NotFound { stage, error } => {
                body.insert("error".into(), json!(error));
                body.insert("stage".into(), json!(stage));
                StatusCode::NOT_FOUND
            }
            AppError::ProvisioningTimeout {
                stage,
                error,
                message,
            } => {
                body.insert("error".into(), json!(error));
                body.insert("stage".into(), json!(stage));
                insert_optional(&mut body, "message", message.map(Value::String));
                StatusCode::REQUEST_TIMEOUT
            }
            AppError::UpstreamUnavailable { stage, message } => {
                body.insert("error".into(), json!("Identity platform unavailable"));
                body.insert("stage".into(), json!(stage));
                body.insert("message".into(), json!(message));
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Internal(err) => {
                // Full detail stays in the server log
                tracing::error!(error = ?err, "Internal error");
                body.insert("error".into(), json!("Internal Server Error"));
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        body.insert("status".into(), json!(status.as_u16()));
        (status, Json(Value::Object(body))).into_response()
    }
}

fn insert_optional(body: &mut Map<String, Value>, key: &str, value: Option<Value>) {
    if let Some(value) = value {
        body.insert(key.to_string(), value);
    }
}
