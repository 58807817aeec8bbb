//! Error types for Shield Stack.
//!
//! `PipelineError` is what a single pipeline run can fail with. `ShieldError`
//! is the crate-wide error that maps cleanly to HTTP responses.

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::domain::{LayerId, LayerStage};

/// Fatal conditions of one pipeline run.
///
/// A trust-boundary violation is not an error; it is recorded in the trace.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Layer {layer} failed during {stage} stage: {reason}")]
    LayerExecution {
        layer: LayerId,
        stage: LayerStage,
        reason: String,
    },

    #[error("Protected system did not respond within {timeout:?}")]
    UpstreamTimeout { timeout: Duration },

    #[error("Protected system error: {0}")]
    Upstream(String),

    #[error("Run cancelled after {completed_layers} layer(s)")]
    Cancelled { completed_layers: usize },
}

impl PipelineError {
    /// Stable identifier used in stored failures and summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::InvalidRequest(_) => "invalid_request",
            PipelineError::InvalidConfiguration(_) => "invalid_configuration",
            PipelineError::LayerExecution { .. } => "layer_execution_error",
            PipelineError::UpstreamTimeout { .. } => "upstream_timeout",
            PipelineError::Upstream(_) => "upstream_error",
            PipelineError::Cancelled { .. } => "cancelled",
        }
    }

    /// Whether the caller may retry the run as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::UpstreamTimeout { .. } | PipelineError::Upstream(_)
        )
    }
}

/// Unified error type for Shield Stack operations.
#[derive(Debug, Error)]
pub enum ShieldError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response body for API clients.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for ShieldError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self {
            ShieldError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone(), None),
            ShieldError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone(), None)
            }
            ShieldError::Pipeline(e) => {
                let status = match e {
                    PipelineError::InvalidRequest(_) | PipelineError::InvalidConfiguration(_) => {
                        StatusCode::BAD_REQUEST
                    }
                    PipelineError::LayerExecution { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                    PipelineError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                    PipelineError::Upstream(_) => StatusCode::BAD_GATEWAY,
                    PipelineError::Cancelled { .. } => StatusCode::SERVICE_UNAVAILABLE,
                };
                if status.is_server_error() {
                    tracing::error!(error = %e, kind = e.kind(), "Pipeline run failed");
                }
                (
                    status,
                    "PIPELINE_ERROR",
                    e.to_string(),
                    Some(e.kind().to_string()),
                )
            }
            ShieldError::Database(e) => {
                // Log the actual error but don't expose internals
                tracing::error!(error = %e, "Database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                    None,
                )
            }
            ShieldError::Config(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "CONFIG_ERROR",
                "Configuration error".to_string(),
                Some(msg.clone()),
            ),
            ShieldError::Serialization(e) => (
                StatusCode::BAD_REQUEST,
                "SERIALIZATION_ERROR",
                "Failed to process request/response".to_string(),
                Some(e.to_string()),
            ),
            ShieldError::Io(e) => {
                tracing::error!(error = %e, "I/O error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "IO_ERROR",
                    "An I/O error occurred".to_string(),
                    None,
                )
            }
            ShieldError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                    None,
                )
            }
        };

        let body = ErrorResponse {
            error: message,
            code: code.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for Shield operations.
pub type ShieldResult<T> = Result<T, ShieldError>;
