//! Unified error taxonomy for the sandbox session executor.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

/// Core error taxonomy (spec §7). Every fallible core operation ultimately
/// resolves to one of these variants at the HTTP/SSE boundary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session busy: a turn is already in flight for {0}")]
    Busy(String),

    #[error("port pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("provisioning failed: {0}")]
    ProvisioningFailed(String),

    #[error("port collision: {0}")]
    PortCollision(String),

    #[error("container unhealthy: {0}")]
    Unhealthy(String),

    #[error("upstream agent error: {0}")]
    UpstreamError(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Busy(_) => StatusCode::CONFLICT,
            Self::PoolExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::ProvisioningFailed(_) => StatusCode::BAD_GATEWAY,
            Self::PortCollision(_) => StatusCode::BAD_GATEWAY,
            Self::Unhealthy(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamError(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Cancelled(_) => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            Self::ConfigInvalid(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Busy(_) => "BUSY",
            Self::PoolExhausted(_) => "POOL_EXHAUSTED",
            Self::ProvisioningFailed(_) => "PROVISIONING_FAILED",
            Self::PortCollision(_) => "PORT_COLLISION",
            Self::Unhealthy(_) => "UNHEALTHY",
            Self::UpstreamError(_) => "UPSTREAM_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::Cancelled(_) => "CANCELLED",
            Self::ConfigInvalid(_) => "CONFIG_INVALID",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// The SSE terminal event tag a stream should close with for this error,
    /// per spec §4.5 ("exactly one terminal event ends the stream").
    pub fn stream_event_type(&self) -> &'static str {
        match self {
            Self::Cancelled(_) => "interrupted",
            _ => "error",
        }
    }
}

/// Structured `{code, message, data}` envelope (spec §9).
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let message = self.to_string();

        match &self {
            Self::Internal(_) | Self::ProvisioningFailed(_) | Self::Unhealthy(_) => {
                error!(error_code = code, message = %message, "request failed");
            }
            Self::PoolExhausted(_) | Self::UpstreamError(_) | Self::Timeout(_) | Self::PortCollision(_) => {
                warn!(error_code = code, message = %message, "request failed");
            }
            _ => tracing::debug!(error_code = code, message = %message, "request rejected"),
        }

        let body = ErrorEnvelope {
            code,
            message,
            data: None,
        };
        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(
            AppError::NotFound("s1".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::Busy("s1".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::PoolExhausted("api".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::Timeout("stream".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn cancelled_maps_to_interrupted_event() {
        assert_eq!(AppError::Cancelled("user".into()).stream_event_type(), "interrupted");
        assert_eq!(AppError::Timeout("x".into()).stream_event_type(), "error");
    }
}
