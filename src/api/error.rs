//! API error types and conversions
//!
//! Control plane errors are plain-text bodies, matching the Prometheus
//! management endpoints.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// API result type
pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    /// Request method not supported by the endpoint
    MethodNotAllowed(String),

    /// A dependency of the endpoint is not available
    Unavailable(String),

    /// Internal server error
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::MethodNotAllowed(msg) => (StatusCode::METHOD_NOT_ALLOWED, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = if message.ends_with('\n') {
            message
        } else {
            format!("{message}\n")
        };

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(format!("{err:#}"))
    }
}
