//! Liveness endpoint

use axum::http::StatusCode;

/// GET /-/healthy
///
/// Always succeeds while the server accepts requests
pub async fn healthy() -> StatusCode {
    StatusCode::OK
}
