//! Configuration reload endpoint

use axum::extract::State;
use axum::http::{Method, StatusCode};
use tracing::debug;

use crate::actors::reload::ReloadRequestError;
use crate::api::{ApiError, ApiResult, ApiState};

/// ANY /-/reload
///
/// Only `POST` triggers a reload; the response is sent once it completed.
pub async fn reload(method: Method, State(state): State<ApiState>) -> ApiResult<StatusCode> {
    if method != Method::POST {
        return Err(ApiError::MethodNotAllowed(
            "Only POST requests allowed.".to_string(),
        ));
    }

    debug!("reload requested over HTTP");
    match state.reload.reload().await {
        Ok(_) => Ok(StatusCode::OK),
        Err(ReloadRequestError::Unavailable) => Err(ApiError::Unavailable(
            "Reload listener is not running.".to_string(),
        )),
        Err(ReloadRequestError::Failed(e)) => {
            Err(ApiError::Internal(format!("Failed to reload config: {e}")))
        }
    }
}
