//! Readiness endpoint
//!
//! Readiness is a live `vector(1)` query against the backend, bounded by the
//! configured timeout.

use axum::extract::State;
use axum::http::StatusCode;
use chrono::Utc;
use tracing::{error, trace};

use crate::api::{ApiError, ApiResult, ApiState};
use crate::query;

pub const READY_QUERY: &str = "vector(1)";

/// GET /-/ready
pub async fn ready(State(state): State<ApiState>) -> ApiResult<(StatusCode, &'static str)> {
    match query::query_vector_with_timeout(
        state.source.as_ref(),
        READY_QUERY,
        Utc::now(),
        state.ready_timeout,
    )
    .await
    {
        Ok(_) => {
            trace!("readiness query succeeded");
            Ok((StatusCode::OK, "Prometheus is Ready.\n"))
        }
        Err(e) => {
            error!("error querying Prometheus instance: {e}");
            Err(ApiError::Unavailable("Prometheus is not Ready.".to_string()))
        }
    }
}
