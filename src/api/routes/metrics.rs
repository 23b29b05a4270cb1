//! Self-monitoring exposition endpoint

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;

use crate::api::ApiState;

const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// GET /metrics
pub async fn metrics(State(state): State<ApiState>) -> impl IntoResponse {
    if let Some(process) = &state.process {
        process.collect();
    }
    ([(header::CONTENT_TYPE, CONTENT_TYPE)], state.metrics.render())
}
