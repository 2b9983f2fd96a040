//! HTTP routes

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::AppState;
use crate::analytics::diagnostics::DiagnosticsSnapshot;

const STATS_BUDGET: Duration = Duration::from_secs(5);

/// Current traffic stats, from cache or freshly computed
pub async fn api_stats(State(state): State<Arc<AppState>>) -> Response {
    match tokio::time::timeout(STATS_BUDGET, state.stats.get_stats()).await {
        Ok(Ok(result)) => Json(result).into_response(),
        Ok(Err(e)) => {
            warn!(error = %e, "compute stats failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
        Err(_) => {
            warn!(budget_secs = STATS_BUDGET.as_secs(), "compute stats timed out");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "stats computation timed out")
        }
    }
}

pub async fn api_diagnostics(State(state): State<Arc<AppState>>) -> Json<DiagnosticsSnapshot> {
    Json(state.diagnostics.snapshot())
}

pub async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "not found")
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
