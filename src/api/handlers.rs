//! Liveness and deploy log endpoints

use axum::{
    Json,
    extract::{Query, State as AxumState},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::SharedState;

/// Upper bound on lines a single /logs call may ask for
const MAX_LOG_LINES: usize = 500;

/// GET /health - liveness only; succeeds whatever the deploy state is
pub async fn health(AxumState(state): AxumState<SharedState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "project_path": state.config.project.path,
        "uptime": state.start_time.elapsed().as_secs_f64(),
        "secret_configured": state.config.has_valid_secret(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    /// Number of trailing lines (default from config, max 500)
    pub lines: Option<usize>,
}

/// GET /logs - last lines of the persisted deploy log
pub async fn get_logs(
    AxumState(state): AxumState<SharedState>,
    Query(params): Query<LogsQuery>,
) -> impl IntoResponse {
    let lines = params
        .lines
        .unwrap_or(state.config.project.log_tail_lines)
        .clamp(1, MAX_LOG_LINES);

    match state.deployer.deploy_log().tail(lines).await {
        Ok(logs) => (StatusCode::OK, Json(json!({ "logs": logs }))),
        Err(e) => {
            error!(
                "Failed to read deploy log {}: {}",
                state.deployer.deploy_log().path().display(),
                e
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": format!("Failed to read deploy log: {}", e) })),
            )
        }
    }
}
