//! Status API endpoints

use axum::{
    Json,
    extract::{Path, State as AxumState},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::json;
use tracing::warn;

use crate::SharedState;

/// GET /status - server, deploy lock, release and recent job information
pub async fn status(AxumState(state): AxumState<SharedState>) -> impl IntoResponse {
    let history = state.deployer.history().await.unwrap_or_else(|e| {
        warn!("Failed to list release history: {}", e);
        Vec::new()
    });
    let jobs = state.deployer.recent_jobs(10).await;

    Json(json!({
        "server": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "started_at": state.started_at,
            "uptime_seconds": state.start_time.elapsed().as_secs(),
        },
        "deploy": state.deployer.state(),
        "release": {
            "current": state.deployer.current_release().await,
            "history": history,
        },
        "jobs": {
            "recent": jobs,
            "count": jobs.len(),
        },
        "config": {
            "release_branch": state.config.project.release_branch,
            "retention": state.config.publish.retention,
        }
    }))
}

/// GET /jobs/{id} - a recent job including its captured log lines
pub async fn get_job(
    AxumState(state): AxumState<SharedState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.deployer.get_job(&id).await {
        Some(job) => Json(job).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Job not found"})),
        )
            .into_response(),
    }
}
