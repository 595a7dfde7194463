//! Webhook handlers for GitHub push events and rollbacks

use axum::{
    Json,
    body::Bytes,
    extract::State as AxumState,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::SharedState;
use crate::error::DeployError;
use crate::job::DeployJob;
use crate::utils::{SIGNATURE_HEADER, verify_request};
use crate::webhook::{WebhookEvent, classify_event};

/// Commit id recorded when a push payload carries none
pub const UNKNOWN_COMMIT: &str = "unknown";

/// Map an error to the status code the webhook sender sees.
pub fn status_for(error: &DeployError) -> StatusCode {
    match error {
        DeployError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        DeployError::Busy { .. } => StatusCode::CONFLICT,
        DeployError::PublishedUnhealthy { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn summary_for(error: &DeployError) -> &'static str {
    match error {
        DeployError::Unauthorized(_) => "Invalid or missing signature",
        DeployError::Busy { .. } => "Deploy already in progress",
        DeployError::PublishedUnhealthy { .. } => "Release published but proxy is unhealthy",
        DeployError::PublishFailed(_) => "Publish failed",
        DeployError::StepFailed { .. }
        | DeployError::StepTimeout { .. }
        | DeployError::PipelineTimeout(_)
        | DeployError::InvalidArtifact(_) => "Deploy failed",
        _ => "Internal error",
    }
}

/// JSON error body with enough detail to find the matching deploy log lines.
pub fn error_response(error: &DeployError, job: Option<&DeployJob>) -> Response {
    let mut details = json!({
        "message": error.to_string(),
        "step": error.step(),
        "timestamp": Utc::now().to_rfc3339(),
    });

    match error {
        DeployError::Busy { job_id, .. } => {
            details["running_job_id"] = json!(job_id);
        }
        DeployError::PublishedUnhealthy { release, .. } => {
            details["published"] = json!(true);
            details["release"] = json!(release);
        }
        _ => {}
    }
    if let Some(job) = job {
        details["job_id"] = json!(job.id);
        details["commit"] = json!(job.trigger_commit_id);
    }

    (
        status_for(error),
        Json(json!({
            "error": summary_for(error),
            "details": details,
        })),
    )
        .into_response()
}

fn authenticate(state: &SharedState, headers: &HeaderMap, body: &Bytes) -> Result<(), DeployError> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    verify_request(
        state.config.server.secret.as_deref(),
        state.config.server.allow_unsigned,
        body,
        signature,
    )
}

/// Handles the GitHub webhook POST request.
///
/// The body is verified as raw bytes before anything parses it.
pub async fn handle_webhook(
    AxumState(state): AxumState<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(e) = authenticate(&state, &headers, &body) {
        warn!("Rejected webhook: {}", e);
        return error_response(&e, None);
    }

    // Only handle "push" events; a missing header is treated as a push.
    let event_opt = headers.get("X-GitHub-Event").and_then(|v| v.to_str().ok());
    match event_opt {
        Some("ping") => {
            info!("Received ping event");
            return (StatusCode::OK, Json(json!({"message": "pong"}))).into_response();
        }
        Some(other) if other != "push" => {
            info!("Not push event; Received {:?} event", other);
            return (
                StatusCode::OK,
                Json(json!({"message": "Event ignored", "event": other})),
            )
                .into_response();
        }
        _ => {}
    }

    let event = match WebhookEvent::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            info!("Could not parse JSON body: {:?}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Invalid JSON payload", "details": e.to_string()})),
            )
                .into_response();
        }
    };
    debug!("{:#?}", &event);

    let release_ref = state.config.release_ref();
    let classification = classify_event(
        &event,
        &release_ref,
        state.config.project.repository.as_deref(),
    );
    if !classification.should_deploy {
        info!("Ignoring push: {}", classification.reason);
        let message = if event.git_ref.as_deref() == Some(release_ref.as_str()) {
            "Repository ignored"
        } else {
            "Branch ignorada"
        };
        return (
            StatusCode::OK,
            Json(json!({
                "message": message,
                "ref": event.git_ref,
                "reason": classification.reason,
            })),
        )
            .into_response();
    }

    let commit = match event.commit_id() {
        Some(id) => id.to_string(),
        None => {
            warn!(
                "Push to {} has neither head_commit.id nor after; deploying as commit '{}' (repository {:?})",
                release_ref,
                UNKNOWN_COMMIT,
                event.repository_full_name()
            );
            UNKNOWN_COMMIT.to_string()
        }
    };
    info!(
        "Push to {} for commit {} accepted, starting deploy",
        release_ref, commit
    );

    let outcome = match state.deployer.deploy(&commit, event.commit_message()).await {
        Ok(outcome) => outcome,
        Err(e) => {
            if matches!(e, DeployError::Busy { .. }) {
                warn!("Rejected deploy of {}: {}", commit, e);
            } else {
                error!("Could not start deploy of {}: {}", commit, e);
            }
            return error_response(&e, None);
        }
    };

    match outcome.result {
        Ok(report) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": "Deploy completed successfully",
                "commit": commit,
                "timestamp": Utc::now().to_rfc3339(),
                "job_id": outcome.job.id,
                "release": report.release,
                "previous_release": report.previous,
                "pruned": report.pruned,
            })),
        )
            .into_response(),
        Err(e) => error_response(&e, Some(&outcome.job)),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RollbackRequest {
    /// Release directory name; defaults to the one before the live release
    pub release: Option<String>,
}

/// POST /rollback - point the serving root at an older release.
/// Signed exactly like /deploy.
pub async fn handle_rollback(
    AxumState(state): AxumState<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(e) = authenticate(&state, &headers, &body) {
        warn!("Rejected rollback: {}", e);
        return error_response(&e, None);
    }

    let request: RollbackRequest = if body.iter().all(|b| b.is_ascii_whitespace()) {
        RollbackRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": "Invalid JSON payload", "details": e.to_string()})),
                )
                    .into_response();
            }
        }
    };

    match state.deployer.rollback(request.release).await {
        Ok(report) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": "Rollback completed",
                "release": report.release,
                "previous_release": report.previous,
                "timestamp": Utc::now().to_rfc3339(),
            })),
        )
            .into_response(),
        Err(e) => {
            error!("Rollback failed: {}", e);
            error_response(&e, None)
        }
    }
}
