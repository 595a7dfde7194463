//! API module for all HTTP handlers

pub mod handlers;
pub mod stats;
pub mod webhook;

use axum::{Router, routing};

use crate::SharedState;

// Re-export handlers
pub use handlers::{get_logs, health};
pub use stats::{get_job, status};
pub use webhook::{handle_rollback, handle_webhook};

/// All routes served by the deploy hook
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/deploy", routing::post(handle_webhook))
        .route("/rollback", routing::post(handle_rollback))
        .route("/health", routing::get(health))
        .route("/logs", routing::get(get_logs))
        .route("/status", routing::get(status))
        .route("/jobs/{id}", routing::get(get_job))
        .with_state(state)
}
