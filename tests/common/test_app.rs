//! Test application setup: a router over a temporary project directory

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{Router, body::Body, http::Request};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

use simple_deploy_hook::utils::{SIGNATURE_HEADER, sign_payload};
use simple_deploy_hook::{AppState, DeployConfig, SharedState, api};

use super::mocks::{FakeProxy, FakeRunner};

pub const TEST_SECRET: &str = "test-secret";

pub struct TestApp {
    pub router: Router,
    pub state: SharedState,
    pub runner: Arc<FakeRunner>,
    pub proxy: Arc<FakeProxy>,
    pub dir: TempDir,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Build an app over a fresh project directory, letting the caller
    /// adjust the config first.
    pub fn with_config(adjust: impl FnOnce(&mut DeployConfig)) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut config = DeployConfig::default();
        config.project.path = dir.path().to_path_buf();
        config.server.secret = Some(TEST_SECRET.to_string());
        adjust(&mut config);

        let runner = Arc::new(FakeRunner::default());
        let proxy = Arc::new(FakeProxy::default());
        let state = Arc::new(
            AppState::new(config, runner.clone(), proxy.clone())
                .expect("Failed to build app state"),
        );
        let router = api::router(state.clone());

        Self {
            router,
            state,
            runner,
            proxy,
            dir,
        }
    }

    pub fn project(&self) -> &Path {
        self.dir.path()
    }

    pub fn serving_root(&self) -> PathBuf {
        self.project().join("current")
    }

    /// Release directory the serving root currently points at
    pub fn live_release(&self) -> Option<String> {
        std::fs::read_link(self.serving_root())
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
    }

    pub fn release_count(&self) -> usize {
        std::fs::read_dir(self.project().join("releases"))
            .map(|dir| {
                dir.flatten()
                    .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
                    .count()
            })
            .unwrap_or(0)
    }

    pub async fn get(&self, uri: &str) -> TestResponse {
        self.request(
            Request::builder()
                .method("GET")
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    /// POST a body signed with the test secret
    pub async fn post_signed(&self, uri: &str, body: &str, event: Option<&str>) -> TestResponse {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json")
            .header(SIGNATURE_HEADER, sign_payload(TEST_SECRET, body.as_bytes()));
        if let Some(event) = event {
            builder = builder.header("X-GitHub-Event", event);
        }
        self.request(builder.body(Body::from(body.to_string())).unwrap())
            .await
    }

    pub async fn post_with_signature(
        &self,
        uri: &str,
        body: &str,
        signature: Option<&str>,
    ) -> TestResponse {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }
        self.request(builder.body(Body::from(body.to_string())).unwrap())
            .await
    }

    /// Signed push event for `branch`
    pub async fn push(&self, branch: &str, commit: &str) -> TestResponse {
        self.post_signed("/deploy", &push_payload(branch, commit), Some("push"))
            .await
    }

    pub async fn request(&self, request: Request<Body>) -> TestResponse {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to execute request");

        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("Failed to read response body");

        TestResponse { status, body }
    }
}

pub fn push_payload(branch: &str, commit: &str) -> String {
    json!({
        "ref": format!("refs/heads/{}", branch),
        "after": commit,
        "repository": { "full_name": "acme/site" },
        "head_commit": { "id": commit, "message": "Update landing page" },
    })
    .to_string()
}

#[derive(Debug)]
pub struct TestResponse {
    pub status: axum::http::StatusCode,
    pub body: axum::body::Bytes,
}

impl TestResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("Failed to parse response as JSON")
    }

    pub fn assert_status(&self, expected: axum::http::StatusCode) -> &Self {
        assert_eq!(
            self.status,
            expected,
            "Expected status {}, got {}. Body: {}",
            expected,
            self.status,
            self.text()
        );
        self
    }
}
