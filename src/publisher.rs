//! Release publishing: atomic serving-root swap, proxy reload and retention.
//!
//! Layout under the project root:
//!
//! ```text
//! releases/20250101T120000123456Z-1a2b3c4d/   one directory per published build
//! current -> releases/20250101T120000123456Z-1a2b3c4d
//! ```
//!
//! The serving root is only ever changed by renaming a freshly created symlink
//! over it, which is atomic on POSIX filesystems.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::DeployError;
use crate::pipeline::{BuildArtifact, Invocation, ProcessRunner, shell_command};

const PROXY_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Sortable, timestamp-prefixed directory name for a release.
pub fn release_name(suffix: &str) -> String {
    let suffix: String = suffix
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(12)
        .collect();
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%6fZ");
    if suffix.is_empty() {
        stamp.to_string()
    } else {
        format!("{}-{}", stamp, suffix)
    }
}

/// Front-end proxy serving the published files.
#[async_trait]
pub trait ProxyControl: Send + Sync {
    /// Gracefully reload the static-file mapping.
    async fn reload(&self) -> Result<(), DeployError>;
    /// Whether the proxy process is still alive.
    async fn is_alive(&self) -> Result<bool, DeployError>;
}

/// Used when no proxy is managed by this service.
#[derive(Debug, Default)]
pub struct NoopProxy;

#[async_trait]
impl ProxyControl for NoopProxy {
    async fn reload(&self) -> Result<(), DeployError> {
        Ok(())
    }

    async fn is_alive(&self) -> Result<bool, DeployError> {
        Ok(true)
    }
}

/// Reloads and health-checks the proxy through shell-level commands,
/// e.g. `nginx -s reload` and `pgrep -x nginx`.
pub struct CommandProxy {
    runner: Arc<dyn ProcessRunner>,
    reload_command: String,
    health_command: String,
    cwd: PathBuf,
}

impl CommandProxy {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        reload_command: impl Into<String>,
        health_command: impl Into<String>,
        cwd: PathBuf,
    ) -> Self {
        Self {
            runner,
            reload_command: reload_command.into(),
            health_command: health_command.into(),
            cwd,
        }
    }

    fn invocation(&self, step: &str, command_line: &str) -> Result<Invocation, DeployError> {
        let (program, args) = shell_command(command_line).ok_or_else(|| {
            DeployError::ConfigError(format!("proxy {} command is empty", step))
        })?;
        Ok(Invocation {
            step: step.to_string(),
            program,
            args,
            cwd: self.cwd.clone(),
            timeout: PROXY_COMMAND_TIMEOUT,
        })
    }
}

#[async_trait]
impl ProxyControl for CommandProxy {
    async fn reload(&self) -> Result<(), DeployError> {
        let invocation = self.invocation("proxy_reload", &self.reload_command)?;
        info!("Reloading proxy: {}", invocation.command_line());
        let output = self.runner.run(&invocation).await?;
        if output.success() {
            Ok(())
        } else {
            Err(DeployError::StepFailed {
                step: invocation.step,
                excerpt: output.stderr.trim().to_string(),
            })
        }
    }

    async fn is_alive(&self) -> Result<bool, DeployError> {
        let invocation = self.invocation("proxy_health", &self.health_command)?;
        let output = self.runner.run(&invocation).await?;
        Ok(output.success())
    }
}

/// One directory in the release history
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseEntry {
    pub name: String,
    pub path: PathBuf,
    pub created_at: Option<DateTime<Utc>>,
    pub current: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishReport {
    pub release: String,
    pub path: PathBuf,
    pub previous: Option<String>,
    pub pruned: Vec<String>,
}

pub struct ReleasePublisher {
    serving_root: PathBuf,
    releases_dir: PathBuf,
    retention: usize,
    proxy: Arc<dyn ProxyControl>,
}

impl ReleasePublisher {
    pub fn new(
        serving_root: PathBuf,
        releases_dir: PathBuf,
        retention: usize,
        proxy: Arc<dyn ProxyControl>,
    ) -> Self {
        Self {
            serving_root,
            releases_dir,
            retention: retention.max(1),
            proxy,
        }
    }

    /// Move the artifact into the history, swap the serving root onto it,
    /// prune old releases, then reload and check the proxy.
    pub async fn publish(
        &self,
        artifact: &BuildArtifact,
        commit: &str,
    ) -> Result<PublishReport, DeployError> {
        self.ensure_swappable().await?;
        fs::create_dir_all(&self.releases_dir).await.map_err(|e| {
            DeployError::PublishFailed(format!(
                "cannot create {}: {}",
                self.releases_dir.display(),
                e
            ))
        })?;

        let short_commit: String = commit.chars().take(8).collect();
        let (name, release_path) = self.unique_release_path(&short_commit).await;
        fs::rename(&artifact.path, &release_path).await.map_err(|e| {
            DeployError::PublishFailed(format!(
                "cannot move {} to {}: {}",
                artifact.path.display(),
                release_path.display(),
                e
            ))
        })?;

        let previous = self.current_release().await;
        self.swap_to(&release_path).await?;
        info!(
            "Serving root {} now points at {}",
            self.serving_root.display(),
            release_path.display()
        );

        let pruned = match self.prune().await {
            Ok(pruned) => pruned,
            Err(e) => {
                warn!("Failed to prune release history: {}", e);
                Vec::new()
            }
        };

        self.check_proxy(&name).await?;

        Ok(PublishReport {
            release: name,
            path: release_path,
            previous,
            pruned,
        })
    }

    /// Point the serving root back at an older release. Nothing is deleted.
    /// Without a `target`, the newest release older than the current one is used.
    pub async fn rollback(&self, target: Option<&str>) -> Result<PublishReport, DeployError> {
        self.ensure_swappable().await?;
        let history = self.history().await?;
        let current = self.current_release().await;

        let entry = match target {
            Some(name) => history.iter().find(|e| e.name == name).ok_or_else(|| {
                DeployError::PublishFailed(format!("release '{}' not found", name))
            })?,
            None => history
                .iter()
                .find(|e| match &current {
                    Some(current) => e.name.as_str() < current.as_str(),
                    None => true,
                })
                .ok_or_else(|| {
                    DeployError::PublishFailed("no older release to roll back to".to_string())
                })?,
        };

        if current.as_deref() == Some(entry.name.as_str()) {
            return Err(DeployError::PublishFailed(format!(
                "release '{}' is already live",
                entry.name
            )));
        }

        self.swap_to(&entry.path).await?;
        warn!(
            "Rolled back serving root from {:?} to {}",
            current, entry.name
        );
        self.check_proxy(&entry.name).await?;

        Ok(PublishReport {
            release: entry.name.clone(),
            path: entry.path.clone(),
            previous: current,
            pruned: Vec::new(),
        })
    }

    /// Name of the release the serving root points at, if any.
    pub async fn current_release(&self) -> Option<String> {
        let target = fs::read_link(&self.serving_root).await.ok()?;
        target.file_name().map(|n| n.to_string_lossy().to_string())
    }

    /// All releases, newest first.
    pub async fn history(&self) -> Result<Vec<ReleaseEntry>, DeployError> {
        let current = self.current_release().await;
        let mut entries = Vec::new();

        let mut dir = match fs::read_dir(&self.releases_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !entry.file_type().await?.is_dir() {
                continue;
            }
            let created_at = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from);
            entries.push(ReleaseEntry {
                current: current.as_deref() == Some(name.as_str()),
                path: entry.path(),
                created_at,
                name,
            });
        }

        entries.sort_by(|a, b| b.name.cmp(&a.name));
        Ok(entries)
    }

    /// Delete the oldest releases beyond the retention bound.
    /// The live release is never deleted.
    pub async fn prune(&self) -> Result<Vec<String>, DeployError> {
        let history = self.history().await?;
        let mut pruned = Vec::new();
        for entry in history.into_iter().skip(self.retention) {
            if entry.current {
                continue;
            }
            fs::remove_dir_all(&entry.path).await?;
            info!("Pruned old release {}", entry.name);
            pruned.push(entry.name);
        }
        Ok(pruned)
    }

    async fn ensure_swappable(&self) -> Result<(), DeployError> {
        match fs::symlink_metadata(&self.serving_root).await {
            Ok(meta) if !meta.file_type().is_symlink() => Err(DeployError::PublishFailed(format!(
                "serving root {} exists and is not a symlink; move it aside once so it can be managed",
                self.serving_root.display()
            ))),
            _ => Ok(()),
        }
    }

    async fn unique_release_path(&self, suffix: &str) -> (String, PathBuf) {
        let base = release_name(suffix);
        let mut name = base.clone();
        let mut n = 1;
        while fs::symlink_metadata(self.releases_dir.join(&name)).await.is_ok() {
            name = format!("{}-{}", base, n);
            n += 1;
        }
        let path = self.releases_dir.join(&name);
        (name, path)
    }

    /// Create a temporary symlink next to the serving root and rename it over.
    async fn swap_to(&self, target: &Path) -> Result<(), DeployError> {
        let file_name = self
            .serving_root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "current".to_string());
        let tmp = self
            .serving_root
            .with_file_name(format!(".{}.tmp-{}", file_name, Uuid::now_v7()));

        if let Some(parent) = self.serving_root.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::symlink(target, &tmp).await.map_err(|e| {
            DeployError::PublishFailed(format!("cannot create symlink {}: {}", tmp.display(), e))
        })?;
        if let Err(e) = fs::rename(&tmp, &self.serving_root).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(DeployError::PublishFailed(format!(
                "cannot swap {}: {}",
                self.serving_root.display(),
                e
            )));
        }
        Ok(())
    }

    async fn check_proxy(&self, release: &str) -> Result<(), DeployError> {
        if let Err(e) = self.proxy.reload().await {
            error!("Proxy reload failed after publishing {}: {}", release, e);
            return Err(DeployError::PublishedUnhealthy {
                release: release.to_string(),
                reason: format!("reload failed: {}", e),
            });
        }
        match self.proxy.is_alive().await {
            Ok(true) => Ok(()),
            Ok(false) => {
                error!("Proxy is not running after publishing {}", release);
                Err(DeployError::PublishedUnhealthy {
                    release: release.to_string(),
                    reason: "proxy process is not alive after reload".to_string(),
                })
            }
            Err(e) => Err(DeployError::PublishedUnhealthy {
                release: release.to_string(),
                reason: format!("health check failed: {}", e),
            }),
        }
    }
}
