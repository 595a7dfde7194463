pub mod api;
pub mod deploy;
pub mod deploy_log;
pub mod error;
pub mod job;
pub mod logging;
pub mod pipeline;
pub mod publisher;
pub mod serializer;
pub mod utils;
pub mod webhook;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::deploy::Deployer;
use crate::error::DeployError;
use crate::pipeline::ProcessRunner;
use crate::publisher::{ProxyControl, ReleasePublisher};

pub const DEFAULT_CONFIG_PATH: &str = "deploy_config.toml";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DeployConfig {
    pub server: ServerConfig,
    pub project: ProjectConfig,
    pub build: BuildConfig,
    pub publish: PublishConfig,
    pub proxy: ProxyConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub secret: Option<String>,
    /// Accept unsigned webhooks when no secret is configured. Development only.
    pub allow_unsigned: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            secret: None,
            allow_unsigned: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProjectConfig {
    pub path: PathBuf,
    pub release_branch: String,
    pub remote: String,
    /// Only pushes from this `owner/name` deploy, when set.
    pub repository: Option<String>,
    pub log_file: PathBuf,
    pub log_tail_lines: usize,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            path: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            release_branch: "main".to_string(),
            remote: "origin".to_string(),
            repository: None,
            log_file: PathBuf::from("deploy.log"),
            log_tail_lines: 50,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BuildConfig {
    pub stop_command: Option<String>,
    pub install_command: String,
    pub build_command: String,
    pub output_dir: PathBuf,
    pub step_timeout_secs: u64,
    pub pipeline_timeout_secs: u64,
    pub lock_stale_secs: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            stop_command: None,
            install_command: "npm ci".to_string(),
            build_command: "npm run build".to_string(),
            output_dir: PathBuf::from("dist"),
            step_timeout_secs: 300,
            pipeline_timeout_secs: 300,
            lock_stale_secs: 600,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PublishConfig {
    pub serving_root: PathBuf,
    pub releases_dir: PathBuf,
    /// Leftover build output moved aside before a build; never published.
    pub snapshots_dir: PathBuf,
    pub retention: usize,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            serving_root: PathBuf::from("current"),
            releases_dir: PathBuf::from("releases"),
            snapshots_dir: PathBuf::from(".snapshots"),
            retention: 3,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProxyConfig {
    pub enabled: bool,
    pub reload_command: String,
    pub health_command: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reload_command: "nginx -s reload".to_string(),
            health_command: "pgrep -x nginx".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: Option<PathBuf>,
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_files: 5,
        }
    }
}

impl DeployConfig {
    /// Load the configuration file if present, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DeployError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let config_str = std::fs::read_to_string(path).map_err(|e| {
                DeployError::ConfigError(format!(
                    "Failed to read config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
            toml::from_str(&config_str)?
        } else {
            DeployConfig::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the recognized environment variables on top of the file values.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), DeployError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("WEBHOOK_PORT") {
            self.server.port = port.parse().map_err(|_| {
                DeployError::ConfigError(format!("WEBHOOK_PORT is not a valid port: {}", port))
            })?;
        }
        if let Some(host) = lookup("WEBHOOK_HOST") {
            self.server.host = host;
        }
        if let Some(secret) = lookup("WEBHOOK_SECRET") {
            self.server.secret = Some(secret);
        }
        if let Some(open) = lookup("WEBHOOK_ALLOW_UNSIGNED") {
            self.server.allow_unsigned = matches!(open.as_str(), "1" | "true" | "yes");
        }
        if let Some(path) = lookup("PROJECT_PATH") {
            self.project.path = PathBuf::from(path);
        }
        if let Some(branch) = lookup("RELEASE_BRANCH") {
            self.project.release_branch = branch;
        }
        if let Some(dir) = lookup("LOG_DIR") {
            self.logging.dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), DeployError> {
        if self.publish.retention == 0 {
            return Err(DeployError::ConfigError(
                "publish.retention must be at least 1".to_string(),
            ));
        }
        if self.build.step_timeout_secs == 0 || self.build.pipeline_timeout_secs == 0 {
            return Err(DeployError::ConfigError(
                "build timeouts must be greater than zero".to_string(),
            ));
        }
        if self.build.install_command.trim().is_empty()
            || self.build.build_command.trim().is_empty()
        {
            return Err(DeployError::ConfigError(
                "build.install_command and build.build_command must not be empty".to_string(),
            ));
        }
        if self.snapshots_dir() == self.releases_dir() {
            return Err(DeployError::ConfigError(
                "publish.snapshots_dir must differ from publish.releases_dir".to_string(),
            ));
        }
        if self.project.release_branch.trim().is_empty() {
            return Err(DeployError::ConfigError(
                "project.release_branch must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns true if a valid (non-empty) webhook secret is set.
    pub fn has_valid_secret(&self) -> bool {
        self.server
            .secret
            .as_ref()
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    }

    /// Full ref a push must target to trigger a deploy, e.g. `refs/heads/main`.
    pub fn release_ref(&self) -> String {
        format!("refs/heads/{}", self.project.release_branch)
    }

    /// Relative paths hang off the project root; the result is absolute so
    /// symlink targets stay valid regardless of the process cwd.
    fn resolve(&self, path: &Path) -> PathBuf {
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project.path.join(path)
        };
        std::path::absolute(&joined).unwrap_or(joined)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.resolve(&self.build.output_dir)
    }

    pub fn serving_root(&self) -> PathBuf {
        self.resolve(&self.publish.serving_root)
    }

    pub fn releases_dir(&self) -> PathBuf {
        self.resolve(&self.publish.releases_dir)
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.resolve(&self.publish.snapshots_dir)
    }

    pub fn log_file(&self) -> PathBuf {
        self.resolve(&self.project.log_file)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.build.step_timeout_secs)
    }

    pub fn pipeline_timeout(&self) -> Duration {
        Duration::from_secs(self.build.pipeline_timeout_secs)
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.build.lock_stale_secs)
    }

    /// Log the security posture once at startup. Absence of a secret is loud.
    pub fn log_secret_posture(&self) {
        if self.has_valid_secret() {
            info!("Webhook secret configured; signatures will be enforced");
        } else if self.server.allow_unsigned {
            warn!(
                "WEBHOOK_SECRET is not set and unsigned webhooks are ALLOWED. \
                 Anyone who can reach this server can trigger a deploy."
            );
        } else {
            error!(
                "WEBHOOK_SECRET is not set; every /deploy request will be rejected. \
                 Set WEBHOOK_SECRET or WEBHOOK_ALLOW_UNSIGNED=true for development."
            );
        }
    }
}

pub struct AppState {
    pub config: DeployConfig,
    pub deployer: Arc<Deployer>,
    pub start_time: Instant,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        config: DeployConfig,
        runner: Arc<dyn ProcessRunner>,
        proxy: Arc<dyn ProxyControl>,
    ) -> Result<Self, DeployError> {
        let publisher = ReleasePublisher::new(
            config.serving_root(),
            config.releases_dir(),
            config.publish.retention,
            proxy,
        );
        let deployer = Arc::new(Deployer::new(&config, runner, publisher)?);
        Ok(Self {
            config,
            deployer,
            start_time: Instant::now(),
            started_at: Utc::now(),
        })
    }
}

pub type SharedState = Arc<AppState>;
