use std::io;

/// Custom error type for simple_deploy_hook operations
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Deploy already in progress for '{project}' (job {job_id})")]
    Busy { project: String, job_id: String },

    #[error("Step '{step}' failed:\n{excerpt}")]
    StepFailed { step: String, excerpt: String },

    #[error("Step '{step}' timed out after {secs}s")]
    StepTimeout { step: String, secs: u64 },

    #[error("Pipeline timed out after {0}s")]
    PipelineTimeout(u64),

    #[error("Build output invalid: {0}")]
    InvalidArtifact(String),

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Release '{release}' is live but the proxy is unhealthy: {reason}")]
    PublishedUnhealthy { release: String, reason: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeployError {
    /// Name of the pipeline stage this error belongs to, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            DeployError::StepFailed { step, .. } | DeployError::StepTimeout { step, .. } => {
                Some(step)
            }
            DeployError::PipelineTimeout(_) => Some("pipeline"),
            DeployError::InvalidArtifact(_) => Some("verify"),
            DeployError::PublishFailed(_) | DeployError::PublishedUnhealthy { .. } => {
                Some("publish")
            }
            _ => None,
        }
    }
}
