//! Build pipeline: an ordered list of typed steps run by a small interpreter.
//!
//! Commands go through a [`ProcessRunner`] so steps can be exercised against a
//! fake runner without touching git, npm or the network.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::DeployConfig;
use crate::deploy_log::DeployLog;
use crate::error::DeployError;
use crate::job::DeployJob;
use crate::publisher::release_name;
use crate::utils::{dir_stats, tail_excerpt};

/// Character budget for the output excerpt attached to a failed step
pub const MAX_EXCERPT_CHARS: usize = 2000;

/// Snapshots of leftover build output kept around for inspection
const MAX_SNAPSHOTS: usize = 2;

/// Run a configured command line through `sh -c`, so quoting, `&&` chains
/// and `VAR=value` prefixes behave as they would in a terminal.
/// Returns `None` for a blank line.
pub fn shell_command(command_line: &str) -> Option<(String, Vec<String>)> {
    let command_line = command_line.trim();
    if command_line.is_empty() {
        return None;
    }
    Some((
        "sh".to_string(),
        vec!["-c".to_string(), command_line.to_string()],
    ))
}

/// A single external command to execute for a step
#[derive(Debug, Clone)]
pub struct Invocation {
    pub step: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
}

impl Invocation {
    pub fn command_line(&self) -> String {
        let mut cmd = self.program.clone();
        for arg in &self.args {
            cmd.push(' ');
            cmd.push_str(arg);
        }
        cmd
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Executes external commands on behalf of pipeline steps.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run `invocation` to completion. Exceeding `invocation.timeout` yields
    /// `StepTimeout` and the process must not outlive the call.
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, DeployError>;
}

/// Runs commands as real child processes.
#[derive(Debug, Clone, Default)]
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, DeployError> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(&invocation.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // dropping the future on timeout kills the child
            .kill_on_drop(true);

        let output = match tokio::time::timeout(invocation.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                error!("{} failed to start: {}", invocation.command_line(), e);
                return Err(DeployError::StepFailed {
                    step: invocation.step.clone(),
                    excerpt: format!("failed to start '{}': {}", invocation.program, e),
                });
            }
            Err(_) => {
                error!(
                    "{} TIMEOUT after {}s, process killed",
                    invocation.command_line(),
                    invocation.timeout.as_secs()
                );
                return Err(DeployError::StepTimeout {
                    step: invocation.step.clone(),
                    secs: invocation.timeout.as_secs(),
                });
            }
        };

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnFailure {
    Abort,
    Continue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    Command { program: String, args: Vec<String> },
    /// Move a leftover build output directory aside, outside the release history.
    Snapshot,
    /// Check the build output exists and is non-empty.
    Verify,
}

#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub kind: StepKind,
    pub timeout: Duration,
    pub on_failure: OnFailure,
}

impl Step {
    /// Build a command step from a shell command line.
    pub fn command(name: &str, command_line: &str, timeout: Duration) -> Result<Self, DeployError> {
        let (program, args) = shell_command(command_line).ok_or_else(|| {
            DeployError::ConfigError(format!("command for step '{}' is empty", name))
        })?;

        Ok(Self {
            name: name.to_string(),
            kind: StepKind::Command { program, args },
            timeout,
            on_failure: OnFailure::Abort,
        })
    }

    pub fn snapshot() -> Self {
        Self::builtin("snapshot", StepKind::Snapshot)
    }

    pub fn verify() -> Self {
        Self::builtin("verify", StepKind::Verify)
    }

    fn builtin(name: &str, kind: StepKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            timeout: Duration::ZERO,
            on_failure: OnFailure::Abort,
        }
    }

    pub fn continue_on_failure(mut self) -> Self {
        self.on_failure = OnFailure::Continue;
        self
    }
}

/// A verified build output directory, ready to publish
#[derive(Debug, Clone, Serialize)]
pub struct BuildArtifact {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub file_count: u64,
}

impl BuildArtifact {
    /// Inspect `path`; a missing or empty directory is not an artifact,
    /// whatever the build tool's exit code said.
    pub async fn inspect(path: &Path) -> Result<Self, DeployError> {
        let is_dir = tokio::fs::metadata(path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(DeployError::InvalidArtifact(format!(
                "output directory {} does not exist",
                path.display()
            )));
        }
        let (file_count, size_bytes) = output_stats(path).await?;
        if file_count == 0 {
            return Err(DeployError::InvalidArtifact(format!(
                "output directory {} is empty",
                path.display()
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            created_at: Utc::now(),
            size_bytes,
            file_count,
        })
    }
}

/// Walk a directory tree on the blocking pool.
async fn output_stats(path: &Path) -> Result<(u64, u64), DeployError> {
    let path = path.to_path_buf();
    let stats = tokio::task::spawn_blocking(move || dir_stats(&path))
        .await
        .map_err(|e| DeployError::Internal(format!("directory scan crashed: {}", e)))??;
    Ok(stats)
}

pub struct Pipeline {
    steps: Vec<Step>,
    project_dir: PathBuf,
    output_dir: PathBuf,
    snapshots_dir: PathBuf,
    timeout: Duration,
}

impl Pipeline {
    pub fn new(
        steps: Vec<Step>,
        project_dir: PathBuf,
        output_dir: PathBuf,
        snapshots_dir: PathBuf,
        timeout: Duration,
    ) -> Self {
        Self {
            steps,
            project_dir,
            output_dir,
            snapshots_dir,
            timeout,
        }
    }

    /// The standard sequence: stop, snapshot, fetch, reset, install, build, verify.
    pub fn from_config(config: &DeployConfig) -> Result<Self, DeployError> {
        let step_timeout = config.step_timeout();
        let remote = &config.project.remote;
        let branch = &config.project.release_branch;

        let mut steps = Vec::new();
        if let Some(stop) = config.build.stop_command.as_deref().filter(|s| !s.trim().is_empty()) {
            // nothing may be running yet, so a failing stop is tolerated
            steps.push(Step::command("stop", stop, step_timeout)?.continue_on_failure());
        }
        steps.push(Step::snapshot());
        steps.push(Step::command(
            "fetch",
            &format!("git fetch {} {}", remote, branch),
            step_timeout,
        )?);
        steps.push(Step::command(
            "reset",
            &format!("git reset --hard {}/{}", remote, branch),
            step_timeout,
        )?);
        steps.push(Step::command(
            "install",
            &config.build.install_command,
            step_timeout,
        )?);
        steps.push(Step::command("build", &config.build.build_command, step_timeout)?);
        steps.push(Step::verify());

        Ok(Self::new(
            steps,
            config.project.path.clone(),
            config.output_dir(),
            config.snapshots_dir(),
            config.pipeline_timeout(),
        ))
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Run every step in order; the first failing step aborts the rest.
    /// Returns the verified artifact. Never touches the serving root.
    pub async fn run(
        &self,
        runner: &dyn ProcessRunner,
        job: &mut DeployJob,
        log: &DeployLog,
    ) -> Result<BuildArtifact, DeployError> {
        match tokio::time::timeout(self.timeout, self.run_steps(runner, job, log)).await {
            Ok(result) => result,
            Err(_) => {
                let err = DeployError::PipelineTimeout(self.timeout.as_secs());
                record(job, log, &format!("!! {}", err)).await;
                Err(err)
            }
        }
    }

    async fn run_steps(
        &self,
        runner: &dyn ProcessRunner,
        job: &mut DeployJob,
        log: &DeployLog,
    ) -> Result<BuildArtifact, DeployError> {
        let mut artifact = None;

        for step in &self.steps {
            record(job, log, &format!("==> {}", step.name)).await;

            let result = match &step.kind {
                StepKind::Command { program, args } => {
                    let invocation = Invocation {
                        step: step.name.clone(),
                        program: program.clone(),
                        args: args.clone(),
                        cwd: self.project_dir.clone(),
                        timeout: step.timeout,
                    };
                    self.run_command(runner, &invocation, job, log).await
                }
                StepKind::Snapshot => self.snapshot_output(job, log).await,
                StepKind::Verify => BuildArtifact::inspect(&self.output_dir).await.map(|a| {
                    artifact = Some(a);
                }),
            };

            if let Err(e) = result {
                if step.on_failure == OnFailure::Continue {
                    warn!("Step '{}' failed but is allowed to: {}", step.name, e);
                    record(job, log, &format!("step '{}' failed, continuing: {}", step.name, e))
                        .await;
                    continue;
                }
                error!("Step '{}' failed: {}", step.name, e);
                record(job, log, &format!("!! {}", e)).await;
                return Err(e);
            }
        }

        let artifact = artifact.ok_or_else(|| {
            DeployError::InvalidArtifact("pipeline finished without a verify step".to_string())
        })?;
        record(
            job,
            log,
            &format!(
                "build output verified: {} files, {} bytes",
                artifact.file_count, artifact.size_bytes
            ),
        )
        .await;
        Ok(artifact)
    }

    async fn run_command(
        &self,
        runner: &dyn ProcessRunner,
        invocation: &Invocation,
        job: &mut DeployJob,
        log: &DeployLog,
    ) -> Result<(), DeployError> {
        info!(
            "Running (cwd = '{}'): {}",
            invocation.cwd.display(),
            invocation.command_line()
        );
        record(job, log, &format!("$ {}", invocation.command_line())).await;

        let output = runner.run(invocation).await?;
        if !output.stdout.is_empty() {
            record(job, log, &output.stdout).await;
        }
        if !output.stderr.is_empty() {
            record(job, log, &output.stderr).await;
        }

        if output.success() {
            return Ok(());
        }

        let source = if output.stderr.trim().is_empty() {
            &output.stdout
        } else {
            &output.stderr
        };
        let mut excerpt = tail_excerpt(source, MAX_EXCERPT_CHARS);
        if excerpt.is_empty() {
            excerpt = format!("exit code {:?}", output.exit_code);
        }
        Err(DeployError::StepFailed {
            step: invocation.step.clone(),
            excerpt,
        })
    }

    /// Rename (never copy) a leftover output directory out of the build's way.
    /// Snapshots never enter the release history, so they can't be published,
    /// rolled back to, or counted against retention.
    async fn snapshot_output(&self, job: &mut DeployJob, log: &DeployLog) -> Result<(), DeployError> {
        let is_dir = tokio::fs::metadata(&self.output_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            record(job, log, "no previous build output to snapshot").await;
            return Ok(());
        }

        let (file_count, _) = output_stats(&self.output_dir).await?;
        if file_count == 0 {
            tokio::fs::remove_dir_all(&self.output_dir).await?;
            record(job, log, "removed empty leftover build output").await;
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.snapshots_dir).await?;
        let target = self.snapshots_dir.join(release_name("snapshot"));
        tokio::fs::rename(&self.output_dir, &target).await?;
        record(
            job,
            log,
            &format!("snapshotted previous build output to {}", target.display()),
        )
        .await;

        if let Err(e) = self.prune_snapshots().await {
            warn!("Failed to prune old snapshots: {}", e);
        }
        Ok(())
    }

    async fn prune_snapshots(&self) -> std::io::Result<()> {
        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.snapshots_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                names.push(entry.file_name());
            }
        }
        names.sort();
        let excess = names.len().saturating_sub(MAX_SNAPSHOTS);
        for name in &names[..excess] {
            tokio::fs::remove_dir_all(self.snapshots_dir.join(name)).await?;
        }
        Ok(())
    }
}

/// Capture a (possibly multi-line) message on the job and in the deploy log.
pub(crate) async fn record(job: &mut DeployJob, log: &DeployLog, message: &str) {
    for line in message.lines() {
        job.push_log(line);
    }
    log.append(job.short_id(), message).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records invocations and fails the named step.
    #[derive(Default)]
    struct ScriptedRunner {
        calls: Mutex<Vec<String>>,
        fail_step: Option<&'static str>,
        output_dir: Option<PathBuf>,
    }

    #[async_trait]
    impl ProcessRunner for ScriptedRunner {
        async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, DeployError> {
            self.calls.lock().unwrap().push(invocation.step.clone());
            if self.fail_step == Some(invocation.step.as_str()) {
                return Ok(CommandOutput {
                    exit_code: Some(1),
                    stdout: String::new(),
                    stderr: format!("{} broke\n{}", invocation.step, "e".repeat(5000)),
                });
            }
            if invocation.step == "build" {
                if let Some(dir) = &self.output_dir {
                    std::fs::create_dir_all(dir).unwrap();
                    std::fs::write(dir.join("index.html"), "<html></html>").unwrap();
                }
            }
            Ok(CommandOutput {
                exit_code: Some(0),
                stdout: format!("{} ok", invocation.step),
                stderr: String::new(),
            })
        }
    }

    fn config_for(dir: &Path) -> DeployConfig {
        let mut config = DeployConfig::default();
        config.project.path = dir.to_path_buf();
        config
    }

    #[test]
    fn standard_step_order() {
        let mut config = config_for(Path::new("/srv/site"));
        config.build.stop_command = Some("pm2 stop site".to_string());
        let pipeline = Pipeline::from_config(&config).unwrap();
        let names: Vec<_> = pipeline.steps().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            ["stop", "snapshot", "fetch", "reset", "install", "build", "verify"]
        );
        assert_eq!(pipeline.steps()[0].on_failure, OnFailure::Continue);
        assert_eq!(
            pipeline.steps()[3].kind,
            StepKind::Command {
                program: "sh".to_string(),
                args: vec!["-c".into(), "git reset --hard origin/main".into()],
            }
        );
    }

    #[test]
    fn empty_command_is_a_config_error() {
        assert!(matches!(
            Step::command("build", "   ", Duration::from_secs(1)),
            Err(DeployError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn successful_run_produces_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path());
        let runner = ScriptedRunner {
            output_dir: Some(config.output_dir()),
            ..Default::default()
        };
        let log = DeployLog::new(config.log_file());
        let mut job = DeployJob::new("abc", None);

        let artifact = Pipeline::from_config(&config)
            .unwrap()
            .run(&runner, &mut job, &log)
            .await
            .unwrap();

        assert_eq!(artifact.file_count, 1);
        assert_eq!(
            *runner.calls.lock().unwrap(),
            ["fetch", "reset", "install", "build"]
        );
        assert!(job.log_lines.iter().any(|l| l == "build ok"));
    }

    #[tokio::test]
    async fn failing_step_aborts_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path());
        let runner = ScriptedRunner {
            fail_step: Some("install"),
            output_dir: Some(config.output_dir()),
            ..Default::default()
        };
        let log = DeployLog::new(config.log_file());
        let mut job = DeployJob::new("abc", None);

        let err = Pipeline::from_config(&config)
            .unwrap()
            .run(&runner, &mut job, &log)
            .await
            .unwrap_err();

        assert_eq!(err.step(), Some("install"));
        match err {
            DeployError::StepFailed { excerpt, .. } => {
                assert!(excerpt.chars().count() <= MAX_EXCERPT_CHARS + 20);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(*runner.calls.lock().unwrap(), ["fetch", "reset", "install"]);
    }

    #[tokio::test]
    async fn lying_build_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path());
        // build "succeeds" but writes nothing
        let runner = ScriptedRunner::default();
        let log = DeployLog::new(config.log_file());
        let mut job = DeployJob::new("abc", None);

        let err = Pipeline::from_config(&config)
            .unwrap()
            .run(&runner, &mut job, &log)
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::InvalidArtifact(_)));

        std::fs::create_dir_all(config.output_dir()).unwrap();
        assert!(matches!(
            BuildArtifact::inspect(&config.output_dir()).await,
            Err(DeployError::InvalidArtifact(_))
        ));
    }

    #[tokio::test]
    async fn snapshot_moves_leftover_output_outside_releases() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path());

        let pipeline = Pipeline::new(
            vec![Step::snapshot()],
            config.project.path.clone(),
            config.output_dir(),
            config.snapshots_dir(),
            Duration::from_secs(5),
        );
        let log = DeployLog::new(config.log_file());
        let mut job = DeployJob::new("abc", None);

        for i in 0..4 {
            std::fs::create_dir_all(config.output_dir()).unwrap();
            std::fs::write(config.output_dir().join("old.html"), format!("old {}", i)).unwrap();
            pipeline.snapshot_output(&mut job, &log).await.unwrap();
            assert!(!config.output_dir().exists());
        }

        assert!(!config.releases_dir().exists());
        let entries: Vec<_> = std::fs::read_dir(config.snapshots_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries.len(), MAX_SNAPSHOTS);
        assert!(entries.iter().all(|e| e.ends_with("-snapshot")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_steps_run_through_the_shell() {
        let dir = tempfile::tempdir().unwrap();
        let step = Step::command(
            "install",
            "GREETING=hi sh -c 'echo $GREETING' && echo 'two  words'",
            Duration::from_secs(5),
        )
        .unwrap();
        let StepKind::Command { program, args } = step.kind else {
            panic!("expected a command step");
        };
        let invocation = Invocation {
            step: step.name,
            program,
            args,
            cwd: dir.path().to_path_buf(),
            timeout: step.timeout,
        };

        let output = TokioProcessRunner.run(&invocation).await.unwrap();
        assert!(output.success(), "stderr: {}", output.stderr);
        assert_eq!(output.stdout, "hi\ntwo  words\n");
    }

    #[tokio::test]
    async fn continue_policy_tolerates_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path());
        let runner = ScriptedRunner {
            fail_step: Some("stop"),
            output_dir: Some(config.output_dir()),
            ..Default::default()
        };
        let steps = vec![
            Step::command("stop", "pm2 stop site", Duration::from_secs(5))
                .unwrap()
                .continue_on_failure(),
            Step::command("build", "npm run build", Duration::from_secs(5)).unwrap(),
            Step::verify(),
        ];
        let pipeline = Pipeline::new(
            steps,
            config.project.path.clone(),
            config.output_dir(),
            config.snapshots_dir(),
            Duration::from_secs(5),
        );
        let log = DeployLog::new(config.log_file());
        let mut job = DeployJob::new("abc", None);

        assert!(pipeline.run(&runner, &mut job, &log).await.is_ok());
        assert_eq!(*runner.calls.lock().unwrap(), ["stop", "build"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn real_runner_times_out_and_kills() {
        let dir = tempfile::tempdir().unwrap();
        let invocation = Invocation {
            step: "build".to_string(),
            program: "sleep".to_string(),
            args: vec!["5".to_string()],
            cwd: dir.path().to_path_buf(),
            timeout: Duration::from_millis(100),
        };
        let started = std::time::Instant::now();
        let err = TokioProcessRunner.run(&invocation).await.unwrap_err();
        assert!(matches!(err, DeployError::StepTimeout { ref step, .. } if step == "build"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn real_runner_captures_exit_code_and_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let mut invocation = Invocation {
            step: "build".to_string(),
            program: "false".to_string(),
            args: vec![],
            cwd: dir.path().to_path_buf(),
            timeout: Duration::from_secs(5),
        };
        let output = TokioProcessRunner.run(&invocation).await.unwrap();
        assert!(!output.success());

        invocation.program = "definitely-not-a-real-binary".to_string();
        assert!(matches!(
            TokioProcessRunner.run(&invocation).await,
            Err(DeployError::StepFailed { .. })
        ));
    }

    #[tokio::test]
    async fn pipeline_timeout_aborts() {
        struct SlowRunner;

        #[async_trait]
        impl ProcessRunner for SlowRunner {
            async fn run(&self, _: &Invocation) -> Result<CommandOutput, DeployError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(CommandOutput::default())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path());
        let pipeline = Pipeline::new(
            vec![Step::command("build", "npm run build", Duration::from_secs(60)).unwrap()],
            config.project.path.clone(),
            config.output_dir(),
            config.snapshots_dir(),
            Duration::from_millis(50),
        );
        let log = DeployLog::new(config.log_file());
        let mut job = DeployJob::new("abc", None);

        let err = pipeline.run(&SlowRunner, &mut job, &log).await.unwrap_err();
        assert!(matches!(err, DeployError::PipelineTimeout(_)));
    }
}
