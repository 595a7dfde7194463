//! Deploy orchestration: serializer -> pipeline -> publisher.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::DeployConfig;
use crate::deploy_log::DeployLog;
use crate::error::DeployError;
use crate::job::{DeployJob, JobStore};
use crate::pipeline::{Pipeline, ProcessRunner, record};
use crate::publisher::{PublishReport, ReleaseEntry, ReleasePublisher};
use crate::serializer::{DeployGuard, DeploySerializer, DeployState};

const MAX_RECENT_JOBS: usize = 24;

/// A finished deploy: the job as recorded, and what became of it
#[derive(Debug)]
pub struct DeployOutcome {
    pub job: DeployJob,
    pub result: Result<PublishReport, DeployError>,
}

pub struct Deployer {
    project: PathBuf,
    serializer: DeploySerializer,
    pipeline: Pipeline,
    runner: Arc<dyn ProcessRunner>,
    publisher: ReleasePublisher,
    log: DeployLog,
    jobs: Mutex<JobStore>,
}

impl Deployer {
    pub fn new(
        config: &DeployConfig,
        runner: Arc<dyn ProcessRunner>,
        publisher: ReleasePublisher,
    ) -> Result<Self, DeployError> {
        Ok(Self {
            project: config.project.path.clone(),
            serializer: DeploySerializer::new(config.lock_stale_after()),
            pipeline: Pipeline::from_config(config)?,
            runner,
            publisher,
            log: DeployLog::new(config.log_file()),
            jobs: Mutex::new(JobStore::new(MAX_RECENT_JOBS)),
        })
    }

    /// Claim the project for a new job, or fail with `Busy`.
    pub fn begin(
        &self,
        commit: &str,
        message: Option<&str>,
    ) -> Result<(DeployJob, DeployGuard), DeployError> {
        let job = DeployJob::new(commit, message);
        let guard = self.serializer.try_acquire(&self.project, &job.id)?;
        Ok((job, guard))
    }

    /// Run a full deploy for `commit`. Rejected with `Busy` if one is running.
    ///
    /// The work happens on its own task: it finishes (and releases the lock)
    /// even if the caller goes away, and a panic in it becomes a failed job.
    pub async fn deploy(
        self: &Arc<Self>,
        commit: &str,
        message: Option<&str>,
    ) -> Result<DeployOutcome, DeployError> {
        let (job, guard) = self.begin(commit, message)?;
        self.jobs.lock().await.upsert(&job);
        info!("Created deploy job {} for commit {}", job.id, commit);

        let handle = tokio::spawn(Arc::clone(self).execute(job.clone(), guard));
        match handle.await {
            Ok(outcome) => Ok(outcome),
            Err(join_error) => {
                error!("Deploy job {} crashed: {}", job.id, join_error);
                let mut job = job;
                let err = DeployError::Internal(format!("deploy task crashed: {}", join_error));
                job.mark_failed(None, err.to_string());
                self.log.append(job.short_id(), &format!("!! {}", err)).await;
                self.jobs.lock().await.upsert(&job);
                Ok(DeployOutcome {
                    job,
                    result: Err(err),
                })
            }
        }
    }

    async fn execute(self: Arc<Self>, mut job: DeployJob, guard: DeployGuard) -> DeployOutcome {
        job.mark_running();
        self.jobs.lock().await.upsert(&job);
        let started = format!("deploy started for commit {}", job.trigger_commit_id);
        record(&mut job, &self.log, &started).await;

        let result = match self
            .pipeline
            .run(self.runner.as_ref(), &mut job, &self.log)
            .await
        {
            Ok(artifact) => self.publisher.publish(&artifact, &job.trigger_commit_id).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(report) => {
                job.mark_succeeded(report.release.clone());
                record(
                    &mut job,
                    &self.log,
                    &format!("deploy succeeded, release {} is live", report.release),
                )
                .await;
                info!("Job {} completed successfully.", job.id);
            }
            Err(e) => {
                if let DeployError::PublishedUnhealthy { release, .. } = e {
                    job.release = Some(release.clone());
                }
                job.mark_failed(e.step(), e.to_string());
                record(&mut job, &self.log, &format!("deploy FAILED: {}", e)).await;
                error!("Job {} failed: {}", job.id, e);
            }
        }

        self.jobs.lock().await.upsert(&job);
        guard.release();
        DeployOutcome { job, result }
    }

    /// Swap the serving root back to an older release under the deploy lock.
    pub async fn rollback(
        self: &Arc<Self>,
        target: Option<String>,
    ) -> Result<PublishReport, DeployError> {
        let guard = self.serializer.try_acquire(&self.project, "rollback")?;
        let this = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let result = this.publisher.rollback(target.as_deref()).await;
            drop(guard);
            result
        });
        let result = handle
            .await
            .map_err(|e| DeployError::Internal(format!("rollback task crashed: {}", e)))?;

        match &result {
            Ok(report) => {
                warn!("Rolled back to release {}", report.release);
                self.log
                    .append("rollback", &format!("rolled back to release {}", report.release))
                    .await;
            }
            Err(e) => {
                self.log
                    .append("rollback", &format!("rollback FAILED: {}", e))
                    .await;
            }
        }
        result
    }

    pub fn state(&self) -> DeployState {
        self.serializer.state(&self.project)
    }

    pub async fn current_release(&self) -> Option<String> {
        self.publisher.current_release().await
    }

    pub async fn history(&self) -> Result<Vec<ReleaseEntry>, DeployError> {
        self.publisher.history().await
    }

    pub async fn recent_jobs(&self, limit: usize) -> Vec<DeployJob> {
        self.jobs.lock().await.get_recent_jobs(limit)
    }

    pub async fn get_job(&self, id: &str) -> Option<DeployJob> {
        self.jobs.lock().await.get_job(id).cloned()
    }

    pub fn deploy_log(&self) -> &DeployLog {
        &self.log
    }
}
