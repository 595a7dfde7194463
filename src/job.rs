use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::utils::truncate_chars;
use crate::webhook::MAX_COMMIT_MSG_LEN;

/// Maximum number of captured log lines kept on a job
pub const MAX_JOB_LOG_LINES: usize = 2000;

/// Represents the status of a deploy job
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

/// One deploy triggered by an accepted push
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployJob {
    pub id: String,
    pub trigger_commit_id: String,
    pub commit_message: Option<String>,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_step: Option<String>,
    pub error: Option<String>,
    /// Name of the release published by this job
    pub release: Option<String>,
    pub log_lines: Vec<String>,
    pub log_truncated: bool,
}

impl DeployJob {
    /// Create a new job in Queued status
    pub fn new(trigger_commit_id: impl Into<String>, commit_message: Option<&str>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            trigger_commit_id: trigger_commit_id.into(),
            commit_message: commit_message.map(|m| truncate_chars(m, MAX_COMMIT_MSG_LEN)),
            status: JobStatus::Queued,
            started_at: Utc::now(),
            completed_at: None,
            failed_step: None,
            error: None,
            release: None,
            log_lines: Vec::new(),
            log_truncated: false,
        }
    }

    /// Short id used to tag persisted log lines
    pub fn short_id(&self) -> &str {
        let len = self.id.len().min(8);
        &self.id[self.id.len() - len..]
    }

    pub fn push_log(&mut self, line: impl Into<String>) {
        if self.log_lines.len() >= MAX_JOB_LOG_LINES {
            self.log_truncated = true;
            return;
        }
        self.log_lines.push(line.into());
    }

    /// Mark job as running
    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
    }

    pub fn mark_succeeded(&mut self, release: String) {
        self.status = JobStatus::Succeeded;
        self.completed_at = Some(Utc::now());
        self.release = Some(release);
    }

    /// Mark job as failed with the step that broke and its error
    pub fn mark_failed(&mut self, step: Option<&str>, error: String) {
        self.status = JobStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.failed_step = step.map(String::from);
        self.error = Some(error);
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// Bounded in-memory history of recent jobs, newest last
pub struct JobStore {
    jobs: VecDeque<DeployJob>,
    max_jobs: usize,
}

impl JobStore {
    pub fn new(max_jobs: usize) -> Self {
        Self {
            jobs: VecDeque::with_capacity(max_jobs),
            max_jobs,
        }
    }

    /// Insert or replace a job by id
    pub fn upsert(&mut self, job: &DeployJob) {
        if let Some(existing) = self.jobs.iter_mut().find(|j| j.id == job.id) {
            *existing = job.clone();
            return;
        }
        if self.jobs.len() >= self.max_jobs {
            self.jobs.pop_front();
        }
        self.jobs.push_back(job.clone());
    }

    pub fn get_job(&self, id: &str) -> Option<&DeployJob> {
        self.jobs.iter().find(|j| j.id == id)
    }

    /// Most recent jobs first, without their captured logs
    pub fn get_recent_jobs(&self, limit: usize) -> Vec<DeployJob> {
        self.jobs
            .iter()
            .rev()
            .take(limit)
            .map(|j| DeployJob {
                log_lines: Vec::new(),
                ..j.clone()
            })
            .collect()
    }
}
