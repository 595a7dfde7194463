//! At-most-one deploy per project root.
//!
//! A second trigger arriving while a deploy runs is rejected, never queued.
//! Leases release on drop, so a panicking or failing deploy cannot wedge the
//! project; a lease held past the staleness ceiling is force-released.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::DeployError;

#[derive(Debug, Clone)]
struct Lease {
    token: Uuid,
    job_id: String,
    acquired: Instant,
    acquired_at: DateTime<Utc>,
}

/// Observable state of one project
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum DeployState {
    Idle,
    Running {
        job_id: String,
        since: DateTime<Utc>,
    },
}

#[derive(Clone)]
pub struct DeploySerializer {
    leases: Arc<Mutex<HashMap<PathBuf, Lease>>>,
    stale_after: Duration,
}

impl DeploySerializer {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            leases: Arc::new(Mutex::new(HashMap::new())),
            stale_after,
        }
    }

    /// Take the project lock for `job_id`, or fail with `Busy`.
    pub fn try_acquire(&self, project: &Path, job_id: &str) -> Result<DeployGuard, DeployError> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(current) = leases.get(project) {
            let held_for = current.acquired.elapsed();
            if held_for < self.stale_after {
                return Err(DeployError::Busy {
                    project: project.display().to_string(),
                    job_id: current.job_id.clone(),
                });
            }
            error!(
                "Deploy lock for '{}' held by job {} for {}s (limit {}s); force-releasing",
                project.display(),
                current.job_id,
                held_for.as_secs(),
                self.stale_after.as_secs()
            );
        }

        let token = Uuid::now_v7();
        leases.insert(
            project.to_path_buf(),
            Lease {
                token,
                job_id: job_id.to_string(),
                acquired: Instant::now(),
                acquired_at: Utc::now(),
            },
        );

        Ok(DeployGuard {
            leases: Arc::clone(&self.leases),
            project: project.to_path_buf(),
            token,
        })
    }

    pub fn state(&self, project: &Path) -> DeployState {
        let leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        match leases.get(project) {
            Some(lease) => DeployState::Running {
                job_id: lease.job_id.clone(),
                since: lease.acquired_at,
            },
            None => DeployState::Idle,
        }
    }
}

/// Proof of holding a project's deploy lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct DeployGuard {
    leases: Arc<Mutex<HashMap<PathBuf, Lease>>>,
    project: PathBuf,
    token: Uuid,
}

impl DeployGuard {
    /// Release explicitly; equivalent to dropping the guard.
    pub fn release(self) {}
}

impl Drop for DeployGuard {
    fn drop(&mut self) {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        // A lease that was force-released belongs to someone else now.
        match leases.get(&self.project) {
            Some(lease) if lease.token == self.token => {
                leases.remove(&self.project);
            }
            Some(_) => warn!(
                "Stale deploy lease for '{}' finished after being force-released",
                self.project.display()
            ),
            None => {}
        }
    }
}
