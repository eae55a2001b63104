//! Status queries that stay correct across restarts of the host process.
//!
//! Live supervisor state wins. Without it, a `running` ledger row means the
//! host restarted mid-run; it is reported as running from the persisted pid
//! and start time so the caller can probe liveness or issue a stop.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ledger::{Ledger, Trigger};
use crate::progress::{self, ProgressReport};
use crate::storage::StorageError;
use crate::supervisor::{invocation, JobHistory, Supervisor};

/// Lines scanned for progress markers.
pub const PROGRESS_WINDOW: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusSource {
    /// Supervised by this process.
    Live,
    /// Only the ledger knows about the run.
    Ledger,
    Idle,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job_id: String,
    pub running: bool,
    pub source: StatusSource,
    pub execution_id: Option<i64>,
    pub pid: Option<u32>,
    pub start_time: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub trigger: Option<Trigger>,
    /// OS-level liveness of a ledger-only run's pid.
    pub alive: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<JobHistory>,
}

#[derive(Clone)]
pub struct Reconciler {
    supervisor: Supervisor,
    ledger: Ledger,
}

impl Reconciler {
    pub fn new(supervisor: Supervisor) -> Self {
        let ledger = supervisor.ledger().clone();
        Self { supervisor, ledger }
    }

    /// Close out executions left `running` by a previous host process.
    pub async fn heal_orphans(&self) -> Result<usize, StorageError> {
        self.ledger.recover_orphans().await
    }

    pub async fn status(&self, job_id: &str) -> Result<JobStatus, StorageError> {
        let history = self.supervisor.history(job_id).await;

        if let Some(live) = self.supervisor.live(job_id).await {
            return Ok(JobStatus {
                job_id: job_id.to_string(),
                running: true,
                source: StatusSource::Live,
                execution_id: live.execution_id,
                pid: live.pid,
                start_time: Some(live.started_at),
                dry_run: live.dry_run,
                trigger: Some(live.trigger),
                alive: None,
                progress: self.progress(job_id).await,
                history,
            });
        }

        if let Some(exec) = self.ledger.active_execution(job_id).await? {
            return Ok(JobStatus {
                job_id: job_id.to_string(),
                running: true,
                source: StatusSource::Ledger,
                execution_id: Some(exec.id),
                pid: exec.pid,
                start_time: Some(exec.start_time),
                dry_run: exec.dry_run,
                trigger: Some(exec.triggered_by),
                alive: exec.pid.map(invocation::pid_alive),
                progress: None,
                history,
            });
        }

        Ok(JobStatus {
            job_id: job_id.to_string(),
            running: false,
            source: StatusSource::Idle,
            execution_id: None,
            pid: None,
            start_time: None,
            dry_run: false,
            trigger: None,
            alive: None,
            progress: self.progress(job_id).await,
            history,
        })
    }

    /// Progress from the newest buffered lines of the job, if any match.
    pub async fn progress(&self, job_id: &str) -> Option<ProgressReport> {
        let window = self.supervisor.recent_output(job_id, PROGRESS_WINDOW).await;
        progress::parse(window)
    }
}
