//! Recurring schedules and the manual run queue.
//!
//! [`Scheduler`] owns schedule CRUD (here) and the polling loop
//! ([`engine`]). [`queue::CronQueue`] is the in-memory run list.

pub mod engine;
pub mod queue;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::catalog::Catalog;
use crate::ledger::{Interval, Ledger, ScheduledJob};
use crate::storage::StorageError;
use crate::supervisor::Supervisor;

pub use self::queue::{CronQueue, QueueError, QueueItem, QueueSettings, QueueStatus};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("interval value must be greater than zero")]
    InvalidInterval,

    #[error("unknown job {0}")]
    UnknownJob(String),

    #[error("job {0} has no schedule")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Polling period of the loop.
    pub tick: Duration,
    /// Bounded wait for the loop to exit on stop.
    pub stop_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

struct Inner {
    ledger: Ledger,
    catalog: Arc<Catalog>,
    supervisor: Supervisor,
    settings: SchedulerSettings,
    task: Mutex<Option<engine::LoopHandle>>,
}

/// Interval scheduler backed by the `scheduled_jobs` table.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(supervisor: Supervisor, catalog: Arc<Catalog>, settings: SchedulerSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                ledger: supervisor.ledger().clone(),
                catalog,
                supervisor,
                settings,
                task: Mutex::new(None),
            }),
        }
    }

    fn validate(&self, job_id: &str, interval: &Interval) -> Result<(), ScheduleError> {
        if interval.value == 0 {
            return Err(ScheduleError::InvalidInterval);
        }
        if self.inner.catalog.get(job_id).is_none() {
            return Err(ScheduleError::UnknownJob(job_id.to_string()));
        }
        Ok(())
    }

    /// Schedule `job_id`. Without `next_run` the job is due immediately.
    pub async fn add(
        &self,
        job_id: &str,
        interval: Interval,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<ScheduledJob, ScheduleError> {
        self.validate(job_id, &interval)?;
        let name = self
            .inner
            .catalog
            .get(job_id)
            .map(|j| j.display_name().to_string())
            .unwrap_or_else(|| job_id.to_string());

        let job = self
            .inner
            .ledger
            .add_schedule(job_id, &name, interval, next_run.unwrap_or_else(Utc::now))
            .await?;
        info!(job_id, %interval, "schedule added");
        Ok(job)
    }

    pub async fn remove(&self, job_id: &str) -> Result<(), ScheduleError> {
        if !self.inner.ledger.remove_schedule(job_id).await? {
            return Err(ScheduleError::NotFound(job_id.to_string()));
        }
        info!(job_id, "schedule removed");
        Ok(())
    }

    pub async fn enable(&self, job_id: &str) -> Result<(), ScheduleError> {
        self.set_enabled(job_id, true).await
    }

    pub async fn disable(&self, job_id: &str) -> Result<(), ScheduleError> {
        self.set_enabled(job_id, false).await
    }

    async fn set_enabled(&self, job_id: &str, enabled: bool) -> Result<(), ScheduleError> {
        if !self.inner.ledger.set_schedule_enabled(job_id, enabled).await? {
            return Err(ScheduleError::NotFound(job_id.to_string()));
        }
        info!(job_id, enabled, "schedule toggled");
        Ok(())
    }

    /// Change the interval. Without `next_run` the next run is one interval
    /// from now.
    pub async fn update_schedule(
        &self,
        job_id: &str,
        interval: Interval,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<ScheduledJob, ScheduleError> {
        self.validate(job_id, &interval)?;
        let next_run = next_run.unwrap_or_else(|| interval.next_after(Utc::now()));
        if !self
            .inner
            .ledger
            .update_schedule(job_id, interval, next_run)
            .await?
        {
            return Err(ScheduleError::NotFound(job_id.to_string()));
        }
        info!(job_id, %interval, %next_run, "schedule updated");
        self.get(job_id)
            .await?
            .ok_or_else(|| ScheduleError::NotFound(job_id.to_string()))
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<ScheduledJob>, ScheduleError> {
        Ok(self.inner.ledger.schedule(job_id).await?)
    }

    pub async fn list(&self) -> Result<Vec<ScheduledJob>, ScheduleError> {
        Ok(self.inner.ledger.schedules().await?)
    }
}
