//! Manual run queue.
//!
//! An in-memory FIFO of job runs, drained one item at a time by a single
//! runner task. Not persisted: a restart empties the queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::ledger::Trigger;
use crate::supervisor::{RunOptions, RunOutcome, Supervisor};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("unknown job {0}")]
    UnknownJob(String),

    #[error("queue item {0} not found")]
    NotFound(String),

    #[error("queue is already running")]
    AlreadyRunning,

    #[error("queue is empty")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Timeout,
    Error,
}

impl QueueStatus {
    fn from_outcome(outcome: &RunOutcome) -> Self {
        match outcome {
            RunOutcome::Completed => QueueStatus::Completed,
            RunOutcome::TimedOut { .. } => QueueStatus::Timeout,
            RunOutcome::Failed { .. } | RunOutcome::Stopped { .. } => QueueStatus::Failed,
            RunOutcome::Crashed { .. } => QueueStatus::Error,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueItem {
    pub id: String,
    pub job_id: String,
    pub job_name: String,
    pub input: Option<String>,
    pub added_at: DateTime<Utc>,
    pub status: QueueStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub running: bool,
    pub items: Vec<QueueItem>,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Wait before the first item after `start`.
    pub start_delay: Duration,
    /// Pause between items.
    pub cooldown: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            start_delay: Duration::ZERO,
            cooldown: Duration::from_secs(2),
        }
    }
}

struct Inner {
    items: Mutex<Vec<QueueItem>>,
    /// Cleared by `stop`; the runner checks it between items.
    enabled: AtomicBool,
    /// Set while a runner task exists.
    worker: AtomicBool,
    wake: Notify,
    catalog: Arc<Catalog>,
    supervisor: Supervisor,
    settings: QueueSettings,
}

#[derive(Clone)]
pub struct CronQueue {
    inner: Arc<Inner>,
}

impl CronQueue {
    pub fn new(supervisor: Supervisor, catalog: Arc<Catalog>, settings: QueueSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                items: Mutex::new(Vec::new()),
                enabled: AtomicBool::new(false),
                worker: AtomicBool::new(false),
                wake: Notify::new(),
                catalog,
                supervisor,
                settings,
            }),
        }
    }

    /// Append a queued run of `job_id`.
    pub async fn add(&self, job_id: &str, input: Option<String>) -> Result<QueueItem, QueueError> {
        let job = self
            .inner
            .catalog
            .get(job_id)
            .ok_or_else(|| QueueError::UnknownJob(job_id.to_string()))?;
        let item = QueueItem {
            id: Uuid::new_v4().to_string(),
            job_id: job.id.clone(),
            job_name: job.display_name().to_string(),
            input: input.filter(|i| !i.is_empty()),
            added_at: Utc::now(),
            status: QueueStatus::Queued,
        };
        self.inner.items.lock().await.push(item.clone());
        info!(item_id = %item.id, job_id, "job queued");
        Ok(item)
    }

    pub async fn remove(&self, id: &str) -> Result<(), QueueError> {
        let mut items = self.inner.items.lock().await;
        let before = items.len();
        items.retain(|i| i.id != id);
        if items.len() == before {
            return Err(QueueError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Replace the queue with exactly the named items, in the given order.
    /// Items not named are dropped; unknown ids are ignored. An item already
    /// running stays at the head until the runner finishes it.
    pub async fn reorder(&self, ids: &[String]) -> Vec<QueueItem> {
        let mut items = self.inner.items.lock().await;
        let mut reordered: Vec<QueueItem> = items
            .iter()
            .filter(|i| i.status == QueueStatus::Running)
            .cloned()
            .collect();
        items.retain(|i| i.status != QueueStatus::Running);
        for id in ids {
            if let Some(pos) = items.iter().position(|i| &i.id == id) {
                reordered.push(items.remove(pos));
            }
        }
        let dropped = items.len();
        *items = reordered;
        if dropped > 0 {
            info!(dropped, "queue reordered, unlisted items dropped");
        }
        items.clone()
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            running: self.is_running(),
            items: self.inner.items.lock().await.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Spawn the runner. Refused while a runner exists (including one that
    /// is finishing its last item after `stop`) or when nothing is queued.
    pub async fn start(&self) -> Result<(), QueueError> {
        if self
            .inner
            .worker
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(QueueError::AlreadyRunning);
        }
        let has_work = self
            .inner
            .items
            .lock()
            .await
            .iter()
            .any(|i| i.status == QueueStatus::Queued);
        if !has_work {
            self.inner.worker.store(false, Ordering::SeqCst);
            return Err(QueueError::Empty);
        }

        self.inner.enabled.store(true, Ordering::SeqCst);
        tokio::spawn(self.clone().run_loop());
        info!("queue started");
        Ok(())
    }

    /// Cooperative: the item in flight finishes, nothing after it starts.
    pub fn stop(&self) {
        if self.inner.enabled.swap(false, Ordering::SeqCst) {
            info!("queue stop requested");
        }
        self.inner.wake.notify_waiters();
    }

    /// Sleep `d` unless `stop` is called first.
    async fn pause(&self, d: Duration) {
        if d.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(d) => {}
            _ = self.inner.wake.notified() => {}
        }
    }

    async fn run_loop(self) {
        let delay = self.inner.settings.start_delay;
        if !delay.is_zero() {
            info!(delay_secs = delay.as_secs(), "queue waiting before first item");
            self.pause(delay).await;
        }

        while self.is_running() {
            let next = {
                let mut items = self.inner.items.lock().await;
                match items.iter_mut().find(|i| i.status == QueueStatus::Queued) {
                    Some(item) => {
                        item.status = QueueStatus::Running;
                        item.clone()
                    }
                    None => break,
                }
            };

            let status = self.execute(&next).await;
            self.inner.items.lock().await.retain(|i| i.id != next.id);
            info!(item_id = %next.id, job_id = %next.job_id, ?status, "queue item done");

            if !self.is_running() {
                break;
            }
            self.pause(self.inner.settings.cooldown).await;
        }

        self.inner.enabled.store(false, Ordering::SeqCst);
        self.inner.worker.store(false, Ordering::SeqCst);
        info!("queue runner exited");
    }

    async fn execute(&self, item: &QueueItem) -> QueueStatus {
        let Some(job) = self.inner.catalog.get(&item.job_id).cloned() else {
            warn!(job_id = %item.job_id, "queued job no longer in catalog");
            return QueueStatus::Error;
        };
        let opts = RunOptions {
            input: item.input.clone(),
            dry_run: false,
            trigger: Trigger::Queued,
        };

        let supervisor = self.inner.supervisor.clone();
        let run = tokio::spawn(async move { supervisor.run_to_completion(&job, opts).await });
        match run.await {
            Ok(Ok(report)) => QueueStatus::from_outcome(&report.outcome),
            Ok(Err(e)) => {
                warn!(job_id = %item.job_id, error = %e, "queued job could not start");
                QueueStatus::Error
            }
            Err(e) => {
                error!(job_id = %item.job_id, error = %e, "queued job dispatch failed");
                QueueStatus::Error
            }
        }
    }
}
