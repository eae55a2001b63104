//! The scheduler loop.
//!
//! One task ticks every `tick`, selects due schedules ordered by `next_run`
//! and runs them one after another. After every dispatch the schedule is
//! moved one interval past the finish time, whatever the outcome.

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ledger::{ScheduleRun, ScheduledJob, Trigger};
use crate::supervisor::RunOptions;

use super::Scheduler;

pub(super) struct LoopHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl Scheduler {
    /// Spawn the loop. Returns `false` if it is already running.
    pub async fn start(&self) -> bool {
        let mut task = self.inner.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.join.is_finished()) {
            warn!("scheduler already running");
            return false;
        }

        let token = CancellationToken::new();
        let join = tokio::spawn(self.clone().run_loop(token.clone()));
        *task = Some(LoopHandle { token, join });
        info!(tick_secs = self.inner.settings.tick.as_secs(), "scheduler started");
        true
    }

    /// Signal the loop and wait up to `stop_timeout` for it to exit. A
    /// dispatch still in flight after that is left to finish on its own.
    pub async fn stop(&self) {
        let Some(handle) = self.inner.task.lock().await.take() else {
            return;
        };
        handle.token.cancel();
        match tokio::time::timeout(self.inner.settings.stop_timeout, handle.join).await {
            Ok(Ok(())) => info!("scheduler stopped"),
            Ok(Err(e)) => error!(error = %e, "scheduler task ended abnormally"),
            Err(_) => warn!(
                timeout_secs = self.inner.settings.stop_timeout.as_secs(),
                "scheduler did not stop in time, abandoning it"
            ),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner
            .task
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.join.is_finished())
    }

    async fn run_loop(self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.inner.settings.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let dispatched = self.run_due(&token).await;
            if dispatched > 0 {
                debug!(dispatched, "scheduler tick done");
            }
        }
        debug!("scheduler loop exited");
    }

    /// Run every schedule due now, sequentially. Returns how many were
    /// dispatched. Errors are logged; nothing here stops the loop.
    pub async fn run_due(&self, token: &CancellationToken) -> usize {
        let due = match self.inner.ledger.due_schedules(Utc::now()).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "failed to load due schedules");
                return 0;
            }
        };

        let mut dispatched = 0;
        for job in due {
            if token.is_cancelled() {
                info!(remaining = %job.job_id, "scheduler stopping, skipping rest of tick");
                break;
            }
            self.dispatch(&job).await;
            dispatched += 1;
        }
        dispatched
    }

    async fn dispatch(&self, job: &ScheduledJob) {
        info!(job_id = %job.job_id, interval = %job.interval, "running scheduled job");
        let started = Utc::now();

        let error = match self.inner.catalog.get(&job.job_id).cloned() {
            None => Some(format!("job {} is not in the catalog", job.job_id)),
            Some(def) => {
                let supervisor = self.inner.supervisor.clone();
                let run = tokio::spawn(async move {
                    let opts = RunOptions {
                        trigger: Trigger::Scheduled,
                        ..RunOptions::default()
                    };
                    supervisor.run_to_completion(&def, opts).await
                });
                match run.await {
                    Ok(Ok(report)) => report.outcome.error_message(),
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(e) => Some(format!("scheduled dispatch failed: {e}")),
                }
            }
        };

        let finished_at = Utc::now();
        let duration_seconds =
            ((finished_at - started).num_milliseconds() as f64 / 1000.0).max(0.0);
        match &error {
            None => info!(job_id = %job.job_id, duration_seconds, "scheduled job succeeded"),
            Some(e) => warn!(job_id = %job.job_id, error = %e, "scheduled job failed"),
        }

        let run = ScheduleRun {
            finished_at,
            duration_seconds,
            error,
            next_run: job.interval.next_after(finished_at),
        };
        if let Err(e) = self.inner.ledger.record_schedule_run(&job.job_id, run).await {
            error!(job_id = %job.job_id, error = %e, "failed to record scheduled run");
        }
    }
}
