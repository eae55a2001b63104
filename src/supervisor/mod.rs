//! Process supervisor: spawns job invocations, streams their output into
//! the ledger and a per-job ring buffer, and enforces one running execution
//! per job.
//!
//! Each run is owned by a single watcher task. `stop` and the hard timeout
//! are delivered to that task, which is the only place the child is waited
//! on or killed.

pub mod invocation;
pub mod output;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};

use crate::activity::ActivityLog;
use crate::catalog::JobDefinition;
use crate::ledger::{ExecutionStatus, Ledger, LogLevel, NewExecution, Trigger};
use crate::storage::StorageError;

use self::invocation::{exit_code, terminate_child, terminate_pid, Invocation};
use self::output::OutputBuffer;
pub use self::output::OutputChunk;

/// Return code recorded when supervision itself failed.
pub const EXIT_INTERNAL: i32 = -1;
/// Return code recorded when a run hit the hard timeout.
pub const EXIT_TIMEOUT: i32 = -2;

pub const DEFAULT_STOP_REASON: &str = "Manually stopped";

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("job {0} is already running")]
    Conflict(String),

    #[error("job {job_id}: {reason}")]
    NotFound { job_id: String, reason: String },

    #[error("failed to spawn job {job_id}")]
    Spawn {
        job_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("job {0} is not running")]
    NotRunning(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

// ---------------------------------------------------------------------------
// Settings and options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Working directory for jobs that do not set their own.
    pub working_dir: Option<PathBuf>,
    /// Hard limit on a single run.
    pub timeout: Duration,
    /// Time between SIGTERM and SIGKILL on stop.
    pub stop_grace: Duration,
    /// Lines kept in each job's ring buffer.
    pub output_lines: usize,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            working_dir: None,
            timeout: Duration::from_secs(3600),
            stop_grace: Duration::from_secs(1),
            output_lines: 1000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub input: Option<String>,
    pub dry_run: bool,
    pub trigger: Trigger,
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    Failed { code: i32 },
    TimedOut { after: Duration },
    Stopped { reason: String },
    /// Supervision failed: reader error, wait error or a panicked task.
    Crashed { error: String },
}

impl RunOutcome {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            RunOutcome::Completed => ExecutionStatus::Completed,
            RunOutcome::Stopped { .. } => ExecutionStatus::Stopped,
            _ => ExecutionStatus::Failed,
        }
    }

    /// `None` for stopped runs.
    pub fn return_code(&self) -> Option<i32> {
        match self {
            RunOutcome::Completed => Some(0),
            RunOutcome::Failed { code } => Some(*code),
            RunOutcome::TimedOut { .. } => Some(EXIT_TIMEOUT),
            RunOutcome::Stopped { .. } => None,
            RunOutcome::Crashed { .. } => Some(EXIT_INTERNAL),
        }
    }

    pub fn error_message(&self) -> Option<String> {
        match self {
            RunOutcome::Completed => None,
            RunOutcome::Failed { code } => Some(format!("Job exited with code {code}")),
            RunOutcome::TimedOut { after } => {
                Some(format!("Job timed out after {} seconds", after.as_secs()))
            }
            RunOutcome::Stopped { reason } => Some(reason.clone()),
            RunOutcome::Crashed { error } => Some(error.clone()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub job_id: String,
    pub execution_id: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub outcome: RunOutcome,
}

/// Returned by [`Supervisor::run`] once the child is running.
#[derive(Debug)]
pub struct RunHandle {
    pub job_id: String,
    /// `None` when the ledger could not record the run.
    pub execution_id: Option<i64>,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    done: oneshot::Receiver<RunReport>,
}

impl RunHandle {
    /// Wait for the run to end.
    pub async fn wait(self) -> RunReport {
        match self.done.await {
            Ok(report) => report,
            Err(_) => {
                let finished_at = Utc::now();
                RunReport {
                    job_id: self.job_id,
                    execution_id: self.execution_id,
                    started_at: self.started_at,
                    finished_at,
                    duration_secs: seconds_between(self.started_at, finished_at),
                    outcome: RunOutcome::Crashed {
                        error: "supervisor dropped the run".to_string(),
                    },
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Live state
// ---------------------------------------------------------------------------

/// Snapshot of a run this process is supervising.
#[derive(Debug, Clone, Serialize)]
pub struct LiveRun {
    pub job_id: String,
    pub execution_id: Option<i64>,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub dry_run: bool,
    pub trigger: Trigger,
}

/// Per-job counters kept for the lifetime of the process.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobHistory {
    pub execution_count: u64,
    pub last_end_time: Option<DateTime<Utc>>,
    pub last_duration_secs: Option<f64>,
    pub last_status: Option<ExecutionStatus>,
    pub last_return_code: Option<i32>,
}

struct StopRequest {
    reason: String,
    ack: oneshot::Sender<()>,
}

struct ActiveRun {
    info: LiveRun,
    /// Taken by the first `stop`.
    stop_tx: Option<oneshot::Sender<StopRequest>>,
}

struct JobState {
    active: Option<ActiveRun>,
    output: OutputBuffer,
    history: JobHistory,
}

impl JobState {
    fn new(capacity: usize) -> Self {
        Self {
            active: None,
            output: OutputBuffer::new(capacity),
            history: JobHistory::default(),
        }
    }
}

#[derive(Clone)]
struct RunContext {
    job_id: String,
    job_name: String,
    execution_id: Option<i64>,
    started_at: DateTime<Utc>,
}

enum ReaderEvent {
    Line(String),
    Failed(String),
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct Inner {
    ledger: Ledger,
    activity: Arc<ActivityLog>,
    settings: RunnerSettings,
    jobs: RwLock<HashMap<String, JobState>>,
}

/// Cheap to clone; all clones share the same live state.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(ledger: Ledger, activity: Arc<ActivityLog>, settings: RunnerSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                ledger,
                activity,
                settings,
                jobs: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.inner.ledger
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.inner.settings
    }

    /// Start one run of `job`.
    ///
    /// The job is claimed under the state lock before anything is spawned, so
    /// concurrent callers cannot both start it. Fails with `NotFound` if the
    /// executable is missing and `Spawn` if the OS refuses; neither leaves an
    /// execution behind. If the ledger is unavailable the run proceeds
    /// without persistence.
    pub async fn run(
        &self,
        job: &JobDefinition,
        opts: RunOptions,
    ) -> Result<RunHandle, SupervisorError> {
        let invocation = Invocation::build(
            job,
            opts.input.as_deref(),
            opts.dry_run,
            self.inner.settings.working_dir.as_deref(),
        );
        invocation
            .check()
            .map_err(|reason| SupervisorError::NotFound {
                job_id: job.id.clone(),
                reason,
            })?;
        let dry_run = opts.dry_run && job.supports_dry_run;

        let stop_rx = self.claim(job, dry_run, opts.trigger).await?;

        let mut child = match invocation.command().spawn() {
            Ok(child) => child,
            Err(source) => {
                self.release(&job.id).await;
                return Err(SupervisorError::Spawn {
                    job_id: job.id.clone(),
                    source,
                });
            }
        };
        let pid = child.id();
        let started_at = Utc::now();

        let new = NewExecution {
            job_id: job.id.clone(),
            job_name: job.display_name().to_string(),
            triggered_by: opts.trigger,
            start_time: started_at,
            dry_run,
            pid,
        };
        let execution_id = match self.inner.ledger.start_execution(new).await {
            Ok(id) => Some(id),
            Err(StorageError::AlreadyRunning { .. }) => {
                // Another host process owns this job.
                let _ = child.start_kill();
                let _ = child.wait().await;
                self.release(&job.id).await;
                return Err(SupervisorError::Conflict(job.id.clone()));
            }
            Err(e) => {
                warn!(
                    job_id = %job.id,
                    error = %e,
                    "ledger unavailable, running without persistence"
                );
                None
            }
        };

        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut jobs = self.inner.jobs.write().await;
            if let Some(active) = jobs.get_mut(&job.id).and_then(|s| s.active.as_mut()) {
                active.info.execution_id = execution_id;
                active.info.pid = pid;
                active.info.started_at = started_at;
            }
        }

        info!(
            job_id = %job.id,
            execution_id,
            pid,
            trigger = opts.trigger.as_str(),
            dry_run,
            "job started"
        );
        self.inner
            .activity
            .job_started(&job.id, opts.input.as_deref(), dry_run)
            .await;

        let ctx = RunContext {
            job_id: job.id.clone(),
            job_name: job.display_name().to_string(),
            execution_id,
            started_at,
        };
        tokio::spawn(self.clone().watch(ctx, child, stop_rx, done_tx));

        Ok(RunHandle {
            job_id: job.id.clone(),
            execution_id,
            pid,
            started_at,
            done: done_rx,
        })
    }

    /// [`run`](Self::run) and wait for the result.
    pub async fn run_to_completion(
        &self,
        job: &JobDefinition,
        opts: RunOptions,
    ) -> Result<RunReport, SupervisorError> {
        Ok(self.run(job, opts).await?.wait().await)
    }

    /// Stop the job's current run: SIGTERM, the grace window, then SIGKILL.
    /// Returns once the execution is recorded as stopped.
    ///
    /// With no live run in this process, a `running` ledger row left by a
    /// previous host process is stopped instead, signalling its pid if it is
    /// still alive.
    pub async fn stop(&self, job_id: &str, reason: &str) -> Result<(), SupervisorError> {
        let (live, stop_tx) = {
            let mut jobs = self.inner.jobs.write().await;
            match jobs.get_mut(job_id).and_then(|s| s.active.as_mut()) {
                Some(active) => (true, active.stop_tx.take()),
                None => (false, None),
            }
        };

        if let Some(tx) = stop_tx {
            let (ack_tx, ack_rx) = oneshot::channel();
            let request = StopRequest {
                reason: reason.to_string(),
                ack: ack_tx,
            };
            // A run that fails to start drops the request unanswered.
            if tx.send(request).is_err() || ack_rx.await.is_err() {
                return Err(SupervisorError::NotRunning(job_id.to_string()));
            }
            return Ok(());
        }
        if live {
            // Another caller is already stopping it.
            return Err(SupervisorError::NotRunning(job_id.to_string()));
        }

        self.stop_orphan(job_id, reason).await
    }

    async fn stop_orphan(&self, job_id: &str, reason: &str) -> Result<(), SupervisorError> {
        let Some(exec) = self.inner.ledger.active_execution(job_id).await? else {
            return Err(SupervisorError::NotRunning(job_id.to_string()));
        };
        if let Some(pid) = exec.pid {
            if invocation::pid_alive(pid) {
                info!(job_id, pid, "signalling orphaned job process");
                terminate_pid(pid, self.inner.settings.stop_grace).await;
            }
        }
        if self.inner.ledger.stop_execution(exec.id, reason).await? {
            Ok(())
        } else {
            Err(SupervisorError::NotRunning(job_id.to_string()))
        }
    }

    pub async fn is_running(&self, job_id: &str) -> bool {
        let jobs = self.inner.jobs.read().await;
        jobs.get(job_id).is_some_and(|s| s.active.is_some())
    }

    pub async fn live(&self, job_id: &str) -> Option<LiveRun> {
        let jobs = self.inner.jobs.read().await;
        jobs.get(job_id)
            .and_then(|s| s.active.as_ref())
            .map(|a| a.info.clone())
    }

    /// Every run this process is supervising.
    pub async fn running(&self) -> Vec<LiveRun> {
        let jobs = self.inner.jobs.read().await;
        let mut runs: Vec<LiveRun> = jobs
            .values()
            .filter_map(|s| s.active.as_ref().map(|a| a.info.clone()))
            .collect();
        runs.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        runs
    }

    pub async fn history(&self, job_id: &str) -> Option<JobHistory> {
        let jobs = self.inner.jobs.read().await;
        jobs.get(job_id).map(|s| s.history.clone())
    }

    /// Up to `max_lines` buffered lines, oldest first.
    pub async fn output(&self, job_id: &str, max_lines: usize) -> Vec<String> {
        let jobs = self.inner.jobs.read().await;
        jobs.get(job_id)
            .map(|s| s.output.tail(max_lines))
            .unwrap_or_default()
    }

    /// Lines pushed after `cursor`, for followers that must not miss output
    /// once the ring buffer wraps.
    pub async fn output_since(&self, job_id: &str, cursor: u64) -> OutputChunk {
        let jobs = self.inner.jobs.read().await;
        match jobs.get(job_id) {
            Some(state) => state.output.since(cursor),
            None => OutputChunk {
                cursor,
                ..OutputChunk::default()
            },
        }
    }

    /// Up to `max_lines` buffered lines, newest first.
    pub async fn recent_output(&self, job_id: &str, max_lines: usize) -> Vec<String> {
        let jobs = self.inner.jobs.read().await;
        jobs.get(job_id)
            .map(|s| s.output.newest(max_lines))
            .unwrap_or_default()
    }

    pub async fn clear_output(&self, job_id: &str) {
        let mut jobs = self.inner.jobs.write().await;
        if let Some(state) = jobs.get_mut(job_id) {
            state.output.clear();
        }
    }

    // -----------------------------------------------------------------------
    // Run lifecycle
    // -----------------------------------------------------------------------

    async fn claim(
        &self,
        job: &JobDefinition,
        dry_run: bool,
        trigger: Trigger,
    ) -> Result<oneshot::Receiver<StopRequest>, SupervisorError> {
        let mut jobs = self.inner.jobs.write().await;
        let state = jobs
            .entry(job.id.clone())
            .or_insert_with(|| JobState::new(self.inner.settings.output_lines));
        if state.active.is_some() {
            return Err(SupervisorError::Conflict(job.id.clone()));
        }
        state.output.clear();
        let (stop_tx, stop_rx) = oneshot::channel();
        state.active = Some(ActiveRun {
            info: LiveRun {
                job_id: job.id.clone(),
                execution_id: None,
                pid: None,
                started_at: Utc::now(),
                dry_run,
                trigger,
            },
            stop_tx: Some(stop_tx),
        });
        Ok(stop_rx)
    }

    async fn release(&self, job_id: &str) {
        let mut jobs = self.inner.jobs.write().await;
        if let Some(state) = jobs.get_mut(job_id) {
            state.active = None;
        }
    }

    async fn watch(
        self,
        ctx: RunContext,
        child: Child,
        stop_rx: oneshot::Receiver<StopRequest>,
        done_tx: oneshot::Sender<RunReport>,
    ) {
        let sup = self.clone();
        let task_ctx = ctx.clone();
        let task = tokio::spawn(async move { sup.supervise(&task_ctx, child, stop_rx).await });

        let (outcome, ack) = match task.await {
            Ok(result) => result,
            Err(e) => {
                error!(job_id = %ctx.job_id, error = %e, "job supervision task failed");
                (
                    RunOutcome::Crashed {
                        error: format!("supervision task failed: {e}"),
                    },
                    None,
                )
            }
        };

        let report = self.finish(&ctx, outcome).await;
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
        let _ = done_tx.send(report);
    }

    async fn supervise(
        &self,
        ctx: &RunContext,
        mut child: Child,
        mut stop_rx: oneshot::Receiver<StopRequest>,
    ) -> (RunOutcome, Option<oneshot::Sender<()>>) {
        let settings = &self.inner.settings;
        let (line_tx, mut line_rx) = mpsc::channel(256);
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_lines(stdout, line_tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_lines(stderr, line_tx.clone())));
        }
        drop(line_tx);

        let deadline = tokio::time::sleep(settings.timeout);
        tokio::pin!(deadline);
        let mut next_line: u32 = 1;
        let mut streams_open = true;
        let mut stop_open = true;

        let (outcome, ack) = loop {
            tokio::select! {
                biased;

                request = &mut stop_rx, if stop_open => match request {
                    Ok(request) => {
                        info!(job_id = %ctx.job_id, reason = %request.reason, "stopping job");
                        terminate_child(&mut child, settings.stop_grace).await;
                        break (RunOutcome::Stopped { reason: request.reason }, Some(request.ack));
                    }
                    Err(_) => stop_open = false,
                },

                _ = &mut deadline => {
                    warn!(
                        job_id = %ctx.job_id,
                        timeout_secs = settings.timeout.as_secs(),
                        "job timed out, terminating"
                    );
                    terminate_child(&mut child, settings.stop_grace).await;
                    break (RunOutcome::TimedOut { after: settings.timeout }, None);
                }

                event = line_rx.recv(), if streams_open => match event {
                    Some(ReaderEvent::Line(line)) => self.capture(ctx, &mut next_line, &line).await,
                    Some(ReaderEvent::Failed(e)) => {
                        error!(job_id = %ctx.job_id, error = %e, "output reader failed");
                        terminate_child(&mut child, settings.stop_grace).await;
                        break (RunOutcome::Crashed { error: e }, None);
                    }
                    None => streams_open = false,
                },

                status = child.wait(), if !streams_open => match status {
                    Ok(status) => {
                        let code = exit_code(status);
                        let outcome = if code == 0 {
                            RunOutcome::Completed
                        } else {
                            RunOutcome::Failed { code }
                        };
                        break (outcome, None);
                    }
                    Err(e) => {
                        terminate_child(&mut child, settings.stop_grace).await;
                        let error = format!("failed to wait for job process: {e}");
                        break (RunOutcome::Crashed { error }, None);
                    }
                },
            }
        };

        // Whatever the readers already delivered still belongs to this run.
        while let Ok(ReaderEvent::Line(line)) = line_rx.try_recv() {
            self.capture(ctx, &mut next_line, &line).await;
        }
        for reader in readers {
            reader.abort();
        }

        let closing = match &outcome {
            RunOutcome::Completed => "Job exited with code 0".to_string(),
            RunOutcome::Failed { code } => format!("Job exited with code {code}"),
            RunOutcome::TimedOut { after } => {
                format!("Job timed out after {} seconds", after.as_secs())
            }
            RunOutcome::Stopped { reason } => format!("Job stopped: {reason}"),
            RunOutcome::Crashed { error } => format!("Job supervision failed: {error}"),
        };
        self.capture(ctx, &mut next_line, &closing).await;

        (outcome, ack)
    }

    /// Record one output line. The line number only advances once the ledger
    /// accepted the line, so stored numbers stay gapless.
    async fn capture(&self, ctx: &RunContext, next_line: &mut u32, line: &str) {
        let now = Utc::now();
        if let Some(execution_id) = ctx.execution_id {
            let level = LogLevel::classify(line);
            match self
                .inner
                .ledger
                .add_log_line(execution_id, *next_line, now, line, level)
                .await
            {
                Ok(()) => *next_line += 1,
                Err(e) => warn!(
                    job_id = %ctx.job_id,
                    execution_id,
                    error = %e,
                    "failed to store log line"
                ),
            }
        }
        if line.starts_with("PROGRESS") {
            debug!(job_id = %ctx.job_id, line, "progress reported");
        }

        let mut jobs = self.inner.jobs.write().await;
        if let Some(state) = jobs.get_mut(&ctx.job_id) {
            state.output.push(now.with_timezone(&Local), line);
        }
    }

    async fn finish(&self, ctx: &RunContext, outcome: RunOutcome) -> RunReport {
        let finished_at = Utc::now();
        let duration_secs = seconds_between(ctx.started_at, finished_at);

        if let Some(id) = ctx.execution_id {
            let recorded = match &outcome {
                RunOutcome::Stopped { reason } => {
                    self.inner.ledger.stop_execution(id, reason).await
                }
                other => {
                    self.inner
                        .ledger
                        .finish_execution(
                            id,
                            other.return_code().unwrap_or(EXIT_INTERNAL),
                            other.error_message(),
                        )
                        .await
                }
            };
            if let Err(e) = recorded {
                warn!(
                    job_id = %ctx.job_id,
                    execution_id = id,
                    error = %e,
                    "failed to record run result"
                );
            }
        }

        {
            let mut jobs = self.inner.jobs.write().await;
            if let Some(state) = jobs.get_mut(&ctx.job_id) {
                state.active = None;
                let history = &mut state.history;
                history.execution_count += 1;
                history.last_end_time = Some(finished_at);
                history.last_duration_secs = Some(duration_secs);
                history.last_status = Some(outcome.status());
                history.last_return_code = outcome.return_code();
            }
        }

        let error = outcome.error_message();
        self.inner
            .activity
            .job_completed(&ctx.job_id, duration_secs, error.as_deref())
            .await;
        info!(
            job_id = %ctx.job_id,
            job = %ctx.job_name,
            execution_id = ctx.execution_id,
            status = %outcome.status(),
            return_code = outcome.return_code(),
            duration_secs,
            "job finished"
        );

        RunReport {
            job_id: ctx.job_id.clone(),
            execution_id: ctx.execution_id,
            started_at: ctx.started_at,
            finished_at,
            duration_secs,
            outcome,
        }
    }
}

async fn read_lines<R>(stream: R, tx: mpsc::Sender<ReaderEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(ReaderEvent::Line(line)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = tx
                    .send(ReaderEvent::Failed(format!("failed to read job output: {e}")))
                    .await;
                break;
            }
        }
    }
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    ((end - start).num_milliseconds() as f64 / 1000.0).max(0.0)
}
