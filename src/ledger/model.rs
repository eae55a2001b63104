//! Persisted entities: executions, log lines, scheduled jobs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one execution. `Running` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    /// Terminal status for a finished process.
    pub fn from_return_code(code: i32) -> Self {
        if code == 0 {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "stopped" => Ok(ExecutionStatus::Stopped),
            other => Err(format!("unknown execution status '{other}'")),
        }
    }
}

/// Which path started an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    #[default]
    Manual,
    Scheduled,
    Queued,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::Scheduled => "scheduled",
            Trigger::Queued => "queued",
        }
    }
}

impl FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Trigger::Manual),
            "scheduled" => Ok(Trigger::Scheduled),
            "queued" => Ok(Trigger::Queued),
            other => Err(format!("unknown trigger '{other}'")),
        }
    }
}

/// Severity assigned to a captured output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Case-insensitive keyword classification of a line of job output.
    pub fn classify(line: &str) -> Self {
        let lower = line.to_lowercase();
        if ["error", "exception", "failed"].iter().any(|k| lower.contains(k)) {
            LogLevel::Error
        } else if lower.contains("warn") {
            LogLevel::Warning
        } else {
            LogLevel::Info
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(LogLevel::Info),
            "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

/// One recorded invocation of a job.
#[derive(Debug, Clone, Serialize)]
pub struct Execution {
    pub id: i64,
    pub job_id: String,
    pub job_name: String,
    pub triggered_by: Trigger,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub status: ExecutionStatus,
    pub return_code: Option<i32>,
    pub dry_run: bool,
    pub pid: Option<u32>,
    pub error_message: Option<String>,
}

/// Fields needed to open a new `running` execution row.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub job_id: String,
    pub job_name: String,
    pub triggered_by: Trigger,
    pub start_time: DateTime<Utc>,
    pub dry_run: bool,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub execution_id: i64,
    pub line_number: u32,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    pub level: LogLevel,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobUsage {
    pub job_id: String,
    pub job_name: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStats {
    pub total_executions: u64,
    /// Percentage of finished executions that completed, 0 when none finished.
    pub success_rate: f64,
    pub most_used: Vec<JobUsage>,
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Minutes,
    Hours,
    Days,
}

impl IntervalUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalUnit::Minutes => "minutes",
            IntervalUnit::Hours => "hours",
            IntervalUnit::Days => "days",
        }
    }
}

impl FromStr for IntervalUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minutes" => Ok(IntervalUnit::Minutes),
            "hours" => Ok(IntervalUnit::Hours),
            "days" => Ok(IntervalUnit::Days),
            other => Err(format!("unknown interval type '{other}'")),
        }
    }
}

/// Recurrence of a scheduled job, e.g. every 5 minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    #[serde(rename = "interval_type")]
    pub unit: IntervalUnit,
    #[serde(rename = "interval_value")]
    pub value: u32,
}

impl Interval {
    pub fn new(unit: IntervalUnit, value: u32) -> Self {
        Self { unit, value }
    }

    pub fn duration(&self) -> Duration {
        let v = i64::from(self.value);
        match self.unit {
            IntervalUnit::Minutes => Duration::minutes(v),
            IntervalUnit::Hours => Duration::hours(v),
            IntervalUnit::Days => Duration::days(v),
        }
    }

    pub fn next_after(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        t + self.duration()
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "every {} {}", self.value, self.unit.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunResult {
    Success,
    Error,
}

impl RunResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunResult::Success => "success",
            RunResult::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledJob {
    pub job_id: String,
    pub job_name: String,
    pub enabled: bool,
    #[serde(flatten)]
    pub interval: Interval,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_run_status: Option<RunResult>,
    pub last_run_duration: Option<f64>,
    pub run_count: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
}

impl ScheduledJob {
    /// Enabled and `next_run` unset or elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run.map_or(true, |t| t <= now)
    }
}

/// Result of one scheduler dispatch, folded into the schedule row.
#[derive(Debug, Clone)]
pub struct ScheduleRun {
    pub finished_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub error: Option<String>,
    pub next_run: DateTime<Utc>,
}
