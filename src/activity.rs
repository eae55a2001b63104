//! Activity history: one JSON line per notable action.
//!
//! Writes are serialized through a `tokio::sync::Mutex`. The file is
//! rewritten down to `max_entries` lines once it grows past twice that, so
//! appends stay cheap. Write failures are logged and swallowed; the activity
//! log never fails the operation it describes.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Success,
    Error,
    InProgress,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    /// RFC 3339 timestamp of the action.
    pub timestamp: String,
    /// e.g. `job_start`, `job_complete`.
    pub action_type: String,
    /// Who performed the action, usually a job id.
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub status: ActivityStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
}

impl ActivityEntry {
    pub fn new(action_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            action_type: action_type.into(),
            source: source.into(),
            target: None,
            details: None,
            status: ActivityStatus::Success,
            duration_secs: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_status(mut self, status: ActivityStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration_secs = Some(secs);
        self
    }
}

struct Sink {
    path: PathBuf,
    max_entries: usize,
    lines: usize,
}

/// Append-only activity log backed by a JSON-lines file.
pub struct ActivityLog {
    sink: Option<Mutex<Sink>>,
}

impl ActivityLog {
    /// Open (or create) the log at `path`.
    pub async fn open(path: PathBuf, max_entries: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("failed to create activity log directory: {}", parent.display())
                })?;
            }
        }

        let lines = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content.lines().filter(|l| !l.trim().is_empty()).count(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read activity log: {}", path.display()))
            }
        };
        debug!(path = %path.display(), lines, "activity log opened");

        Ok(Self {
            sink: Some(Mutex::new(Sink {
                path,
                max_entries: max_entries.max(1),
                lines,
            })),
        })
    }

    /// A log that records nothing.
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    pub async fn record(&self, entry: ActivityEntry) {
        let Some(sink) = &self.sink else {
            return;
        };
        let mut sink = sink.lock().await;
        if let Err(e) = append(&mut sink, &entry).await {
            warn!(error = %e, action = %entry.action_type, "failed to record activity");
        }
    }

    pub async fn job_started(&self, job_id: &str, input: Option<&str>, dry_run: bool) {
        let details = match input {
            Some(input) => format!("input: {input}, dry_run: {dry_run}"),
            None => format!("dry_run: {dry_run}"),
        };
        self.record(
            ActivityEntry::new("job_start", job_id)
                .with_details(details)
                .with_status(ActivityStatus::InProgress),
        )
        .await;
    }

    pub async fn job_completed(&self, job_id: &str, duration_secs: f64, error: Option<&str>) {
        let entry = ActivityEntry::new("job_complete", job_id).with_duration(duration_secs);
        let entry = match error {
            Some(e) => entry.with_status(ActivityStatus::Error).with_details(e),
            None => entry.with_details("Job completed successfully"),
        };
        self.record(entry).await;
    }

    /// Most recent entries, newest first. Unparseable lines are skipped.
    pub async fn recent(&self, limit: usize) -> Vec<ActivityEntry> {
        let Some(sink) = &self.sink else {
            return Vec::new();
        };
        let sink = sink.lock().await;
        match read_entries(&sink.path).await {
            Ok(entries) => entries.into_iter().rev().take(limit).collect(),
            Err(e) => {
                warn!(error = %e, "failed to read activity log");
                Vec::new()
            }
        }
    }
}

async fn append(sink: &mut Sink, entry: &ActivityEntry) -> Result<()> {
    let mut line = serde_json::to_string(entry).context("failed to serialize activity entry")?;
    line.push('\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&sink.path)
        .await
        .with_context(|| format!("failed to open activity log: {}", sink.path.display()))?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    sink.lines += 1;

    if sink.lines > sink.max_entries * 2 {
        compact(sink).await?;
    }
    Ok(())
}

async fn compact(sink: &mut Sink) -> Result<()> {
    let content = tokio::fs::read_to_string(&sink.path).await?;
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    let keep = &lines[lines.len().saturating_sub(sink.max_entries)..];

    let tmp = sink.path.with_extension("jsonl.tmp");
    let mut body = keep.join("\n");
    body.push('\n');
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, &sink.path).await?;

    debug!(kept = keep.len(), dropped = lines.len() - keep.len(), "activity log compacted");
    sink.lines = keep.len();
    Ok(())
}

async fn read_entries(path: &Path) -> Result<Vec<ActivityEntry>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(content
        .lines()
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}
