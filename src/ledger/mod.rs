//! Execution ledger -- durable record of executions, their output, and
//! recurring schedules.
//!
//! Every call runs on the blocking pool through [`storage::with_retry`].
//! Terminal transitions only match rows `WHERE status = 'running'`.

pub mod model;
mod schedules;

use chrono::{DateTime, Duration, Local, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info, warn};

use crate::storage::{self, parse_opt_ts, parse_ts, ts, Pool, RetryPolicy, StorageError};

pub use self::model::{
    Execution, ExecutionStats, ExecutionStatus, Interval, IntervalUnit, JobUsage, LogLevel,
    LogLine, NewExecution, RunResult, ScheduleRun, ScheduledJob, Trigger,
};

/// Message recorded on executions found `running` at startup.
pub const ORPHAN_MESSAGE: &str = "Execution interrupted by restart of the host process";

const EXECUTION_COLUMNS: &str = "id, job_id, job_name, triggered_by, start_time, end_time, \
     duration_seconds, status, return_code, dry_run, pid, error_message";

const MOST_USED_LIMIT: i64 = 5;

#[derive(Clone)]
pub struct Ledger {
    pool: Pool,
    retry: RetryPolicy,
}

impl Ledger {
    pub fn new(pool: Pool) -> Self {
        Self::with_retry_policy(pool, RetryPolicy::default())
    }

    pub fn with_retry_policy(pool: Pool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn call<T, F>(&self, what: &'static str, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: Fn(&mut rusqlite::Connection) -> Result<T, StorageError> + Send + Sync + 'static,
    {
        storage::with_retry(&self.pool, &self.retry, what, op).await
    }

    /// Close out every execution still marked `running`.
    ///
    /// Must run before the supervisor accepts work: any such row belongs to a
    /// process that no longer exists. Returns the number of rows healed; a
    /// second call in a row returns zero.
    pub async fn recover_orphans(&self) -> Result<usize, StorageError> {
        let healed = self
            .call("recover_orphans", |conn| {
                let tx = conn.transaction()?;
                let orphans: Vec<(i64, String, String)> = {
                    let mut stmt = tx.prepare(
                        "SELECT id, job_name, start_time FROM executions WHERE status = 'running'",
                    )?;
                    let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?;
                    rows.collect::<Result<_, _>>()?
                };

                let now = Utc::now();
                for (id, job_name, start_raw) in &orphans {
                    let duration = parse_ts("start_time", start_raw)
                        .map(|start| seconds_between(start, now))
                        .ok();
                    tx.execute(
                        "UPDATE executions
                         SET status = 'stopped', end_time = ?1, duration_seconds = ?2,
                             error_message = ?3, updated_at = datetime('now')
                         WHERE id = ?4 AND status = 'running'",
                        params![ts(&now), duration, ORPHAN_MESSAGE, id],
                    )?;
                    info!(
                        execution_id = id,
                        job = %job_name,
                        "marked orphaned execution as stopped"
                    );
                }
                tx.commit()?;
                Ok(orphans.len())
            })
            .await?;

        if healed > 0 {
            info!(count = healed, "recovered orphaned executions from previous session");
        } else {
            debug!("no orphaned executions found");
        }
        Ok(healed)
    }

    /// Open a `running` execution. Fails with [`StorageError::AlreadyRunning`]
    /// if the job already has one.
    pub async fn start_execution(&self, new: NewExecution) -> Result<i64, StorageError> {
        let job_id = new.job_id.clone();
        let id = self
            .call("start_execution", move |conn| {
                let inserted = conn.execute(
                    "INSERT INTO executions
                     (job_id, job_name, triggered_by, start_time, status, dry_run, pid)
                     VALUES (?1, ?2, ?3, ?4, 'running', ?5, ?6)",
                    params![
                        new.job_id,
                        new.job_name,
                        new.triggered_by.as_str(),
                        ts(&new.start_time),
                        new.dry_run,
                        new.pid
                    ],
                );
                match inserted {
                    Ok(_) => Ok(conn.last_insert_rowid()),
                    Err(e) if storage::is_constraint(&e) => Err(StorageError::AlreadyRunning {
                        job_id: new.job_id.clone(),
                    }),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;
        debug!(execution_id = id, job_id = %job_id, "execution recorded");
        Ok(id)
    }

    /// Close a running execution with the process return code. Status becomes
    /// `completed` for 0 and `failed` otherwise. Returns `false` if the
    /// execution had already reached a terminal state.
    pub async fn finish_execution(
        &self,
        id: i64,
        return_code: i32,
        error: Option<String>,
    ) -> Result<bool, StorageError> {
        let status = ExecutionStatus::from_return_code(return_code);
        let changed = self
            .call("finish_execution", move |conn| {
                close_execution(conn, id, status, Some(return_code), error.as_deref())
            })
            .await?;
        if changed {
            info!(execution_id = id, %status, return_code, "execution finished");
        }
        Ok(changed)
    }

    /// Mark a running execution `stopped`. No-op (returns `false`) unless the
    /// execution is currently running.
    pub async fn stop_execution(&self, id: i64, reason: &str) -> Result<bool, StorageError> {
        let reason = reason.to_string();
        let changed = self
            .call("stop_execution", move |conn| {
                close_execution(conn, id, ExecutionStatus::Stopped, None, Some(reason.as_str()))
            })
            .await?;
        if changed {
            info!(execution_id = id, "execution stopped");
        } else {
            warn!(execution_id = id, "stop requested for execution that is not running");
        }
        Ok(changed)
    }

    pub async fn add_log_line(
        &self,
        execution_id: i64,
        line_number: u32,
        timestamp: DateTime<Utc>,
        content: &str,
        level: LogLevel,
    ) -> Result<(), StorageError> {
        let content = content.to_string();
        self.call("add_log_line", move |conn| {
            conn.execute(
                "INSERT INTO log_lines (execution_id, line_number, timestamp, content, level)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![execution_id, line_number, ts(&timestamp), content, level.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    /// All executions currently marked `running`, newest first.
    pub async fn active_executions(&self) -> Result<Vec<Execution>, StorageError> {
        self.call("active_executions", |conn| {
            query_executions(
                conn,
                &format!(
                    "SELECT {EXECUTION_COLUMNS} FROM executions
                     WHERE status = 'running' ORDER BY start_time DESC"
                ),
                [],
            )
        })
        .await
    }

    pub async fn active_execution(&self, job_id: &str) -> Result<Option<Execution>, StorageError> {
        let job_id = job_id.to_string();
        let mut rows = self
            .call("active_execution", move |conn| {
                query_executions(
                    conn,
                    &format!(
                        "SELECT {EXECUTION_COLUMNS} FROM executions
                         WHERE status = 'running' AND job_id = ?1"
                    ),
                    [&job_id],
                )
            })
            .await?;
        Ok(rows.pop())
    }

    pub async fn execution(&self, id: i64) -> Result<Option<Execution>, StorageError> {
        let mut rows = self
            .call("execution", move |conn| {
                query_executions(
                    conn,
                    &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1"),
                    [id],
                )
            })
            .await?;
        Ok(rows.pop())
    }

    /// Most recent executions across all jobs, newest first.
    pub async fn recent_executions(&self, limit: u32) -> Result<Vec<Execution>, StorageError> {
        self.call("recent_executions", move |conn| {
            query_executions(
                conn,
                &format!(
                    "SELECT {EXECUTION_COLUMNS} FROM executions
                     ORDER BY start_time DESC, id DESC LIMIT ?1"
                ),
                [limit],
            )
        })
        .await
    }

    /// Log lines of one execution in line order.
    pub async fn execution_logs(
        &self,
        execution_id: i64,
        limit: u32,
    ) -> Result<Vec<LogLine>, StorageError> {
        self.call("execution_logs", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT line_number, timestamp, content, level FROM log_lines
                 WHERE execution_id = ?1 ORDER BY line_number ASC LIMIT ?2",
            )?;
            let raw = stmt
                .query_map(params![execution_id, limit], |r| {
                    Ok((
                        r.get::<_, u32>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            raw.into_iter()
                .map(|(line_number, stamp, content, level)| {
                    Ok(LogLine {
                        execution_id,
                        line_number,
                        timestamp: parse_ts("timestamp", &stamp)?,
                        content,
                        level: level.parse().map_err(|_| StorageError::Malformed {
                            column: "level",
                            value: level.clone(),
                        })?,
                    })
                })
                .collect()
        })
        .await
    }

    /// Most recent output of a job across its executions, rendered as
    /// `[HH:MM:SS] content` in chronological order.
    pub async fn job_logs(&self, job_id: &str, limit: u32) -> Result<Vec<String>, StorageError> {
        let job_id = job_id.to_string();
        self.call("job_logs", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT l.timestamp, l.content FROM log_lines l
                 JOIN executions e ON l.execution_id = e.id
                 WHERE e.job_id = ?1
                 ORDER BY l.timestamp DESC, l.line_number DESC LIMIT ?2",
            )?;
            let raw = stmt
                .query_map(params![job_id, limit], |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut lines = raw
                .into_iter()
                .map(|(stamp, content)| {
                    let at = parse_ts("timestamp", &stamp)?;
                    Ok(format!("[{}] {}", at.with_timezone(&Local).format("%H:%M:%S"), content))
                })
                .collect::<Result<Vec<_>, StorageError>>()?;
            lines.reverse();
            Ok(lines)
        })
        .await
    }

    /// Delete every stored log line of a job. Returns the number removed.
    pub async fn clear_job_logs(&self, job_id: &str) -> Result<usize, StorageError> {
        let job_id = job_id.to_string();
        let removed = self
            .call("clear_job_logs", move |conn| {
                Ok(conn.execute(
                    "DELETE FROM log_lines WHERE execution_id IN
                     (SELECT id FROM executions WHERE job_id = ?1)",
                    [&job_id],
                )?)
            })
            .await?;
        info!(removed, "cleared stored job logs");
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<ExecutionStats, StorageError> {
        self.call("stats", |conn| {
            let total: i64 = conn.query_row("SELECT COUNT(*) FROM executions", [], |r| r.get(0))?;

            let (successful, finished): (i64, i64) = conn.query_row(
                "SELECT COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                        COUNT(*)
                 FROM executions WHERE status != 'running'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            let success_rate = if finished > 0 {
                successful as f64 / finished as f64 * 100.0
            } else {
                0.0
            };

            let mut stmt = conn.prepare(
                "SELECT job_id, MAX(job_name), COUNT(*) AS n FROM executions
                 GROUP BY job_id ORDER BY n DESC, job_id ASC LIMIT ?1",
            )?;
            let most_used = stmt
                .query_map([MOST_USED_LIMIT], |r| {
                    Ok(JobUsage {
                        job_id: r.get(0)?,
                        job_name: r.get(1)?,
                        count: r.get::<_, i64>(2)? as u64,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(ExecutionStats {
                total_executions: total as u64,
                success_rate,
                most_used,
            })
        })
        .await
    }

    /// Delete finished executions that started more than `days` ago, together
    /// with their log lines. Running executions are never deleted.
    pub async fn cleanup_older_than(&self, days: u32) -> Result<usize, StorageError> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let deleted = self
            .call("cleanup_older_than", move |conn| {
                Ok(conn.execute(
                    "DELETE FROM executions WHERE start_time < ?1 AND status != 'running'",
                    [ts(&cutoff)],
                )?)
            })
            .await?;
        if deleted > 0 {
            info!(deleted, days, "cleaned up old execution records");
        }
        Ok(deleted)
    }
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    ((end - start).num_milliseconds() as f64 / 1000.0).max(0.0)
}

/// Shared terminal transition; only touches rows that are still running.
fn close_execution(
    conn: &mut rusqlite::Connection,
    id: i64,
    status: ExecutionStatus,
    return_code: Option<i32>,
    error: Option<&str>,
) -> Result<bool, StorageError> {
    let tx = conn.transaction()?;
    let row: Option<(String, String)> = tx
        .query_row(
            "SELECT start_time, status FROM executions WHERE id = ?1",
            [id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((start_raw, current)) = row else {
        return Err(StorageError::NotFound {
            what: "execution",
            key: id.to_string(),
        });
    };
    if current != ExecutionStatus::Running.as_str() {
        return Ok(false);
    }

    let end = Utc::now();
    let duration = seconds_between(parse_ts("start_time", &start_raw)?, end);
    let changed = tx.execute(
        "UPDATE executions
         SET end_time = ?1, duration_seconds = ?2, status = ?3, return_code = ?4,
             error_message = ?5, updated_at = datetime('now')
         WHERE id = ?6 AND status = 'running'",
        params![ts(&end), duration, status.as_str(), return_code, error, id],
    )?;
    tx.commit()?;
    Ok(changed > 0)
}

struct ExecutionRow {
    id: i64,
    job_id: String,
    job_name: String,
    triggered_by: String,
    start_time: String,
    end_time: Option<String>,
    duration_seconds: Option<f64>,
    status: String,
    return_code: Option<i32>,
    dry_run: bool,
    pid: Option<u32>,
    error_message: Option<String>,
}

impl ExecutionRow {
    fn read(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            job_id: r.get(1)?,
            job_name: r.get(2)?,
            triggered_by: r.get(3)?,
            start_time: r.get(4)?,
            end_time: r.get(5)?,
            duration_seconds: r.get(6)?,
            status: r.get(7)?,
            return_code: r.get(8)?,
            dry_run: r.get(9)?,
            pid: r.get(10)?,
            error_message: r.get(11)?,
        })
    }

    fn into_execution(self) -> Result<Execution, StorageError> {
        Ok(Execution {
            id: self.id,
            job_id: self.job_id,
            job_name: self.job_name,
            triggered_by: self.triggered_by.parse().map_err(|_| StorageError::Malformed {
                column: "triggered_by",
                value: self.triggered_by.clone(),
            })?,
            start_time: parse_ts("start_time", &self.start_time)?,
            end_time: parse_opt_ts("end_time", self.end_time)?,
            duration_seconds: self.duration_seconds,
            status: self.status.parse().map_err(|_| StorageError::Malformed {
                column: "status",
                value: self.status.clone(),
            })?,
            return_code: self.return_code,
            dry_run: self.dry_run,
            pid: self.pid,
            error_message: self.error_message,
        })
    }
}

fn query_executions<P: rusqlite::Params>(
    conn: &rusqlite::Connection,
    sql: &str,
    params: P,
) -> Result<Vec<Execution>, StorageError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, ExecutionRow::read)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(ExecutionRow::into_execution).collect()
}
