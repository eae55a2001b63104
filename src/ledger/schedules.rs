//! Scheduled job rows.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use super::model::{Interval, IntervalUnit, RunResult, ScheduleRun, ScheduledJob};
use super::Ledger;
use crate::storage::{parse_opt_ts, ts, StorageError};

const SCHEDULE_COLUMNS: &str = "job_id, job_name, enabled, interval_type, interval_value, \
     next_run, last_run, last_run_status, last_run_duration, run_count, error_count, last_error";

impl Ledger {
    /// Insert or replace the schedule for `job_id`. Counters of an existing
    /// schedule are kept; it is re-enabled with the new interval.
    pub async fn add_schedule(
        &self,
        job_id: &str,
        job_name: &str,
        interval: Interval,
        next_run: DateTime<Utc>,
    ) -> Result<ScheduledJob, StorageError> {
        let (job_id, job_name) = (job_id.to_string(), job_name.to_string());
        let key = job_id.clone();
        self.call("add_schedule", move |conn| {
            conn.execute(
                "INSERT INTO scheduled_jobs
                 (job_id, job_name, enabled, interval_type, interval_value, next_run)
                 VALUES (?1, ?2, 1, ?3, ?4, ?5)
                 ON CONFLICT(job_id) DO UPDATE SET
                     job_name = excluded.job_name,
                     enabled = 1,
                     interval_type = excluded.interval_type,
                     interval_value = excluded.interval_value,
                     next_run = excluded.next_run,
                     updated_at = datetime('now')",
                params![
                    job_id,
                    job_name,
                    interval.unit.as_str(),
                    interval.value,
                    ts(&next_run)
                ],
            )?;
            Ok(())
        })
        .await?;

        self.schedule(&key).await?.ok_or(StorageError::NotFound {
            what: "schedule",
            key,
        })
    }

    /// Returns `false` if no schedule existed for the job.
    pub async fn remove_schedule(&self, job_id: &str) -> Result<bool, StorageError> {
        let job_id = job_id.to_string();
        self.call("remove_schedule", move |conn| {
            Ok(conn.execute("DELETE FROM scheduled_jobs WHERE job_id = ?1", [&job_id])? > 0)
        })
        .await
    }

    pub async fn set_schedule_enabled(
        &self,
        job_id: &str,
        enabled: bool,
    ) -> Result<bool, StorageError> {
        let job_id = job_id.to_string();
        self.call("set_schedule_enabled", move |conn| {
            Ok(conn.execute(
                "UPDATE scheduled_jobs SET enabled = ?1, updated_at = datetime('now')
                 WHERE job_id = ?2",
                params![enabled, job_id],
            )? > 0)
        })
        .await
    }

    pub async fn update_schedule(
        &self,
        job_id: &str,
        interval: Interval,
        next_run: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let job_id = job_id.to_string();
        self.call("update_schedule", move |conn| {
            Ok(conn.execute(
                "UPDATE scheduled_jobs
                 SET interval_type = ?1, interval_value = ?2, next_run = ?3,
                     updated_at = datetime('now')
                 WHERE job_id = ?4",
                params![interval.unit.as_str(), interval.value, ts(&next_run), job_id],
            )? > 0)
        })
        .await
    }

    pub async fn schedule(&self, job_id: &str) -> Result<Option<ScheduledJob>, StorageError> {
        let job_id = job_id.to_string();
        let mut rows = self
            .call("schedule", move |conn| {
                query_schedules(
                    conn,
                    &format!("SELECT {SCHEDULE_COLUMNS} FROM scheduled_jobs WHERE job_id = ?1"),
                    [&job_id],
                )
            })
            .await?;
        Ok(rows.pop())
    }

    pub async fn schedules(&self) -> Result<Vec<ScheduledJob>, StorageError> {
        self.call("schedules", |conn| {
            query_schedules(
                conn,
                &format!("SELECT {SCHEDULE_COLUMNS} FROM scheduled_jobs ORDER BY job_name, job_id"),
                [],
            )
        })
        .await
    }

    /// Enabled schedules whose `next_run` is unset or not after `now`,
    /// earliest first.
    pub async fn due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledJob>, StorageError> {
        self.call("due_schedules", move |conn| {
            query_schedules(
                conn,
                &format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM scheduled_jobs
                     WHERE enabled = 1 AND (next_run IS NULL OR next_run <= ?1)
                     ORDER BY next_run ASC"
                ),
                [ts(&now)],
            )
        })
        .await
    }

    /// Fold one dispatch into the schedule: counters, last-run fields and the
    /// new `next_run`. `run.error` set means the run failed.
    pub async fn record_schedule_run(
        &self,
        job_id: &str,
        run: ScheduleRun,
    ) -> Result<bool, StorageError> {
        let job_id = job_id.to_string();
        self.call("record_schedule_run", move |conn| {
            let result = if run.error.is_none() {
                RunResult::Success
            } else {
                RunResult::Error
            };
            Ok(conn.execute(
                "UPDATE scheduled_jobs
                 SET last_run = ?1,
                     last_run_status = ?2,
                     last_run_duration = ?3,
                     next_run = ?4,
                     run_count = run_count + 1,
                     error_count = error_count + ?5,
                     last_error = ?6,
                     updated_at = datetime('now')
                 WHERE job_id = ?7",
                params![
                    ts(&run.finished_at),
                    result.as_str(),
                    run.duration_seconds,
                    ts(&run.next_run),
                    i64::from(run.error.is_some()),
                    run.error,
                    job_id
                ],
            )? > 0)
        })
        .await
    }
}

struct ScheduleRow {
    job_id: String,
    job_name: String,
    enabled: bool,
    interval_type: String,
    interval_value: u32,
    next_run: Option<String>,
    last_run: Option<String>,
    last_run_status: Option<String>,
    last_run_duration: Option<f64>,
    run_count: i64,
    error_count: i64,
    last_error: Option<String>,
}

impl ScheduleRow {
    fn read(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: r.get(0)?,
            job_name: r.get(1)?,
            enabled: r.get(2)?,
            interval_type: r.get(3)?,
            interval_value: r.get(4)?,
            next_run: r.get(5)?,
            last_run: r.get(6)?,
            last_run_status: r.get(7)?,
            last_run_duration: r.get(8)?,
            run_count: r.get(9)?,
            error_count: r.get(10)?,
            last_error: r.get(11)?,
        })
    }

    fn into_schedule(self) -> Result<ScheduledJob, StorageError> {
        let unit: IntervalUnit =
            self.interval_type
                .parse()
                .map_err(|_| StorageError::Malformed {
                    column: "interval_type",
                    value: self.interval_type.clone(),
                })?;
        let last_run_status = match self.last_run_status.as_deref() {
            None => None,
            Some("success") => Some(RunResult::Success),
            Some("error") => Some(RunResult::Error),
            Some(other) => {
                return Err(StorageError::Malformed {
                    column: "last_run_status",
                    value: other.to_string(),
                })
            }
        };

        Ok(ScheduledJob {
            job_id: self.job_id,
            job_name: self.job_name,
            enabled: self.enabled,
            interval: Interval::new(unit, self.interval_value),
            next_run: parse_opt_ts("next_run", self.next_run)?,
            last_run: parse_opt_ts("last_run", self.last_run)?,
            last_run_status,
            last_run_duration: self.last_run_duration,
            run_count: self.run_count.max(0) as u64,
            error_count: self.error_count.max(0) as u64,
            last_error: self.last_error,
        })
    }
}

fn query_schedules<P: rusqlite::Params>(
    conn: &rusqlite::Connection,
    sql: &str,
    params: P,
) -> Result<Vec<ScheduledJob>, StorageError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, ScheduleRow::read)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(ScheduleRow::into_schedule).collect()
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::storage;

    async fn ledger() -> (tempfile::TempDir, Ledger) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedules.db");
        let pool = storage::open_pool(path.to_str().unwrap()).unwrap();
        (dir, Ledger::new(pool))
    }

    fn every(minutes: u32) -> Interval {
        Interval::new(IntervalUnit::Minutes, minutes)
    }

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    #[tokio::test]
    async fn test_add_and_list() {
        let (_dir, ledger) = ledger().await;
        let now = Utc::now();
        let job = ledger.add_schedule("scan", "Scan", every(5), now).await.unwrap();
        assert!(job.enabled);
        assert_eq!(job.interval, every(5));
        assert_eq!(job.run_count, 0);
        assert_eq!(ledger.schedules().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_due_selection_and_order() {
        let (_dir, ledger) = ledger().await;
        let now = Utc::now();
        ledger.add_schedule("later", "Later", every(5), now + Duration::hours(1)).await.unwrap();
        ledger.add_schedule("b", "B", every(5), now - Duration::minutes(1)).await.unwrap();
        ledger.add_schedule("a", "A", every(5), now - Duration::minutes(10)).await.unwrap();
        ledger.add_schedule("off", "Off", every(5), now - Duration::minutes(30)).await.unwrap();
        ledger.set_schedule_enabled("off", false).await.unwrap();

        let due: Vec<String> = ledger
            .due_schedules(now)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.job_id)
            .collect();
        assert_eq!(due, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_record_run_advances_regardless_of_outcome() {
        let (_dir, ledger) = ledger().await;
        let t = at("2026-03-01T12:00:00Z");
        ledger.add_schedule("scan", "Scan", every(5), t).await.unwrap();

        ledger
            .record_schedule_run(
                "scan",
                ScheduleRun {
                    finished_at: t,
                    duration_seconds: 1.5,
                    error: None,
                    next_run: every(5).next_after(t),
                },
            )
            .await
            .unwrap();
        let job = ledger.schedule("scan").await.unwrap().unwrap();
        assert_eq!(job.next_run.unwrap(), t + Duration::minutes(5));
        assert_eq!((job.run_count, job.error_count), (1, 0));
        assert_eq!(job.last_run_status, Some(RunResult::Success));

        let t2 = t + Duration::minutes(5);
        ledger
            .record_schedule_run(
                "scan",
                ScheduleRun {
                    finished_at: t2,
                    duration_seconds: 0.2,
                    error: Some("exited with code 1".into()),
                    next_run: every(5).next_after(t2),
                },
            )
            .await
            .unwrap();
        let job = ledger.schedule("scan").await.unwrap().unwrap();
        assert_eq!(job.next_run.unwrap(), t2 + Duration::minutes(5));
        assert_eq!((job.run_count, job.error_count), (2, 1));
        assert_eq!(job.last_error.as_deref(), Some("exited with code 1"));
        assert_eq!(job.last_run_status, Some(RunResult::Error));
    }

    #[tokio::test]
    async fn test_crud_on_missing_job_reports_false() {
        let (_dir, ledger) = ledger().await;
        assert!(!ledger.remove_schedule("ghost").await.unwrap());
        assert!(!ledger.set_schedule_enabled("ghost", true).await.unwrap());
        assert!(!ledger.update_schedule("ghost", every(1), Utc::now()).await.unwrap());
        assert!(ledger.schedule("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_readd_keeps_counters() {
        let (_dir, ledger) = ledger().await;
        let t = at("2026-03-01T12:00:00Z");
        ledger.add_schedule("scan", "Scan", every(5), t).await.unwrap();
        ledger
            .record_schedule_run(
                "scan",
                ScheduleRun {
                    finished_at: t,
                    duration_seconds: 1.0,
                    error: None,
                    next_run: t,
                },
            )
            .await
            .unwrap();
        ledger.set_schedule_enabled("scan", false).await.unwrap();

        let job = ledger
            .add_schedule("scan", "Scan", Interval::new(IntervalUnit::Hours, 2), t)
            .await
            .unwrap();
        assert!(job.enabled);
        assert_eq!(job.run_count, 1);
        assert_eq!(job.interval.unit, IntervalUnit::Hours);
    }
}
