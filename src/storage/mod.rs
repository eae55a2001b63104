//! SQLite storage layer -- connection pool, schema, contention retry.

pub mod schema;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, ErrorCode};
use thiserror::Error;
use tracing::warn;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database stayed busy after {attempts} attempts")]
    Exhausted {
        attempts: usize,
        #[source]
        source: rusqlite::Error,
    },

    #[error("job {job_id} already has a running execution")]
    AlreadyRunning { job_id: String },

    #[error("{what} {key} not found")]
    NotFound { what: &'static str, key: String },

    #[error("malformed {column} value {value:?}")]
    Malformed { column: &'static str, value: String },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Pool(#[from] r2d2::Error),

    #[error("storage task failed: {0}")]
    Task(String),
}

impl StorageError {
    /// SQLite reported the database as busy or locked by another writer.
    pub fn is_contention(&self) -> bool {
        match self {
            StorageError::Sqlite(e) => is_busy(e),
            _ => false,
        }
    }
}

pub(crate) fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

pub(crate) fn is_constraint(e: &rusqlite::Error) -> bool {
    e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation)
}

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> anyhow::Result<Pool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Backoff schedule applied when SQLite reports contention.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn from_millis(delays_ms: &[u64]) -> Self {
        Self::new(delays_ms.iter().map(|ms| Duration::from_millis(*ms)).collect())
    }

    /// Total attempts including the first one.
    pub fn attempts(&self) -> usize {
        self.delays.len() + 1
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_millis(&[500, 1000, 2000])
    }
}

/// Run `op` on a pooled connection off the async executor, retrying on
/// `SQLITE_BUSY` / `SQLITE_LOCKED` according to `policy`.
pub async fn with_retry<T, F>(
    pool: &Pool,
    policy: &RetryPolicy,
    what: &'static str,
    op: F,
) -> Result<T, StorageError>
where
    T: Send + 'static,
    F: Fn(&mut Connection) -> Result<T, StorageError> + Send + Sync + 'static,
{
    let op = Arc::new(op);
    let mut attempt = 0;

    loop {
        let pool = pool.clone();
        let op = Arc::clone(&op);
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            (*op)(&mut conn)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?;

        match result {
            Err(StorageError::Sqlite(e)) if is_busy(&e) => {
                let Some(delay) = policy.delays.get(attempt).copied() else {
                    return Err(StorageError::Exhausted {
                        attempts: attempt + 1,
                        source: e,
                    });
                };
                attempt += 1;
                warn!(
                    operation = what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "database busy, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

/// Fixed-width RFC 3339 rendering, so lexical order in SQL matches time order.
pub fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(column: &'static str, raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StorageError::Malformed {
            column,
            value: raw.to_string(),
        })
}

pub fn parse_opt_ts(
    column: &'static str,
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>, StorageError> {
    raw.map(|r| parse_ts(column, &r)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ts_is_fixed_width_and_sortable() {
        let a = DateTime::parse_from_rfc3339("2026-01-01T10:00:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let b = DateTime::parse_from_rfc3339("2026-01-01T10:00:05.25Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(ts(&a).len(), ts(&b).len());
        assert!(ts(&a) < ts(&b));
        assert_eq!(parse_ts("t", &ts(&b)).unwrap(), b);
    }

    #[test]
    fn test_parse_ts_rejects_garbage() {
        assert!(matches!(
            parse_ts("start_time", "yesterday"),
            Err(StorageError::Malformed { column: "start_time", .. })
        ));
    }

    #[test]
    fn test_default_policy_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts(), 4);
        assert_eq!(policy.delays[0], Duration::from_millis(500));
        assert_eq!(policy.delays[2], Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_on_persistent_busy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("busy.db");
        let pool = open_pool(path.to_str().unwrap()).unwrap();
        let policy = RetryPolicy::from_millis(&[1, 1]);

        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let result: Result<(), _> = with_retry(&pool, &policy, "test", move |_conn| {
            seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(StorageError::Sqlite(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                None,
            )))
        })
        .await;

        assert!(matches!(result, Err(StorageError::Exhausted { attempts: 3, .. })));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_does_not_retry_other_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.db");
        let pool = open_pool(path.to_str().unwrap()).unwrap();

        let result: Result<i64, _> =
            with_retry(&pool, &RetryPolicy::default(), "test", |conn| {
                Ok(conn.query_row("SELECT no_such_column FROM executions", [], |r| r.get(0))?)
            })
            .await;
        assert!(matches!(result, Err(StorageError::Sqlite(_))));
    }
}
