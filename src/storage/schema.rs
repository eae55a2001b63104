//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS executions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL,
            job_name TEXT NOT NULL,
            triggered_by TEXT NOT NULL DEFAULT 'manual',
            start_time TEXT NOT NULL,
            end_time TEXT,
            duration_seconds REAL,
            status TEXT NOT NULL DEFAULT 'running',
            return_code INTEGER,
            dry_run INTEGER NOT NULL DEFAULT 0,
            pid INTEGER,
            error_message TEXT,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS log_lines (
            id INTEGER PRIMARY KEY,
            execution_id INTEGER NOT NULL,
            line_number INTEGER NOT NULL,
            timestamp TEXT NOT NULL,
            content TEXT NOT NULL,
            level TEXT NOT NULL DEFAULT 'info',
            FOREIGN KEY (execution_id) REFERENCES executions(id) ON DELETE CASCADE,
            UNIQUE (execution_id, line_number)
        );

        CREATE TABLE IF NOT EXISTS scheduled_jobs (
            job_id TEXT PRIMARY KEY,
            job_name TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            interval_type TEXT NOT NULL,
            interval_value INTEGER NOT NULL,
            next_run TEXT,
            last_run TEXT,
            last_run_status TEXT,
            last_run_duration REAL,
            run_count INTEGER NOT NULL DEFAULT 0,
            error_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_executions_job ON executions(job_id);
        CREATE INDEX IF NOT EXISTS idx_executions_start ON executions(start_time);
        CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_executions_one_running
            ON executions(job_id) WHERE status = 'running';
        CREATE INDEX IF NOT EXISTS idx_log_lines_execution ON log_lines(execution_id);
        CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_next_run ON scheduled_jobs(next_run);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}
