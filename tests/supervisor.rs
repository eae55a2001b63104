//! Process supervision against real `/bin/sh` children and an on-disk ledger.
#![cfg(unix)]

use std::time::Duration;

use runledger::config::AppConfig;
use runledger::ledger::{ExecutionStatus, NewExecution, Trigger};
use runledger::reconciler::StatusSource;
use runledger::supervisor::{RunOptions, RunOutcome, SupervisorError, EXIT_TIMEOUT};
use runledger::Services;
use tempfile::TempDir;

const JOBS: &str = r#"
[[jobs]]
id = "hello"
name = "Say hello"
command = ["sh", "-c", "echo one; echo two; echo three"]

[[jobs]]
id = "fail"
command = ["sh", "-c", "echo boom; exit 3"]

[[jobs]]
id = "sleepy"
command = ["sh", "-c", "echo 'PROGRESS: [1/4] 25% - Processing: warmup'; exec sleep 30"]

[[jobs]]
id = "echo-args"
command = ["sh", "-c", "echo \"args=$*\" \"dry=$DRY_RUN\"", "echo-args"]
supports_dry_run = true
accepts_input = true

[[jobs]]
id = "missing"
command = ["/nonexistent/runledger-test-binary"]
"#;

async fn services(dir: &TempDir, runner: &str) -> Services {
    let db = dir.path().join("ledger.db");
    let activity = dir.path().join("activity.jsonl");
    let toml = format!(
        r#"
[storage]
db_path = "{}"
busy_backoff_ms = [10, 20]

[activity]
path = "{}"

[runner]
stop_grace_ms = 300
{runner}
{JOBS}
"#,
        db.display(),
        activity.display(),
    );
    let config = AppConfig::parse(&toml).unwrap();
    Services::build(&config).await.unwrap()
}

fn manual() -> RunOptions {
    RunOptions {
        trigger: Trigger::Manual,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_run_completes_and_records_gapless_lines() {
    let dir = tempfile::tempdir().unwrap();
    let s = services(&dir, "").await;
    let job = s.catalog.get("hello").unwrap().clone();

    let report = s.supervisor.run_to_completion(&job, manual()).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);

    let id = report.execution_id.expect("execution recorded");
    let exec = s.ledger.execution(id).await.unwrap().unwrap();
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.return_code, Some(0));
    assert_eq!(exec.job_name, "Say hello");
    assert!(exec.end_time.is_some());
    assert!(exec.duration_seconds.unwrap() >= 0.0);

    let lines = s.ledger.execution_logs(id, 100).await.unwrap();
    let numbers: Vec<u32> = lines.iter().map(|l| l.line_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
    let content: Vec<&str> = lines.iter().map(|l| l.content.as_str()).collect();
    assert_eq!(content, vec!["one", "two", "three", "Job exited with code 0"]);

    let buffered = s.supervisor.output("hello", 10).await;
    assert_eq!(buffered.len(), 4);
    assert!(buffered[0].ends_with("] one"));

    let history = s.supervisor.history("hello").await.unwrap();
    assert_eq!(history.execution_count, 1);
    assert_eq!(history.last_return_code, Some(0));
    assert!(!s.supervisor.is_running("hello").await);
}

#[tokio::test]
async fn test_nonzero_exit_is_failed() {
    let dir = tempfile::tempdir().unwrap();
    let s = services(&dir, "").await;
    let job = s.catalog.get("fail").unwrap().clone();

    let report = s.supervisor.run_to_completion(&job, manual()).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Failed { code: 3 });

    let exec = s
        .ledger
        .execution(report.execution_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(exec.return_code, Some(3));
    assert_eq!(exec.error_message.as_deref(), Some("Job exited with code 3"));
}

#[tokio::test]
async fn test_input_and_dry_run_reach_the_child() {
    let dir = tempfile::tempdir().unwrap();
    let s = services(&dir, "").await;
    let job = s.catalog.get("echo-args").unwrap().clone();

    let opts = RunOptions {
        input: Some("library".into()),
        dry_run: true,
        trigger: Trigger::Manual,
    };
    let report = s.supervisor.run_to_completion(&job, opts).await.unwrap();
    assert!(report.outcome.is_success());

    let lines = s
        .ledger
        .execution_logs(report.execution_id.unwrap(), 10)
        .await
        .unwrap();
    assert_eq!(lines[0].content, "args=library --dry-run dry=true");
    let exec = s
        .ledger
        .execution(report.execution_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert!(exec.dry_run);
}

#[tokio::test]
async fn test_second_run_while_running_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let s = services(&dir, "").await;
    let job = s.catalog.get("sleepy").unwrap().clone();

    let handle = s.supervisor.run(&job, manual()).await.unwrap();
    let second = s.supervisor.run(&job, manual()).await;
    assert!(matches!(second, Err(SupervisorError::Conflict(_))));

    let active = s.ledger.active_executions().await.unwrap();
    assert_eq!(active.len(), 1);

    s.supervisor.stop("sleepy", "test over").await.unwrap();
    let report = handle.wait().await;
    assert_eq!(
        report.outcome,
        RunOutcome::Stopped {
            reason: "test over".into()
        }
    );
}

#[tokio::test]
async fn test_stop_records_stopped_and_second_stop_is_not_running() {
    let dir = tempfile::tempdir().unwrap();
    let s = services(&dir, "").await;
    let job = s.catalog.get("sleepy").unwrap().clone();

    let handle = s.supervisor.run(&job, manual()).await.unwrap();
    let id = handle.execution_id.unwrap();

    s.supervisor.stop("sleepy", "Manually stopped").await.unwrap();
    let exec = s.ledger.execution(id).await.unwrap().unwrap();
    assert_eq!(exec.status, ExecutionStatus::Stopped);
    assert_eq!(exec.return_code, None);
    assert_eq!(exec.error_message.as_deref(), Some("Manually stopped"));
    assert!(!s.supervisor.is_running("sleepy").await);

    let again = s.supervisor.stop("sleepy", "again").await;
    assert!(matches!(again, Err(SupervisorError::NotRunning(_))));

    let lines = s.ledger.execution_logs(id, 10).await.unwrap();
    assert_eq!(
        lines.last().unwrap().content,
        "Job stopped: Manually stopped"
    );
    handle.wait().await;
}

#[tokio::test]
async fn test_timeout_kills_and_records_sentinel() {
    let dir = tempfile::tempdir().unwrap();
    let s = services(&dir, "timeout_secs = 1").await;
    let job = s.catalog.get("sleepy").unwrap().clone();

    let started = std::time::Instant::now();
    let report = s.supervisor.run_to_completion(&job, manual()).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(matches!(report.outcome, RunOutcome::TimedOut { .. }));

    let exec = s
        .ledger
        .execution(report.execution_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(exec.return_code, Some(EXIT_TIMEOUT));
    assert_eq!(
        exec.error_message.as_deref(),
        Some("Job timed out after 1 seconds")
    );
}

#[tokio::test]
async fn test_missing_executable_leaves_no_execution() {
    let dir = tempfile::tempdir().unwrap();
    let s = services(&dir, "").await;
    let job = s.catalog.get("missing").unwrap().clone();

    let result = s.supervisor.run(&job, manual()).await;
    assert!(matches!(result, Err(SupervisorError::NotFound { .. })));
    assert!(s.ledger.recent_executions(10).await.unwrap().is_empty());
    assert!(!s.supervisor.is_running("missing").await);
}

#[tokio::test]
async fn test_live_status_reports_progress() {
    let dir = tempfile::tempdir().unwrap();
    let s = services(&dir, "").await;
    let job = s.catalog.get("sleepy").unwrap().clone();

    let handle = s.supervisor.run(&job, manual()).await.unwrap();

    let mut progress = None;
    for _ in 0..50 {
        let status = s.reconciler.status("sleepy").await.unwrap();
        assert!(status.running);
        assert_eq!(status.source, StatusSource::Live);
        if status.progress.is_some() {
            progress = status.progress;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let main = progress.expect("progress line seen").main.unwrap();
    assert_eq!(main.current, 1);
    assert_eq!(main.total, 4);
    assert_eq!(main.percentage, 25);
    assert_eq!(main.current_item, "warmup");

    s.supervisor.stop("sleepy", "done").await.unwrap();
    handle.wait().await;
}

#[tokio::test]
async fn test_orphans_are_healed_and_reported_from_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let s = services(&dir, "").await;

    // A row left behind by a previous host process.
    let id = s
        .ledger
        .start_execution(NewExecution {
            job_id: "hello".into(),
            job_name: "Say hello".into(),
            triggered_by: Trigger::Scheduled,
            start_time: chrono::Utc::now(),
            dry_run: false,
            pid: None,
        })
        .await
        .unwrap();

    let status = s.reconciler.status("hello").await.unwrap();
    assert!(status.running);
    assert_eq!(status.source, StatusSource::Ledger);
    assert_eq!(status.execution_id, Some(id));

    assert_eq!(s.reconciler.heal_orphans().await.unwrap(), 1);
    assert_eq!(s.reconciler.heal_orphans().await.unwrap(), 0);

    let exec = s.ledger.execution(id).await.unwrap().unwrap();
    assert_eq!(exec.status, ExecutionStatus::Stopped);
    let status = s.reconciler.status("hello").await.unwrap();
    assert!(!status.running);
    assert_eq!(status.source, StatusSource::Idle);

    // The job can run again once healed.
    let job = s.catalog.get("hello").unwrap().clone();
    let report = s.supervisor.run_to_completion(&job, manual()).await.unwrap();
    assert!(report.outcome.is_success());
}

#[tokio::test]
async fn test_stop_without_live_run_closes_ledger_row() {
    let dir = tempfile::tempdir().unwrap();
    let s = services(&dir, "").await;

    let id = s
        .ledger
        .start_execution(NewExecution {
            job_id: "sleepy".into(),
            job_name: "sleepy".into(),
            triggered_by: Trigger::Manual,
            start_time: chrono::Utc::now(),
            dry_run: false,
            pid: None,
        })
        .await
        .unwrap();

    s.supervisor.stop("sleepy", "cleanup").await.unwrap();
    let exec = s.ledger.execution(id).await.unwrap().unwrap();
    assert_eq!(exec.status, ExecutionStatus::Stopped);
    assert_eq!(exec.error_message.as_deref(), Some("cleanup"));
}

#[tokio::test]
async fn test_activity_log_records_start_and_completion() {
    let dir = tempfile::tempdir().unwrap();
    let s = services(&dir, "").await;
    let job = s.catalog.get("fail").unwrap().clone();

    s.supervisor.run_to_completion(&job, manual()).await.unwrap();

    let entries = s.activity.recent(10).await;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].action_type, "job_complete");
    assert_eq!(entries[1].action_type, "job_start");
}

#[tokio::test]
async fn test_concurrent_starts_claim_the_job_once() {
    let dir = tempfile::tempdir().unwrap();
    let s = services(&dir, "").await;
    let job = s.catalog.get("sleepy").unwrap().clone();

    let mut starts = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let supervisor = s.supervisor.clone();
        let job = job.clone();
        starts.spawn(async move { supervisor.run(&job, manual()).await });
    }

    let mut handles = Vec::new();
    let mut conflicts = 0;
    while let Some(result) = starts.join_next().await {
        match result.unwrap() {
            Ok(handle) => handles.push(handle),
            Err(SupervisorError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected start error: {e}"),
        }
    }
    assert_eq!(handles.len(), 1);
    assert_eq!(conflicts, 7);
    assert_eq!(s.ledger.active_executions().await.unwrap().len(), 1);

    s.supervisor.stop("sleepy", "race over").await.unwrap();
    for handle in handles {
        handle.wait().await;
    }
    assert!(s.ledger.active_executions().await.unwrap().is_empty());
}
