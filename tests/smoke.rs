//! Smoke tests -- verify the binary runs and key subcommands work end to end.

use assert_cmd::Command;
use predicates::str::contains;

fn write_config(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let path = dir.path().join("runledger.toml");
    let content = format!(
        r#"
[storage]
db_path = "{}"

[activity]
path = "{}"

[[jobs]]
id = "hello"
name = "Say hello"
command = ["sh", "-c", "echo hello from job"]

[[jobs]]
id = "broken"
command = ["sh", "-c", "exit 4"]
section = "tests"
"#,
        dir.path().join("ledger.db").display(),
        dir.path().join("activity.jsonl").display(),
    );
    std::fs::write(&path, content).unwrap();
    path
}

fn runledger(config: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("runledger").unwrap();
    cmd.arg("--config").arg(config).env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("runledger")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("crash-recoverable execution ledger"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("runledger")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(contains("runledger"));
}

#[test]
fn test_schedule_list_subcommand_exists() {
    Command::cargo_bin("runledger")
        .unwrap()
        .args(["schedule", "list", "--help"])
        .assert()
        .success();
}

#[test]
fn test_jobs_lists_catalog_by_section() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir);
    runledger(&config)
        .arg("jobs")
        .assert()
        .success()
        .stdout(contains("[commands]"))
        .stdout(contains("[tests]"))
        .stdout(contains("Say hello"));
}

#[cfg(unix)]
#[test]
fn test_run_streams_output_and_mirrors_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir);

    runledger(&config)
        .args(["run", "hello"])
        .assert()
        .success()
        .stdout(contains("hello from job"));

    runledger(&config).args(["run", "broken"]).assert().code(4);

    runledger(&config)
        .args(["history", "--limit", "5"])
        .assert()
        .success()
        .stdout(contains("hello"))
        .stdout(contains("Job exited with code 4"));

    runledger(&config)
        .arg("stats")
        .assert()
        .success()
        .stdout(contains("Total executions: 2"));
}

#[test]
fn test_schedule_add_and_list() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir);

    runledger(&config)
        .args(["schedule", "add", "hello", "--every", "hours", "--value", "6"])
        .assert()
        .success()
        .stdout(contains("Scheduled 'hello'"));

    runledger(&config)
        .args(["schedule", "list"])
        .assert()
        .success()
        .stdout(contains("hello"));

    runledger(&config)
        .args(["schedule", "add", "ghost", "--every", "hours", "--value", "6"])
        .assert()
        .failure();
}

#[test]
fn test_unknown_job_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir);
    runledger(&config).args(["run", "ghost"]).assert().failure();
}

#[cfg(unix)]
#[test]
fn test_run_prints_every_line_past_buffer_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("runledger.toml");
    std::fs::write(
        &config,
        format!(
            r#"
[storage]
db_path = "{}"

[activity]
path = "{}"

[runner]
output_buffer_lines = 3

[[jobs]]
id = "chatty"
command = ["sh", "-c", "for i in 1 2 3 4 5 6 7 8; do echo line$i; sleep 0.3; done"]
"#,
            dir.path().join("ledger.db").display(),
            dir.path().join("activity.jsonl").display(),
        ),
    )
    .unwrap();

    let output = runledger(&config)
        .args(["run", "chatty"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let stdout = String::from_utf8(output).unwrap();
    for i in 1..=8 {
        assert!(stdout.contains(&format!("] line{i}\n")), "line{i} missing:\n{stdout}");
    }
    assert!(stdout.contains("Job exited with code 0"));
}
