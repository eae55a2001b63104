//! How a job is turned into a child process, and how it is taken down.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::catalog::JobDefinition;

const DRY_RUN_FLAG: &str = "--dry-run";
const DRY_RUN_ENV: &str = "DRY_RUN";
const SCRIPT_EXTENSIONS: &[&str] = &["py", "sh", "bash"];

/// Fully resolved command line for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
}

impl Invocation {
    /// argv is the job command, then the input if any, then `--dry-run` when
    /// requested and supported. Jobs that support dry-run always see
    /// `DRY_RUN=true|false`.
    pub fn build(
        job: &JobDefinition,
        input: Option<&str>,
        dry_run: bool,
        default_dir: Option<&Path>,
    ) -> Self {
        let mut parts = job.command.iter().cloned();
        let program = parts.next().unwrap_or_default();
        let mut args: Vec<String> = parts.collect();

        if let Some(input) = input.filter(|i| !i.is_empty()) {
            args.push(input.to_string());
        }

        let mut env = Vec::new();
        if job.supports_dry_run {
            if dry_run {
                args.push(DRY_RUN_FLAG.to_string());
            }
            env.push((DRY_RUN_ENV.to_string(), dry_run.to_string()));
        }

        Self {
            program,
            args,
            env,
            working_dir: job
                .working_dir
                .clone()
                .or_else(|| default_dir.map(Path::to_path_buf)),
        }
    }

    /// Verify the program and any script arguments exist. Returns a
    /// description of what is missing.
    pub fn check(&self) -> Result<(), String> {
        if self.program.is_empty() {
            return Err("job has no command".to_string());
        }
        if resolve_program(&self.program, self.working_dir.as_deref()).is_none() {
            return Err(format!("executable not found: {}", self.program));
        }
        for arg in &self.args {
            let path = Path::new(arg);
            let is_script = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| SCRIPT_EXTENSIONS.contains(&e));
            if is_script && !self.relative(path).exists() {
                return Err(format!("script not found: {arg}"));
            }
        }
        Ok(())
    }

    fn relative(&self, path: &Path) -> PathBuf {
        match &self.working_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// A `Command` with piped output, null stdin and kill-on-drop.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// A program containing a path separator is taken as a path (relative to the
/// working directory); anything else is looked up on `PATH`.
fn resolve_program(program: &str, working_dir: Option<&Path>) -> Option<PathBuf> {
    let path = Path::new(program);
    if path.components().count() > 1 {
        let full = match working_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        };
        return full.is_file().then_some(full);
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Exit code of a finished child. A child killed by a signal reports
/// `128 + signal`, as a shell would.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    super::EXIT_INTERNAL
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
pub(crate) async fn terminate_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(exit_code = status.code(), "job exited after SIGTERM");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "error waiting for job after SIGTERM");
        }
        Err(_) => {
            warn!("job did not exit after SIGTERM, sending SIGKILL");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to SIGKILL job");
            }
        }
    }
}

/// Whether a process with this pid exists.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

/// Same escalation as [`terminate_child`] for a process this host did not
/// spawn, e.g. one left behind by a previous run of the service.
#[cfg(unix)]
pub(crate) async fn terminate_pid(pid: u32, grace: Duration) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    unsafe {
        libc::kill(raw, libc::SIGTERM);
    }
    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !pid_alive(pid) {
            debug!(pid, "process exited after SIGTERM");
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if pid_alive(pid) {
        warn!(pid, "process did not exit after SIGTERM, sending SIGKILL");
        unsafe {
            libc::kill(raw, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
pub(crate) async fn terminate_pid(_pid: u32, _grace: Duration) {}
