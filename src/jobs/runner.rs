//! Process runner -- spawn a script in its own process group, stream its
//! output into a per-execution log file, enforce a deadline and honour
//! external cancellation.

use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::Local;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{RecordId, ScriptId, NO_EXIT_CODE, TIMEOUT_EXIT_CODE};

/// Preparation failures. Each one ends the execution before a process exists.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to create log directory {path}: {source}")]
    LogDir { path: PathBuf, source: io::Error },

    #[error("failed to create log file {path}: {source}")]
    LogFile { path: PathBuf, source: io::Error },

    #[error("script file does not exist: {0}")]
    ScriptMissing(PathBuf),

    #[error("failed to create working directory {path}: {source}")]
    WorkDir { path: PathBuf, source: io::Error },
}

impl RunnerError {
    /// True when the log could not be prepared, which is an engine-side fault
    /// rather than a problem with the script.
    pub fn is_log_failure(&self) -> bool {
        matches!(self, RunnerError::LogDir { .. } | RunnerError::LogFile { .. })
    }
}

/// Everything needed to launch one script.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub execution_id: RecordId,
    pub script_id: ScriptId,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Added on top of the inherited process environment.
    pub env: Vec<(String, String)>,
    pub work_dir: Option<PathBuf>,
    pub timeout: Duration,
    pub log_path: PathBuf,
}

/// How the process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    ProcessError { exit_code: i32, message: String },
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub exit_code: i32,
    pub elapsed: Duration,
    pub outcome: RunOutcome,
}

// ---------------------------------------------------------------------------
// ExecutionLog
// ---------------------------------------------------------------------------

/// Plain-text execution log. The handle is released when the value drops.
pub struct ExecutionLog {
    file: File,
    path: PathBuf,
}

impl ExecutionLog {
    /// Create (truncate) the log file.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Reopen an existing log for appending.
    pub fn append(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one timestamped lifecycle line. Write failures are logged, not raised.
    pub fn mark(&mut self, level: &str, message: impl Display) {
        let ts = Local::now().to_rfc3339();
        if let Err(e) = writeln!(self.file, "[{ts}] [{level}] {message}") {
            warn!(path = %self.path.display(), error = %e, "failed to write execution log");
        }
    }

    /// A duplicate handle for the child's stdout/stderr.
    fn stdio(&self) -> io::Result<Stdio> {
        Ok(Stdio::from(self.file.try_clone()?))
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Run `spec` to completion, timeout or cancellation.
///
/// The log directory and file are created first; every later failure is also
/// written to the log before returning.
pub async fn run(spec: &ProcessSpec, cancel: &CancellationToken) -> Result<RunReport, RunnerError> {
    if let Some(dir) = spec.log_path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| RunnerError::LogDir {
                path: dir.to_path_buf(),
                source,
            })?;
    }

    let mut log = ExecutionLog::create(&spec.log_path).map_err(|source| RunnerError::LogFile {
        path: spec.log_path.clone(),
        source,
    })?;

    let started = Instant::now();
    log.mark(
        "INFO",
        format!(
            "started execution {} (script {})",
            spec.execution_id, spec.script_id
        ),
    );

    let result = launch(spec, cancel, &mut log, started).await;
    if let Err(e) = &result {
        log.mark("ERROR", e);
    }
    result
}

async fn launch(
    spec: &ProcessSpec,
    cancel: &CancellationToken,
    log: &mut ExecutionLog,
    started: Instant,
) -> Result<RunReport, RunnerError> {
    if tokio::fs::metadata(&spec.program).await.is_err() {
        return Err(RunnerError::ScriptMissing(spec.program.clone()));
    }

    if let Some(dir) = &spec.work_dir {
        if tokio::fs::metadata(dir).await.is_err() {
            log.mark(
                "INFO",
                format!("working directory missing, creating {}", dir.display()),
            );
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| RunnerError::WorkDir {
                    path: dir.clone(),
                    source,
                })?;
        }
    }

    let (stdout, stderr) = match (log.stdio(), log.stdio()) {
        (Ok(out), Ok(err)) => (out, err),
        (Err(source), _) | (_, Err(source)) => {
            return Err(RunnerError::LogFile {
                path: log.path().to_path_buf(),
                source,
            })
        }
    };

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .kill_on_drop(true);
    if let Some(dir) = &spec.work_dir {
        cmd.current_dir(dir);
    }
    // Lead a fresh process group so the whole subtree can be signalled.
    #[cfg(unix)]
    cmd.process_group(0);

    log.mark(
        "INFO",
        format!("command: {} {}", spec.program.display(), spec.args.join(" ")),
    );

    if cancel.is_cancelled() {
        info!(execution_id = spec.execution_id, "cancelled before start, not spawning");
        return Ok(finish(log, started, spec.timeout, RunOutcome::Cancelled));
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let message = format!("failed to start {}: {e}", spec.program.display());
            return Ok(finish(log, started, spec.timeout, RunOutcome::ProcessError {
                exit_code: NO_EXIT_CODE,
                message,
            }));
        }
    };
    let pgid = child.id();
    debug!(execution_id = spec.execution_id, pid = ?pgid, "script process started");

    let deadline = tokio::time::sleep(spec.timeout);
    tokio::pin!(deadline);

    let outcome = tokio::select! {
        biased;

        _ = cancel.cancelled() => {
            info!(execution_id = spec.execution_id, "cancellation requested, killing process group");
            kill_process_group(&mut child, pgid).await;
            RunOutcome::Cancelled
        }

        _ = &mut deadline => {
            warn!(execution_id = spec.execution_id, timeout_secs = spec.timeout.as_secs(), "execution timed out, killing process group");
            kill_process_group(&mut child, pgid).await;
            RunOutcome::TimedOut
        }

        status = child.wait() => match status {
            Ok(status) if status.success() => RunOutcome::Succeeded,
            Ok(status) => RunOutcome::ProcessError {
                exit_code: status.code().unwrap_or(NO_EXIT_CODE),
                message: describe_exit(&status),
            },
            Err(e) => RunOutcome::ProcessError {
                exit_code: NO_EXIT_CODE,
                message: format!("failed to wait for process: {e}"),
            },
        }
    };

    Ok(finish(log, started, spec.timeout, outcome))
}

/// Write the closing lifecycle marker and build the report.
fn finish(
    log: &mut ExecutionLog,
    started: Instant,
    timeout: Duration,
    outcome: RunOutcome,
) -> RunReport {
    let elapsed = started.elapsed();
    let secs = elapsed.as_secs_f64();
    let exit_code = match &outcome {
        RunOutcome::Succeeded => {
            log.mark("INFO", format!("succeeded (elapsed {secs:.3}s)"));
            0
        }
        RunOutcome::ProcessError { exit_code, message } => {
            log.mark(
                "ERROR",
                format!("failed (exit code {exit_code}, elapsed {secs:.3}s): {message}"),
            );
            *exit_code
        }
        RunOutcome::TimedOut => {
            log.mark(
                "WARN",
                format!(
                    "timed out after {secs:.3}s (limit {}s)",
                    timeout.as_secs()
                ),
            );
            TIMEOUT_EXIT_CODE
        }
        RunOutcome::Cancelled => {
            log.mark("WARN", format!("cancelled (elapsed {secs:.3}s)"));
            NO_EXIT_CODE
        }
    };
    RunReport {
        exit_code,
        elapsed,
        outcome,
    }
}

fn describe_exit(status: &std::process::ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("terminated by signal {signal}");
        }
    }
    format!("exited with {status}")
}

/// SIGKILL the whole process group led by the child, then reap the child.
async fn kill_process_group(child: &mut Child, pgid: Option<u32>) {
    #[cfg(unix)]
    {
        let signalled = pgid
            .and_then(|pid| i32::try_from(pid).ok())
            // SAFETY: kill(2) has no memory-safety preconditions.
            .map(|pid| unsafe { libc::kill(-pid, libc::SIGKILL) } == 0)
            .unwrap_or(false);
        if !signalled {
            warn!(pgid = ?pgid, "process group kill failed, killing child only");
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "failed to kill child");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pgid;
        if let Err(e) = child.start_kill() {
            warn!(error = %e, "failed to kill child");
        }
    }

    if let Err(e) = child.wait().await {
        warn!(error = %e, "error reaping killed child");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
