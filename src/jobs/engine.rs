//! Execution engine -- drives one execution from submission to a terminal
//! status and guarantees the record is finalized on every exit path.

use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::runner::{self, ExecutionLog, ProcessSpec, RunOutcome, RunReport};
use super::store::{RecordStore, ScriptStore};
use super::tracker::{ExecutionTracker, Registration};
use super::{
    parse_command_args, parse_env_vars, ExecuteRequest, ExecutionRecord, ExecutionStatus, JobPaths,
    JobsError, RecordId, RecordQuery, RecordUpdate, Script, ScriptId, NO_EXIT_CODE,
    TIMEOUT_EXIT_CODE,
};
use crate::config::OpsJobsConfig;

/// Static engine configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub paths: JobPaths,
    pub default_timeout: Duration,
}

impl EngineSettings {
    pub fn from_config(cfg: &OpsJobsConfig) -> Self {
        Self {
            paths: JobPaths::from(&cfg.storage),
            default_timeout: cfg.execution.default_timeout(),
        }
    }
}

/// Terminal result of one execution as seen by a synchronous caller.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub record_id: RecordId,
    pub script_id: ScriptId,
    pub status: ExecutionStatus,
    pub exit_code: i32,
    pub error_message: String,
    pub elapsed_ms: u64,
    pub log_path: PathBuf,
}

/// Runs scripts and owns their records for the duration of the run.
///
/// Cheap to clone; clones share the tracker and stores.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    scripts: Arc<dyn ScriptStore>,
    records: Arc<dyn RecordStore>,
    tracker: ExecutionTracker,
    settings: EngineSettings,
}

impl ExecutionEngine {
    pub fn new(
        scripts: Arc<dyn ScriptStore>,
        records: Arc<dyn RecordStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                scripts,
                records,
                tracker: ExecutionTracker::new(),
                settings,
            }),
        }
    }

    pub fn tracker(&self) -> &ExecutionTracker {
        &self.inner.tracker
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    pub fn log_path(&self, record: &ExecutionRecord) -> PathBuf {
        self.inner.settings.paths.log_path(record)
    }

    /// Start an execution in the background and return its `Running` record.
    ///
    /// Process failures are only observable by fetching the record later.
    pub async fn execute_async(&self, req: ExecuteRequest) -> Result<ExecutionRecord, JobsError> {
        let (record, script) = self.submit(&req).await?;
        let (cancel, registration) = self.track(&record);

        let engine = self.clone();
        let task_record = record.clone();
        tokio::spawn(async move {
            engine.run(task_record, script, cancel, registration).await;
        });
        Ok(record)
    }

    /// Run an execution and wait for its terminal status.
    pub async fn execute_sync(&self, req: ExecuteRequest) -> Result<ExecutionOutcome, JobsError> {
        let (record, script) = self.submit(&req).await?;
        let (cancel, registration) = self.track(&record);

        // The run owns its own task so a dropped caller cannot abandon the record.
        let engine = self.clone();
        let task_record = record.clone();
        let handle = tokio::spawn(async move {
            engine.run(task_record, script, cancel, registration).await
        });
        match handle.await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(record_id = record.id, error = %e, "execution task did not complete");
                Ok(ExecutionOutcome {
                    record_id: record.id,
                    script_id: record.script_id,
                    status: ExecutionStatus::Crashed,
                    exit_code: NO_EXIT_CODE,
                    error_message: e.to_string(),
                    elapsed_ms: 0,
                    log_path: self.log_path(&record),
                })
            }
        }
    }

    /// Cancel an in-flight execution. Unknown or finished ids are a no-op.
    pub fn cancel(&self, id: RecordId) -> bool {
        if self.inner.tracker.cancel(id) {
            info!(record_id = id, "execution cancelled");
            true
        } else {
            warn!(record_id = id, "no running execution to cancel");
            false
        }
    }

    pub async fn find_record(&self, id: RecordId) -> Result<ExecutionRecord, JobsError> {
        Ok(self.inner.records.find_record(id).await?)
    }

    pub async fn list_records(
        &self,
        query: RecordQuery,
    ) -> Result<(u64, Vec<ExecutionRecord>), JobsError> {
        Ok(self.inner.records.list_records(query).await?)
    }

    /// Validate the request and persist the record in `Running`.
    async fn submit(&self, req: &ExecuteRequest) -> Result<(ExecutionRecord, Script), JobsError> {
        req.validate()?;

        let script = self.inner.scripts.find_script(req.script_id).await?;
        if !script.enabled {
            warn!(script_id = req.script_id, "refusing to execute disabled script");
            return Err(JobsError::ScriptDisabled {
                script_id: req.script_id,
            });
        }

        let now = Utc::now();
        let mut record = ExecutionRecord {
            id: 0,
            trigger: req.trigger,
            status: ExecutionStatus::Running,
            exit_code: NO_EXIT_CODE,
            env_vars: req.env_vars.clone(),
            command_args: req.command_args.clone(),
            work_dir: req.work_dir.clone(),
            timeout_secs: req.timeout_secs,
            log_name: format!("{}.log", Uuid::new_v4()),
            error_message: String::new(),
            username: req.username.clone(),
            script_id: req.script_id,
            created_at: now,
            updated_at: now,
        };
        record.id = self.inner.records.create_record(&record).await.map_err(|e| {
            error!(script_id = req.script_id, error = %e, "failed to create execution record");
            e
        })?;

        info!(
            record_id = record.id,
            script_id = record.script_id,
            trigger = %record.trigger,
            "execution record created"
        );
        Ok((record, script))
    }

    fn track(&self, record: &ExecutionRecord) -> (CancellationToken, Registration) {
        let cancel = CancellationToken::new();
        let registration = self.inner.tracker.track(record.id, cancel.clone());
        (cancel, registration)
    }

    async fn run(
        &self,
        record: ExecutionRecord,
        script: Script,
        cancel: CancellationToken,
        registration: Registration,
    ) -> ExecutionOutcome {
        let body = self.drive(&record, &script, &cancel);
        self.run_guarded(&record, registration, body).await
    }

    /// Outermost fault boundary: run `body`, convert a panic into `Crashed`,
    /// then persist the terminal status and release the tracker entry.
    async fn run_guarded<F>(
        &self,
        record: &ExecutionRecord,
        registration: Registration,
        body: F,
    ) -> ExecutionOutcome
    where
        F: Future<Output = RecordUpdate>,
    {
        let started = Instant::now();
        let log_path = self.log_path(record);

        let update = match AssertUnwindSafe(body).catch_unwind().await {
            Ok(update) => update,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                let stack = Backtrace::force_capture();
                error!(
                    record_id = record.id,
                    error = %message,
                    stack = %stack,
                    "execution panicked"
                );
                if let Ok(mut log) = ExecutionLog::append(&log_path) {
                    log.mark("PANIC", format!("execution crashed: {message}"));
                    log.mark("STACK", &stack);
                }
                RecordUpdate {
                    status: ExecutionStatus::Crashed,
                    exit_code: NO_EXIT_CODE,
                    error_message: message,
                }
            }
        };

        self.finalize(record.id, &update, &log_path).await;
        drop(registration);

        debug!(record_id = record.id, status = %update.status, "execution finished");
        ExecutionOutcome {
            record_id: record.id,
            script_id: record.script_id,
            status: update.status,
            exit_code: update.exit_code,
            error_message: update.error_message,
            elapsed_ms: started.elapsed().as_millis() as u64,
            log_path,
        }
    }

    async fn drive(
        &self,
        record: &ExecutionRecord,
        script: &Script,
        cancel: &CancellationToken,
    ) -> RecordUpdate {
        let settings = &self.inner.settings;
        let log_path = settings.paths.log_path(record);

        let args = match parse_command_args(&record.command_args) {
            Ok(args) => args,
            Err(e) => return failed(NO_EXIT_CODE, e.to_string()),
        };
        let timeout = if record.timeout_secs > 0 {
            Duration::from_secs(record.timeout_secs as u64)
        } else {
            settings.default_timeout
        };

        let spec = ProcessSpec {
            execution_id: record.id,
            script_id: record.script_id,
            program: settings.paths.script_path(script),
            args,
            env: child_env(record, &log_path, &settings.paths.base_dir),
            work_dir: Some(record.work_dir.trim())
                .filter(|d| !d.is_empty())
                .map(PathBuf::from),
            timeout,
            log_path,
        };

        match runner::run(&spec, cancel).await {
            Ok(report) => interpret(record.id, report, timeout, cancel),
            Err(e) if e.is_log_failure() => {
                error!(record_id = record.id, error = %e, "cannot prepare execution log");
                RecordUpdate {
                    status: ExecutionStatus::Crashed,
                    exit_code: NO_EXIT_CODE,
                    error_message: e.to_string(),
                }
            }
            Err(e) => {
                warn!(record_id = record.id, error = %e, "execution could not start");
                failed(NO_EXIT_CODE, e.to_string())
            }
        }
    }

    /// Persist the terminal status. Persistence failures are logged, never raised.
    async fn finalize(&self, id: RecordId, update: &RecordUpdate, log_path: &Path) {
        match self.inner.records.update_record(id, update.clone()).await {
            Ok(()) => debug!(record_id = id, status = %update.status, "execution record finalized"),
            Err(e) => {
                error!(
                    record_id = id,
                    status = %update.status,
                    error = %e,
                    "failed to persist terminal status, record may remain running"
                );
                if let Ok(mut log) = ExecutionLog::append(log_path) {
                    log.mark("ERROR", format!("failed to update execution record: {e}"));
                }
            }
        }
    }
}

fn failed(exit_code: i32, error_message: String) -> RecordUpdate {
    RecordUpdate {
        status: ExecutionStatus::Failed,
        exit_code,
        error_message,
    }
}

fn interpret(
    id: RecordId,
    report: RunReport,
    timeout: Duration,
    cancel: &CancellationToken,
) -> RecordUpdate {
    info!(
        record_id = id,
        exit_code = report.exit_code,
        elapsed_ms = report.elapsed.as_millis() as u64,
        outcome = ?report.outcome,
        "script process finished"
    );
    match report.outcome {
        // A cancel that raced a clean exit still wins.
        RunOutcome::Succeeded if cancel.is_cancelled() => {
            failed(NO_EXIT_CODE, "execution cancelled".to_string())
        }
        RunOutcome::Succeeded => RecordUpdate {
            status: ExecutionStatus::Success,
            exit_code: 0,
            error_message: String::new(),
        },
        RunOutcome::ProcessError { exit_code, message } => failed(exit_code, message),
        RunOutcome::TimedOut => RecordUpdate {
            status: ExecutionStatus::Timeout,
            exit_code: TIMEOUT_EXIT_CODE,
            error_message: format!("execution timed out after {}s", timeout.as_secs()),
        },
        RunOutcome::Cancelled => failed(NO_EXIT_CODE, "execution cancelled".to_string()),
    }
}

/// Base environment additions followed by the record's overrides.
fn child_env(record: &ExecutionRecord, log_path: &Path, base_dir: &Path) -> Vec<(String, String)> {
    let mut env = vec![
        ("JOBS_RECORD_ID".to_string(), record.id.to_string()),
        ("JOBS_LOG_PATH".to_string(), log_path.display().to_string()),
        ("JOBS_BASE_DIR".to_string(), base_dir.display().to_string()),
    ];
    // Validated at submission; a record that no longer parses runs without overrides.
    env.extend(parse_env_vars(&record.env_vars).unwrap_or_default());
    env
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
