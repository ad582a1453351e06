//! Script execution: domain model, process runner, execution tracker and the
//! execution engine that ties them together.

pub mod engine;
pub mod runner;
pub mod scripts;
pub mod store;
pub mod tracker;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::StorageConfig;
use crate::storage::StoreError;

pub use self::engine::{ExecutionEngine, ExecutionOutcome};
pub use self::tracker::ExecutionTracker;

pub type ScriptId = u32;
pub type RecordId = u32;

/// Exit code recorded when an execution hits its deadline.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code recorded when no process exit status exists.
pub const NO_EXIT_CODE: i32 = -1;

/// Errors surfaced synchronously to callers of the jobs API.
#[derive(Debug, Error)]
pub enum JobsError {
    #[error("script {script_id} is disabled")]
    ScriptDisabled { script_id: ScriptId },

    #[error("built-in script {script_id} cannot be modified or deleted")]
    ScriptIsBuiltin { script_id: ScriptId },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid cron specification '{spec}': {reason}")]
    InvalidCron { spec: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl JobsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, JobsError::Store(StoreError::NotFound { .. }))
    }
}

// ---------------------------------------------------------------------------
// Status and trigger
// ---------------------------------------------------------------------------

/// Execution lifecycle. `Pending` and `Running` are transient, the rest terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending = 0,
    Running = 1,
    Success = 2,
    Failed = 3,
    Timeout = 4,
    Crashed = 5,
}

impl ExecutionStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Pending),
            1 => Some(Self::Running),
            2 => Some(Self::Success),
            3 => Some(Self::Failed),
            4 => Some(Self::Timeout),
            5 => Some(Self::Crashed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.code() >= 2
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Pending => write!(f, "pending"),
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Success => write!(f, "success"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Timeout => write!(f, "timeout"),
            ExecutionStatus::Crashed => write!(f, "crashed"),
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = JobsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            "timeout" => Ok(ExecutionStatus::Timeout),
            "crashed" => Ok(ExecutionStatus::Crashed),
            other => Err(JobsError::InvalidRequest(format!("unknown status '{other}'"))),
        }
    }
}

/// What started an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Api,
    Cron,
}

impl TriggerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerKind::Manual => "manual",
            TriggerKind::Api => "api",
            TriggerKind::Cron => "cron",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerKind {
    type Err = JobsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TriggerKind::Manual),
            "api" => Ok(TriggerKind::Api),
            "cron" => Ok(TriggerKind::Cron),
            other => Err(JobsError::InvalidRequest(format!(
                "unknown trigger kind '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Filesystem roots used to resolve scripts and execution logs.
#[derive(Debug, Clone)]
pub struct JobPaths {
    pub storage_dir: PathBuf,
    pub resource_dir: PathBuf,
    pub base_dir: PathBuf,
}

impl From<&StorageConfig> for JobPaths {
    fn from(cfg: &StorageConfig) -> Self {
        Self {
            storage_dir: cfg.storage_dir.clone(),
            resource_dir: cfg.resource_dir.clone(),
            base_dir: cfg.base_dir.clone(),
        }
    }
}

impl JobPaths {
    pub fn script_path(&self, script: &Script) -> PathBuf {
        if script.is_builtin {
            self.resource_dir
                .join(&script.project)
                .join("script")
                .join(&script.label)
                .join(&script.name)
        } else {
            self.storage_dir
                .join("script")
                .join(&script.project)
                .join(&script.label)
                .join(&script.name)
        }
    }

    /// Per-day directory holding the logs of records created on that day.
    pub fn log_dir(&self, created_at: &DateTime<Utc>) -> PathBuf {
        let day = created_at.with_timezone(&Local).format("%Y-%m-%d").to_string();
        self.storage_dir.join("logs").join(day)
    }

    pub fn log_path(&self, record: &ExecutionRecord) -> PathBuf {
        self.log_dir(&record.created_at).join(&record.log_name)
    }
}

// ---------------------------------------------------------------------------
// Script
// ---------------------------------------------------------------------------

/// A named executable artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Script {
    pub id: ScriptId,
    pub name: String,
    pub descr: String,
    pub project: String,
    pub label: String,
    pub language: String,
    pub enabled: bool,
    pub is_builtin: bool,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for registering a script.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewScript {
    pub name: String,
    pub descr: String,
    pub project: String,
    pub label: String,
    pub language: String,
    pub enabled: bool,
    pub is_builtin: bool,
    pub username: String,
}

// ---------------------------------------------------------------------------
// Execution record
// ---------------------------------------------------------------------------

/// One attempt to run a script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: RecordId,
    pub trigger: TriggerKind,
    pub status: ExecutionStatus,
    pub exit_code: i32,
    /// JSON object of environment overrides.
    pub env_vars: String,
    pub command_args: String,
    pub work_dir: String,
    pub timeout_secs: i64,
    pub log_name: String,
    pub error_message: String,
    pub username: String,
    pub script_id: ScriptId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Terminal fields written once when an execution finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordUpdate {
    pub status: ExecutionStatus,
    pub exit_code: i32,
    pub error_message: String,
}

/// Filters for listing execution records.
#[derive(Debug, Clone)]
pub struct RecordQuery {
    pub script_id: Option<ScriptId>,
    pub trigger: Option<TriggerKind>,
    pub status: Option<ExecutionStatus>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for RecordQuery {
    fn default() -> Self {
        Self {
            script_id: None,
            trigger: None,
            status: None,
            limit: 50,
            offset: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Execute request
// ---------------------------------------------------------------------------

/// A request to run a script once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub trigger: TriggerKind,
    pub script_id: ScriptId,
    pub command_args: String,
    pub env_vars: String,
    /// Seconds; non-positive means the configured default.
    pub timeout_secs: i64,
    pub work_dir: String,
    pub username: String,
}

impl ExecuteRequest {
    pub fn new(script_id: ScriptId, trigger: TriggerKind) -> Self {
        Self {
            trigger,
            script_id,
            command_args: String::new(),
            env_vars: String::new(),
            timeout_secs: 0,
            work_dir: String::new(),
            username: String::new(),
        }
    }

    pub fn with_args(mut self, args: impl Into<String>) -> Self {
        self.command_args = args.into();
        self
    }

    pub fn with_env(mut self, env_vars: impl Into<String>) -> Self {
        self.env_vars = env_vars.into();
        self
    }

    pub fn with_timeout(mut self, secs: i64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<String>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Reject malformed arguments or environment before anything is persisted.
    pub fn validate(&self) -> Result<(), JobsError> {
        parse_command_args(&self.command_args)?;
        parse_env_vars(&self.env_vars)?;
        Ok(())
    }
}

/// Parse serialized command-line arguments.
///
/// A JSON array of strings when the text starts with `[`, whitespace-separated
/// words otherwise.
pub fn parse_command_args(raw: &str) -> Result<Vec<String>, JobsError> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)
            .map_err(|e| JobsError::InvalidRequest(format!("command_args: {e}")))
    } else {
        Ok(trimmed.split_whitespace().map(str::to_string).collect())
    }
}

/// Parse a JSON object of environment overrides. Empty keys are dropped.
pub fn parse_env_vars(raw: &str) -> Result<Vec<(String, String)>, JobsError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let map: std::collections::BTreeMap<String, String> = serde_json::from_str(trimmed)
        .map_err(|e| JobsError::InvalidRequest(format!("env_vars: {e}")))?;
    Ok(map.into_iter().filter(|(k, _)| !k.is_empty()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip() {
        for code in 0..=5 {
            let status = ExecutionStatus::from_code(code).unwrap();
            assert_eq!(status.code() as i64, code);
        }
        assert!(ExecutionStatus::from_code(6).is_none());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Success.is_terminal());
        assert!(ExecutionStatus::Crashed.is_terminal());
    }

    #[test]
    fn test_parse_args_whitespace() {
        let args = parse_command_args("  --host  10.0.0.1 -v ").unwrap();
        assert_eq!(args, vec!["--host", "10.0.0.1", "-v"]);
        assert!(parse_command_args("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_args_json_array() {
        let args = parse_command_args(r#"["--name", "two words"]"#).unwrap();
        assert_eq!(args, vec!["--name", "two words"]);
        assert!(parse_command_args("[1, 2").is_err());
    }

    #[test]
    fn test_parse_env_vars() {
        let env = parse_env_vars(r#"{"B": "2", "A": "1", "": "skip"}"#).unwrap();
        assert_eq!(
            env,
            vec![("A".to_string(), "1".to_string()), ("B".to_string(), "2".to_string())]
        );
        assert!(parse_env_vars("").unwrap().is_empty());
        assert!(matches!(
            parse_env_vars("[1]"),
            Err(JobsError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_script_paths() {
        let paths = JobPaths {
            storage_dir: PathBuf::from("/srv/storage"),
            resource_dir: PathBuf::from("/srv/resource"),
            base_dir: PathBuf::from("/srv"),
        };
        let mut script = Script {
            id: 1,
            name: "clear_dirs.py".into(),
            descr: String::new(),
            project: "mds".into(),
            label: "slave".into(),
            language: "python".into(),
            enabled: true,
            is_builtin: false,
            username: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(
            paths.script_path(&script),
            PathBuf::from("/srv/storage/script/mds/slave/clear_dirs.py")
        );
        script.is_builtin = true;
        assert_eq!(
            paths.script_path(&script),
            PathBuf::from("/srv/resource/mds/script/slave/clear_dirs.py")
        );
    }

    #[test]
    fn test_trigger_kind_parse() {
        assert_eq!("cron".parse::<TriggerKind>().unwrap(), TriggerKind::Cron);
        assert!("webhook".parse::<TriggerKind>().is_err());
    }
}
