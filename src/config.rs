//! TOML configuration for the opsjobs daemon and CLI.
//!
//! Layered model: an explicit path, then the `OPSJOBS_CONFIG` environment
//! variable, then the standard system location, then compiled-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming an alternate configuration file.
pub const CONFIG_ENV: &str = "OPSJOBS_CONFIG";

/// Standard system location of the configuration file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/opsjobs/opsjobs.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpsJobsConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl OpsJobsConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Resolve the configuration.
    ///
    /// An explicit path must load; the environment and system locations fall
    /// through to the next layer. Nothing is logged here since resolution
    /// runs before the subscriber exists; call [`ResolvedConfig::log`] once
    /// tracing is up.
    pub fn resolve(explicit: Option<&Path>) -> Result<ResolvedConfig> {
        if let Some(path) = explicit {
            return Ok(ResolvedConfig {
                config: Self::load(path)?,
                source: Some(path.to_path_buf()),
                skipped: Vec::new(),
            });
        }
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        Ok(Self::load_or_default(env_path.as_deref(), Path::new(SYSTEM_CONFIG_PATH)))
    }

    /// Try `env_path`, then `system_path` if it exists, then defaults.
    pub fn load_or_default(env_path: Option<&Path>, system_path: &Path) -> ResolvedConfig {
        let mut skipped = Vec::new();
        let candidates = env_path
            .into_iter()
            .chain(system_path.exists().then_some(system_path));
        for path in candidates {
            match Self::load(path) {
                Ok(config) => {
                    return ResolvedConfig {
                        config,
                        source: Some(path.to_path_buf()),
                        skipped,
                    }
                }
                Err(e) => skipped.push((path.to_path_buf(), format!("{e:#}"))),
            }
        }
        ResolvedConfig {
            config: Self::default(),
            source: None,
            skipped,
        }
    }
}

/// A resolved configuration and the layers that were passed over.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: OpsJobsConfig,
    /// File the configuration came from; `None` for compiled-in defaults.
    pub source: Option<PathBuf>,
    /// Files that existed or were named but failed to load.
    pub skipped: Vec<(PathBuf, String)>,
}

impl ResolvedConfig {
    pub fn log(&self) {
        for (path, error) in &self.skipped {
            warn!(
                path = %path.display(),
                error = %error,
                "config file could not be loaded, trying fallback"
            );
        }
        match &self.source {
            Some(path) => info!(path = %path.display(), "loaded opsjobs configuration"),
            None => debug!("no config file found, using compiled-in defaults"),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Database and filesystem locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file.
    pub database_path: PathBuf,
    /// Root for uploaded scripts and execution logs.
    pub storage_dir: PathBuf,
    /// Root for scripts shipped with the platform (built-ins).
    pub resource_dir: PathBuf,
    /// Exported to scripts as `JOBS_BASE_DIR`.
    pub base_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/opsjobs.db"),
            storage_dir: PathBuf::from("data/storage"),
            resource_dir: PathBuf::from("resource"),
            base_dir: PathBuf::from("."),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Process execution defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Timeout applied when a request carries a non-positive one.
    pub default_timeout_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 300,
        }
    }
}

impl ExecutionConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Cron scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Whether `serve` installs cron entries for enabled schedules.
    pub enabled: bool,
    /// How long shutdown waits for in-flight fires.
    pub shutdown_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            shutdown_timeout_secs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = OpsJobsConfig::default();
        assert_eq!(cfg.execution.default_timeout_secs, 300);
        assert_eq!(cfg.scheduler.shutdown_timeout_secs, 30);
        assert!(cfg.scheduler.enabled);
        assert_eq!(cfg.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg: OpsJobsConfig = toml::from_str(
            r#"
            [storage]
            storage_dir = "/srv/opsjobs"

            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.storage.storage_dir, PathBuf::from("/srv/opsjobs"));
        assert_eq!(cfg.storage.database_path, PathBuf::from("data/opsjobs.db"));
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(cfg.execution.default_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opsjobs.toml");
        std::fs::write(&path, "[execution]\ndefault_timeout_secs = 42\n").unwrap();
        let resolved = OpsJobsConfig::resolve(Some(&path)).unwrap();
        assert_eq!(resolved.config.execution.default_timeout_secs, 42);
        assert_eq!(resolved.source.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(OpsJobsConfig::resolve(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn test_broken_env_file_falls_back_and_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "[execution\n").unwrap();
        let system = dir.path().join("system.toml");
        std::fs::write(&system, "[scheduler]\nenabled = false\n").unwrap();

        let resolved = OpsJobsConfig::load_or_default(Some(&broken), &system);
        assert!(!resolved.config.scheduler.enabled);
        assert_eq!(resolved.source.as_deref(), Some(system.as_path()));
        assert_eq!(resolved.skipped.len(), 1);
        assert_eq!(resolved.skipped[0].0, broken);
        assert!(resolved.skipped[0].1.contains("failed to parse config file"));

        let defaults = OpsJobsConfig::load_or_default(None, &dir.path().join("absent.toml"));
        assert!(defaults.source.is_none());
        assert!(defaults.skipped.is_empty());
        assert!(defaults.config.scheduler.enabled);
    }
}
