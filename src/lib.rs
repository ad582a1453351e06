//! opsjobs -- script execution and cron scheduling for cluster operations.
//!
//! This crate provides the execution engine (process runner, execution
//! tracker, terminal-status finalization), the cron scheduler with retries,
//! and the SQLite stores both persist to.

pub mod config;
pub mod jobs;
pub mod scheduler;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::OpsJobsConfig;
use crate::jobs::engine::EngineSettings;
use crate::jobs::scripts::ScriptService;
use crate::jobs::ExecutionEngine;
use crate::scheduler::Scheduler;
use crate::storage::SqliteStore;

/// Wired-up services sharing one store.
#[derive(Clone)]
pub struct OpsJobs {
    pub store: SqliteStore,
    pub scripts: ScriptService,
    pub engine: ExecutionEngine,
    pub scheduler: Scheduler,
}

impl OpsJobs {
    pub fn open(cfg: &OpsJobsConfig) -> Result<Self> {
        let db_path = &cfg.storage.database_path;
        tracing::info!(db_path = %db_path.display(), "Initializing database");
        let pool = storage::open_pool(db_path)
            .with_context(|| format!("opening database {}", db_path.display()))?;
        let store = SqliteStore::new(pool);
        let shared = Arc::new(store.clone());

        let engine = ExecutionEngine::new(
            shared.clone(),
            shared.clone(),
            EngineSettings::from_config(cfg),
        );
        let scheduler = Scheduler::new(
            shared.clone(),
            shared.clone(),
            engine.clone(),
            Duration::from_secs(cfg.scheduler.shutdown_timeout_secs),
        );

        Ok(Self {
            store,
            scripts: ScriptService::new(shared),
            engine,
            scheduler,
        })
    }
}

/// Start the opsjobs daemon: load enabled schedules and fire them until
/// interrupted, then drain in-flight fires.
pub async fn serve(cfg: &OpsJobsConfig) -> Result<()> {
    let app = OpsJobs::open(cfg)?;

    if cfg.scheduler.enabled {
        let count = app.scheduler.load_enabled().await?;
        tracing::info!(schedules = count, "Scheduler started");
    } else {
        tracing::warn!("Scheduler disabled by configuration");
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("Shutdown requested");

    if !app.scheduler.shutdown().await {
        tracing::warn!(
            in_flight = app.engine.tracker().len(),
            "Exiting with executions still running"
        );
    }
    Ok(())
}
