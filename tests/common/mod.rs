//! Shared fixtures: a throwaway storage tree, SQLite store and wired services.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use opsjobs::jobs::engine::EngineSettings;
use opsjobs::jobs::store::ScriptStore;
use opsjobs::jobs::{ExecutionEngine, JobPaths, NewScript, Script};
use opsjobs::scheduler::Scheduler;
use opsjobs::storage::{open_pool, SqliteStore};

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub store: SqliteStore,
    pub paths: JobPaths,
    pub engine: ExecutionEngine,
    pub scheduler: Scheduler,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let paths = JobPaths {
            storage_dir: dir.path().join("storage"),
            resource_dir: dir.path().join("resource"),
            base_dir: dir.path().to_path_buf(),
        };
        let store = SqliteStore::new(open_pool(dir.path().join("opsjobs.db")).unwrap());
        let shared = Arc::new(store.clone());
        let engine = ExecutionEngine::new(
            shared.clone(),
            shared.clone(),
            EngineSettings {
                paths: paths.clone(),
                default_timeout: Duration::from_secs(30),
            },
        );
        let scheduler = Scheduler::new(
            shared.clone(),
            shared,
            engine.clone(),
            Duration::from_secs(10),
        );
        Self {
            dir,
            store,
            paths,
            engine,
            scheduler,
        }
    }

    /// Register a user script and write its body to the resolved path.
    pub async fn script(&self, name: &str, body: &str) -> Script {
        let script = self
            .store
            .create_script(NewScript {
                name: name.into(),
                project: "ops".into(),
                label: "test".into(),
                language: "shell".into(),
                enabled: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let path = self.paths.script_path(&script);
        write_executable(&path, body);
        script
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

pub fn write_executable(path: &std::path::Path, body: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}
