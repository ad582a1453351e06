//! Execution engine behaviour against real `/bin/sh` scripts.

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use opsjobs::jobs::engine::EngineSettings;
use opsjobs::jobs::scripts::ScriptService;
use opsjobs::jobs::store::{RecordStore, ScriptStore, ScriptUpdate};
use opsjobs::jobs::{
    ExecuteRequest, ExecutionEngine, ExecutionRecord, ExecutionStatus, JobsError, RecordId,
    RecordQuery, RecordUpdate, TriggerKind,
};
use opsjobs::storage::{SqliteStore, StoreError};

use common::Harness;

async fn wait_terminal(engine: &ExecutionEngine, id: RecordId) -> ExecutionRecord {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let record = engine.find_record(id).await.unwrap();
        if record.status.is_terminal() {
            return record;
        }
        assert!(Instant::now() < deadline, "record {id} never finalized");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn record_count(engine: &ExecutionEngine) -> u64 {
    engine.list_records(RecordQuery::default()).await.unwrap().0
}

#[tokio::test]
async fn test_sync_success_writes_output_and_env() {
    let h = Harness::new();
    let script = h
        .script(
            "hello.sh",
            r#"echo "id=$JOBS_RECORD_ID region=$REGION args=$*""#,
        )
        .await;

    let outcome = h
        .engine
        .execute_sync(
            ExecuteRequest::new(script.id, TriggerKind::Api)
                .with_args(r#"["--zone", "a b"]"#)
                .with_env(r#"{"REGION": "sh"}"#),
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Success);
    assert_eq!(outcome.exit_code, 0);

    let record = h.engine.find_record(outcome.record_id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Success);
    assert_eq!(record.trigger, TriggerKind::Api);

    let log = std::fs::read_to_string(&outcome.log_path).unwrap();
    assert!(log.contains(&format!("id={} region=sh args=--zone a b", record.id)), "{log}");
    assert!(log.contains("[INFO] started execution"));
    assert!(log.contains("[INFO] succeeded"));
    assert!(h.engine.tracker().is_empty());
}

#[tokio::test]
async fn test_non_zero_exit_is_failed() {
    let h = Harness::new();
    let script = h.script("fail.sh", "echo oops >&2; exit 3").await;

    let outcome = h
        .engine
        .execute_sync(ExecuteRequest::new(script.id, TriggerKind::Manual))
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert_eq!(outcome.exit_code, 3);
    let record = h.engine.find_record(outcome.record_id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.exit_code, 3);
    assert!(std::fs::read_to_string(&outcome.log_path).unwrap().contains("oops"));
}

#[tokio::test]
async fn test_script_with_history_can_be_deleted() {
    let h = Harness::new();
    let script = h.script("once.sh", "exit 0").await;
    let outcome = h
        .engine
        .execute_sync(ExecuteRequest::new(script.id, TriggerKind::Manual))
        .await
        .unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Success);

    let scripts = ScriptService::new(Arc::new(h.store.clone()));
    scripts.delete(script.id).await.unwrap();

    assert!(scripts.find(script.id).await.unwrap_err().is_not_found());
    assert!(h
        .engine
        .find_record(outcome.record_id)
        .await
        .unwrap_err()
        .is_not_found());
    assert_eq!(record_count(&h.engine).await, 0);
}

#[tokio::test]
async fn test_timeout_terminates_promptly() {
    let h = Harness::new();
    let script = h.script("slow.sh", "sleep 5").await;

    let started = Instant::now();
    let outcome = h
        .engine
        .execute_sync(ExecuteRequest::new(script.id, TriggerKind::Api).with_timeout(1))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(outcome.status, ExecutionStatus::Timeout);
    assert_eq!(outcome.exit_code, 124);
    assert!(elapsed >= Duration::from_millis(900), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
    assert_eq!(
        h.engine.find_record(outcome.record_id).await.unwrap().status,
        ExecutionStatus::Timeout
    );
}

#[tokio::test]
async fn test_async_cancel_then_second_cancel_is_noop() {
    let h = Harness::new();
    let script = h.script("long.sh", "sleep 30").await;

    let record = h
        .engine
        .execute_async(ExecuteRequest::new(script.id, TriggerKind::Api))
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Running);

    // Let the process start before cancelling.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.engine.cancel(record.id));

    let finished = wait_terminal(&h.engine, record.id).await;
    assert_eq!(finished.status, ExecutionStatus::Failed);
    assert_eq!(finished.error_message, "execution cancelled");
    assert_eq!(finished.exit_code, -1);

    assert!(!h.engine.cancel(record.id));
    assert_eq!(
        h.engine.find_record(record.id).await.unwrap().status,
        ExecutionStatus::Failed
    );
}

#[tokio::test]
async fn test_cancel_before_process_start_is_honoured() {
    let h = Harness::new();
    let script = h.script("long.sh", "sleep 30").await;

    let record = h
        .engine
        .execute_async(ExecuteRequest::new(script.id, TriggerKind::Api))
        .await
        .unwrap();
    // Registered before execute_async returns.
    assert!(h.engine.cancel(record.id));

    let finished = wait_terminal(&h.engine, record.id).await;
    assert_eq!(finished.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_cancel_unknown_id_is_noop() {
    let h = Harness::new();
    assert!(!h.engine.cancel(4242));
}

#[tokio::test]
async fn test_no_record_left_running_and_no_tracker_leak() {
    let h = Harness::new();
    let script = h.script("ok.sh", "exit 0").await;

    let outcome = h
        .engine
        .execute_sync(ExecuteRequest::new(script.id, TriggerKind::Api))
        .await
        .unwrap();

    let record = h.engine.find_record(outcome.record_id).await.unwrap();
    assert!(record.status.is_terminal());
    assert!(h.engine.tracker().lookup(outcome.record_id).is_none());
    assert!(!h.engine.cancel(outcome.record_id));
}

#[tokio::test]
async fn test_disabled_script_rejected_without_record() {
    let h = Harness::new();
    let script = h.script("off.sh", "exit 0").await;
    h.store
        .update_script(
            script.id,
            ScriptUpdate {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let result = h
        .engine
        .execute_sync(ExecuteRequest::new(script.id, TriggerKind::Api))
        .await;
    assert!(matches!(result, Err(JobsError::ScriptDisabled { .. })));

    let result = h
        .engine
        .execute_async(ExecuteRequest::new(script.id, TriggerKind::Api))
        .await;
    assert!(matches!(result, Err(JobsError::ScriptDisabled { .. })));
    assert_eq!(record_count(&h.engine).await, 0);
}

#[tokio::test]
async fn test_invalid_requests_rejected_without_record() {
    let h = Harness::new();
    let script = h.script("ok.sh", "exit 0").await;

    let unknown = h
        .engine
        .execute_sync(ExecuteRequest::new(999, TriggerKind::Api))
        .await;
    assert!(unknown.unwrap_err().is_not_found());

    let bad_env = h
        .engine
        .execute_sync(ExecuteRequest::new(script.id, TriggerKind::Api).with_env("not json"))
        .await;
    assert!(matches!(bad_env, Err(JobsError::InvalidRequest(_))));

    let bad_args = h
        .engine
        .execute_sync(ExecuteRequest::new(script.id, TriggerKind::Api).with_args("[\"open"))
        .await;
    assert!(matches!(bad_args, Err(JobsError::InvalidRequest(_))));

    assert_eq!(record_count(&h.engine).await, 0);
}

#[tokio::test]
async fn test_missing_script_file_is_failed() {
    let h = Harness::new();
    let script = h.script("gone.sh", "exit 0").await;
    std::fs::remove_file(h.paths.script_path(&script)).unwrap();

    let outcome = h
        .engine
        .execute_sync(ExecuteRequest::new(script.id, TriggerKind::Api))
        .await
        .unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert_eq!(outcome.exit_code, -1);
    assert!(outcome.error_message.contains("gone.sh"));
}

#[tokio::test]
async fn test_unwritable_log_dir_is_crashed() {
    let h = Harness::new();
    let script = h.script("ok.sh", "exit 0").await;
    // A regular file where the logs directory belongs.
    std::fs::write(h.paths.storage_dir.join("logs"), b"").unwrap();

    let outcome = h
        .engine
        .execute_sync(ExecuteRequest::new(script.id, TriggerKind::Api))
        .await
        .unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Crashed);
    let record = h.engine.find_record(outcome.record_id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Crashed);
    assert!(!record.error_message.is_empty());
    assert!(h.engine.tracker().is_empty());
}

#[tokio::test]
async fn test_work_dir_created_and_used() {
    let h = Harness::new();
    let script = h.script("pwd.sh", r#"pwd > "$JOBS_BASE_DIR/pwd.txt""#).await;
    let work_dir = h.file("work/nested");

    let outcome = h
        .engine
        .execute_sync(
            ExecuteRequest::new(script.id, TriggerKind::Api)
                .with_work_dir(work_dir.display().to_string()),
        )
        .await
        .unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Success);
    assert!(work_dir.is_dir());

    let recorded = std::fs::read_to_string(h.file("pwd.txt")).unwrap();
    let expected = work_dir.canonicalize().unwrap();
    assert_eq!(std::path::Path::new(recorded.trim()).canonicalize().unwrap(), expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_executions_are_independent() {
    let h = Harness::new();
    let script = h.script("nap.sh", "sleep 0.3; echo done").await;

    let started = Instant::now();
    let runs = (0..6).map(|_| {
        let engine = h.engine.clone();
        let id = script.id;
        tokio::spawn(async move {
            engine
                .execute_sync(ExecuteRequest::new(id, TriggerKind::Api))
                .await
                .unwrap()
        })
    });
    let outcomes = futures::future::join_all(runs).await;

    assert!(started.elapsed() < Duration::from_secs(3));
    for outcome in outcomes {
        assert_eq!(outcome.unwrap().status, ExecutionStatus::Success);
    }
    let (total, records) = h.engine.list_records(RecordQuery::default()).await.unwrap();
    assert_eq!(total, 6);
    assert!(records.iter().all(|r| r.status == ExecutionStatus::Success));
    assert!(h.engine.tracker().is_empty());
}

/// Record store whose terminal update always fails.
struct UnavailableOnFinalize(SqliteStore);

#[async_trait]
impl RecordStore for UnavailableOnFinalize {
    async fn create_record(&self, record: &ExecutionRecord) -> Result<RecordId, StoreError> {
        self.0.create_record(record).await
    }

    async fn update_record(&self, _id: RecordId, _update: RecordUpdate) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("database is gone".into()))
    }

    async fn find_record(&self, id: RecordId) -> Result<ExecutionRecord, StoreError> {
        self.0.find_record(id).await
    }

    async fn list_records(
        &self,
        query: RecordQuery,
    ) -> Result<(u64, Vec<ExecutionRecord>), StoreError> {
        self.0.list_records(query).await
    }
}

#[tokio::test]
async fn test_finalize_tolerates_unavailable_store() {
    let h = Harness::new();
    let script = h.script("ok.sh", "exit 0").await;
    let engine = ExecutionEngine::new(
        Arc::new(h.store.clone()),
        Arc::new(UnavailableOnFinalize(h.store.clone())),
        EngineSettings {
            paths: h.paths.clone(),
            default_timeout: Duration::from_secs(5),
        },
    );

    let outcome = engine
        .execute_sync(ExecuteRequest::new(script.id, TriggerKind::Api))
        .await
        .unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Success);
    assert!(engine.tracker().is_empty());
    // Known risk: the record stays Running when finalization cannot persist.
    assert_eq!(
        engine.find_record(outcome.record_id).await.unwrap().status,
        ExecutionStatus::Running
    );
    let log = std::fs::read_to_string(&outcome.log_path).unwrap();
    assert!(log.contains("failed to update execution record"), "{log}");
}
