//! Persistence seams consumed by the execution engine.

use async_trait::async_trait;

use super::{ExecutionRecord, NewScript, RecordId, RecordQuery, RecordUpdate, Script, ScriptId};
use crate::storage::StoreError;

/// Partial update of a script's mutable fields.
#[derive(Debug, Clone, Default)]
pub struct ScriptUpdate {
    pub descr: Option<String>,
    pub language: Option<String>,
    pub enabled: Option<bool>,
}

#[async_trait]
pub trait ScriptStore: Send + Sync {
    async fn create_script(&self, script: NewScript) -> Result<Script, StoreError>;
    async fn update_script(&self, id: ScriptId, update: ScriptUpdate) -> Result<(), StoreError>;
    async fn delete_script(&self, id: ScriptId) -> Result<(), StoreError>;
    async fn find_script(&self, id: ScriptId) -> Result<Script, StoreError>;
    async fn list_scripts(&self, limit: u32, offset: u32) -> Result<(u64, Vec<Script>), StoreError>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist a new record and return its assigned id.
    async fn create_record(&self, record: &ExecutionRecord) -> Result<RecordId, StoreError>;

    /// Write the terminal fields. Fails with `Conflict` if the record is
    /// already terminal.
    async fn update_record(&self, id: RecordId, update: RecordUpdate) -> Result<(), StoreError>;

    async fn find_record(&self, id: RecordId) -> Result<ExecutionRecord, StoreError>;

    async fn list_records(
        &self,
        query: RecordQuery,
    ) -> Result<(u64, Vec<ExecutionRecord>), StoreError>;
}
