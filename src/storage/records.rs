//! `jobs_script_record` queries.

use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};

use super::{inserted_id, now_text, parse_ts, SqliteStore, StoreError};
use crate::jobs::store::RecordStore;
use crate::jobs::{
    ExecutionRecord, ExecutionStatus, RecordId, RecordQuery, RecordUpdate, TriggerKind,
};

const COLUMNS: &str = "id, trigger_type, status, exit_code, env_vars, command_args, work_dir, \
                       timeout, log_name, error_message, username, script_id, created_at, updated_at";

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        msg.into(),
    )
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let trigger: String = row.get(1)?;
    let status: i64 = row.get(2)?;
    Ok(ExecutionRecord {
        id: row.get(0)?,
        trigger: trigger
            .parse::<TriggerKind>()
            .map_err(|e| conversion_error(1, e.to_string()))?,
        status: ExecutionStatus::from_code(status)
            .ok_or_else(|| conversion_error(2, format!("unknown status code {status}")))?,
        exit_code: row.get(3)?,
        env_vars: row.get(4)?,
        command_args: row.get(5)?,
        work_dir: row.get(6)?,
        timeout_secs: row.get(7)?,
        log_name: row.get(8)?,
        error_message: row.get(9)?,
        username: row.get(10)?,
        script_id: row.get(11)?,
        created_at: parse_ts(12, row.get(12)?)?,
        updated_at: parse_ts(13, row.get(13)?)?,
    })
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn create_record(&self, record: &ExecutionRecord) -> Result<RecordId, StoreError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO jobs_script_record
                    (trigger_type, status, exit_code, env_vars, command_args, work_dir, timeout,
                     log_name, error_message, username, script_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    record.trigger.as_str(),
                    record.status.code(),
                    record.exit_code,
                    record.env_vars,
                    record.command_args,
                    record.work_dir,
                    record.timeout_secs,
                    record.log_name,
                    record.error_message,
                    record.username,
                    record.script_id,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )?;
            inserted_id(conn)
        })
        .await
    }

    async fn update_record(&self, id: RecordId, update: RecordUpdate) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let (_, now_s) = now_text();
            let changed = conn.execute(
                "UPDATE jobs_script_record
                    SET status = ?2, exit_code = ?3, error_message = ?4, updated_at = ?5
                  WHERE id = ?1 AND status IN (?6, ?7)",
                params![
                    id,
                    update.status.code(),
                    update.exit_code,
                    update.error_message,
                    now_s,
                    ExecutionStatus::Pending.code(),
                    ExecutionStatus::Running.code(),
                ],
            )?;
            if changed == 1 {
                return Ok(());
            }
            let exists = conn
                .query_row(
                    "SELECT 1 FROM jobs_script_record WHERE id = ?1",
                    params![id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if exists {
                Err(StoreError::Conflict {
                    entity: "record",
                    id,
                    reason: "already in a terminal status".to_string(),
                })
            } else {
                Err(StoreError::NotFound { entity: "record", id })
            }
        })
        .await
    }

    async fn find_record(&self, id: RecordId) -> Result<ExecutionRecord, StoreError> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {COLUMNS} FROM jobs_script_record WHERE id = ?1"),
                params![id],
                from_row,
            )
            .optional()?
            .ok_or(StoreError::NotFound { entity: "record", id })
        })
        .await
    }

    async fn list_records(
        &self,
        query: RecordQuery,
    ) -> Result<(u64, Vec<ExecutionRecord>), StoreError> {
        self.with_conn(move |conn| {
            let mut clauses = Vec::new();
            let mut values: Vec<Value> = Vec::new();
            if let Some(script_id) = query.script_id {
                clauses.push("script_id = ?");
                values.push(Value::Integer(script_id.into()));
            }
            if let Some(trigger) = query.trigger {
                clauses.push("trigger_type = ?");
                values.push(Value::Text(trigger.as_str().to_string()));
            }
            if let Some(status) = query.status {
                clauses.push("status = ?");
                values.push(Value::Integer(status.code().into()));
            }
            let filter = if clauses.is_empty() {
                String::new()
            } else {
                format!(" WHERE {}", clauses.join(" AND "))
            };

            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM jobs_script_record{filter}"),
                params_from_iter(values.iter()),
                |r| r.get(0),
            )?;

            values.push(Value::Integer(query.limit.into()));
            values.push(Value::Integer(query.offset.into()));
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM jobs_script_record{filter} ORDER BY id DESC LIMIT ? OFFSET ?"
            ))?;
            let records = stmt
                .query_map(params_from_iter(values.iter()), from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok((total as u64, records))
        })
        .await
    }
}
