//! `jobs_script` queries.

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, Row};

use super::{inserted_id, now_text, parse_ts, SqliteStore, StoreError};
use crate::jobs::store::{ScriptStore, ScriptUpdate};
use crate::jobs::{NewScript, Script, ScriptId};

const COLUMNS: &str = "id, name, descr, project, label, language, enabled, is_builtin, username, created_at, updated_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<Script> {
    Ok(Script {
        id: row.get(0)?,
        name: row.get(1)?,
        descr: row.get(2)?,
        project: row.get(3)?,
        label: row.get(4)?,
        language: row.get(5)?,
        enabled: row.get(6)?,
        is_builtin: row.get(7)?,
        username: row.get(8)?,
        created_at: parse_ts(9, row.get(9)?)?,
        updated_at: parse_ts(10, row.get(10)?)?,
    })
}

#[async_trait]
impl ScriptStore for SqliteStore {
    async fn create_script(&self, script: NewScript) -> Result<Script, StoreError> {
        self.with_conn(move |conn| {
            let (now, now_s) = now_text();
            conn.execute(
                "INSERT INTO jobs_script
                    (name, descr, project, label, language, enabled, is_builtin, username, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    script.name,
                    script.descr,
                    script.project,
                    script.label,
                    script.language,
                    script.enabled,
                    script.is_builtin,
                    script.username,
                    now_s
                ],
            )?;
            Ok(Script {
                id: inserted_id(conn)?,
                name: script.name,
                descr: script.descr,
                project: script.project,
                label: script.label,
                language: script.language,
                enabled: script.enabled,
                is_builtin: script.is_builtin,
                username: script.username,
                created_at: now,
                updated_at: now,
            })
        })
        .await
    }

    async fn update_script(&self, id: ScriptId, update: ScriptUpdate) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let (_, now_s) = now_text();
            let changed = conn.execute(
                "UPDATE jobs_script SET
                    descr = COALESCE(?2, descr),
                    language = COALESCE(?3, language),
                    enabled = COALESCE(?4, enabled),
                    updated_at = ?5
                 WHERE id = ?1",
                params![id, update.descr, update.language, update.enabled, now_s],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound { entity: "script", id });
            }
            Ok(())
        })
        .await
    }

    async fn delete_script(&self, id: ScriptId) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let changed = conn.execute("DELETE FROM jobs_script WHERE id = ?1", params![id])?;
            if changed == 0 {
                return Err(StoreError::NotFound { entity: "script", id });
            }
            Ok(())
        })
        .await
    }

    async fn find_script(&self, id: ScriptId) -> Result<Script, StoreError> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {COLUMNS} FROM jobs_script WHERE id = ?1"),
                params![id],
                from_row,
            )
            .optional()?
            .ok_or(StoreError::NotFound { entity: "script", id })
        })
        .await
    }

    async fn list_scripts(&self, limit: u32, offset: u32) -> Result<(u64, Vec<Script>), StoreError> {
        self.with_conn(move |conn| {
            let total: i64 = conn.query_row("SELECT COUNT(*) FROM jobs_script", [], |r| r.get(0))?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM jobs_script ORDER BY id LIMIT ?1 OFFSET ?2"
            ))?;
            let scripts = stmt
                .query_map(params![limit, offset], from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok((total as u64, scripts))
        })
        .await
    }
}
