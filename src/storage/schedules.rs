//! `jobs_schedule` queries.

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, Row};

use super::{inserted_id, now_text, parse_ts, SqliteStore, StoreError};
use crate::scheduler::{
    NewSchedule, Schedule, ScheduleId, ScheduleQuery, ScheduleStore, ScheduleUpdate,
};

const COLUMNS: &str = "id, name, specification, is_enabled, env_vars, command_args, work_dir, \
                       timeout, is_retry, retry_interval, max_retries, username, script_id, \
                       created_at, updated_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<Schedule> {
    let retry_interval: i64 = row.get(9)?;
    let max_retries: i64 = row.get(10)?;
    Ok(Schedule {
        id: row.get(0)?,
        name: row.get(1)?,
        specification: row.get(2)?,
        is_enabled: row.get(3)?,
        env_vars: row.get(4)?,
        command_args: row.get(5)?,
        work_dir: row.get(6)?,
        timeout_secs: row.get(7)?,
        is_retry: row.get(8)?,
        retry_interval_secs: retry_interval.max(0) as u64,
        max_retries: max_retries.clamp(0, u32::MAX as i64) as u32,
        username: row.get(11)?,
        script_id: row.get(12)?,
        created_at: parse_ts(13, row.get(13)?)?,
        updated_at: parse_ts(14, row.get(14)?)?,
    })
}

#[async_trait]
impl ScheduleStore for SqliteStore {
    async fn create_schedule(&self, schedule: NewSchedule) -> Result<Schedule, StoreError> {
        self.with_conn(move |conn| {
            let (now, now_s) = now_text();
            conn.execute(
                "INSERT INTO jobs_schedule
                    (name, specification, is_enabled, env_vars, command_args, work_dir, timeout,
                     is_retry, retry_interval, max_retries, username, script_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
                params![
                    schedule.name,
                    schedule.specification,
                    schedule.is_enabled,
                    schedule.env_vars,
                    schedule.command_args,
                    schedule.work_dir,
                    schedule.timeout_secs,
                    schedule.is_retry,
                    schedule.retry_interval_secs as i64,
                    schedule.max_retries as i64,
                    schedule.username,
                    schedule.script_id,
                    now_s,
                ],
            )?;
            Ok(Schedule {
                id: inserted_id(conn)?,
                name: schedule.name,
                specification: schedule.specification,
                is_enabled: schedule.is_enabled,
                env_vars: schedule.env_vars,
                command_args: schedule.command_args,
                work_dir: schedule.work_dir,
                timeout_secs: schedule.timeout_secs,
                is_retry: schedule.is_retry,
                retry_interval_secs: schedule.retry_interval_secs,
                max_retries: schedule.max_retries,
                username: schedule.username,
                script_id: schedule.script_id,
                created_at: now,
                updated_at: now,
            })
        })
        .await
    }

    async fn update_schedule(
        &self,
        id: ScheduleId,
        update: ScheduleUpdate,
    ) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let (_, now_s) = now_text();
            let changed = conn.execute(
                "UPDATE jobs_schedule SET
                    name = COALESCE(?2, name),
                    specification = COALESCE(?3, specification),
                    is_enabled = COALESCE(?4, is_enabled),
                    env_vars = COALESCE(?5, env_vars),
                    command_args = COALESCE(?6, command_args),
                    work_dir = COALESCE(?7, work_dir),
                    timeout = COALESCE(?8, timeout),
                    is_retry = COALESCE(?9, is_retry),
                    retry_interval = COALESCE(?10, retry_interval),
                    max_retries = COALESCE(?11, max_retries),
                    script_id = COALESCE(?12, script_id),
                    updated_at = ?13
                 WHERE id = ?1",
                params![
                    id,
                    update.name,
                    update.specification,
                    update.is_enabled,
                    update.env_vars,
                    update.command_args,
                    update.work_dir,
                    update.timeout_secs,
                    update.is_retry,
                    update.retry_interval_secs.map(|v| v as i64),
                    update.max_retries.map(i64::from),
                    update.script_id,
                    now_s,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound { entity: "schedule", id });
            }
            Ok(())
        })
        .await
    }

    async fn delete_schedule(&self, id: ScheduleId) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let changed = conn.execute("DELETE FROM jobs_schedule WHERE id = ?1", params![id])?;
            if changed == 0 {
                return Err(StoreError::NotFound { entity: "schedule", id });
            }
            Ok(())
        })
        .await
    }

    async fn find_schedule(&self, id: ScheduleId) -> Result<Schedule, StoreError> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {COLUMNS} FROM jobs_schedule WHERE id = ?1"),
                params![id],
                from_row,
            )
            .optional()?
            .ok_or(StoreError::NotFound { entity: "schedule", id })
        })
        .await
    }

    async fn list_schedules(
        &self,
        query: ScheduleQuery,
    ) -> Result<(u64, Vec<Schedule>), StoreError> {
        self.with_conn(move |conn| {
            // -1 matches every row, 0/1 match the flag.
            let enabled: i64 = match query.enabled {
                None => -1,
                Some(flag) => flag as i64,
            };
            let total: i64 = conn.query_row(
                "SELECT COUNT(*) FROM jobs_schedule WHERE (?1 = -1 OR is_enabled = ?1)",
                params![enabled],
                |r| r.get(0),
            )?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM jobs_schedule
                  WHERE (?1 = -1 OR is_enabled = ?1)
                  ORDER BY id LIMIT ?2 OFFSET ?3"
            ))?;
            let schedules = stmt
                .query_map(params![enabled, query.limit, query.offset], from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok((total as u64, schedules))
        })
        .await
    }
}
