//! Cron-driven schedules: the persisted model, its store seam, the in-process
//! cron trigger and the scheduler that keeps them in sync.

pub mod cron;
pub mod engine;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jobs::{ExecuteRequest, ScriptId, TriggerKind};
use crate::storage::StoreError;

pub use self::engine::{PlannedRun, ScheduleJobInfo, ScheduleRunReport, Scheduler};

pub type ScheduleId = u32;

/// A named recurring trigger for one script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub name: String,
    pub specification: String,
    pub is_enabled: bool,
    pub env_vars: String,
    pub command_args: String,
    pub work_dir: String,
    pub timeout_secs: i64,
    pub is_retry: bool,
    pub retry_interval_secs: u64,
    pub max_retries: u32,
    pub username: String,
    pub script_id: ScriptId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// Execution request built from this schedule's stored defaults.
    pub fn to_execute_request(&self) -> ExecuteRequest {
        ExecuteRequest::new(self.script_id, TriggerKind::Cron)
            .with_args(self.command_args.clone())
            .with_env(self.env_vars.clone())
            .with_timeout(self.timeout_secs)
            .with_work_dir(self.work_dir.clone())
            .with_username(self.username.clone())
    }

    /// Total attempts per fire: one plus `max_retries` when retrying is on.
    pub fn max_attempts(&self) -> u32 {
        if self.is_retry && self.max_retries > 0 {
            self.max_retries.saturating_add(1)
        } else {
            1
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

/// Fields for creating a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSchedule {
    pub name: String,
    pub specification: String,
    pub is_enabled: bool,
    pub env_vars: String,
    pub command_args: String,
    pub work_dir: String,
    pub timeout_secs: i64,
    pub is_retry: bool,
    pub retry_interval_secs: u64,
    pub max_retries: u32,
    pub username: String,
    pub script_id: ScriptId,
}

impl NewSchedule {
    pub fn new(
        name: impl Into<String>,
        specification: impl Into<String>,
        script_id: ScriptId,
    ) -> Self {
        Self {
            name: name.into(),
            specification: specification.into(),
            is_enabled: true,
            env_vars: String::new(),
            command_args: String::new(),
            work_dir: String::new(),
            timeout_secs: 300,
            is_retry: false,
            retry_interval_secs: 60,
            max_retries: 3,
            username: String::new(),
            script_id,
        }
    }
}

/// Partial update of a schedule. `None` leaves the stored value alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleUpdate {
    pub name: Option<String>,
    pub specification: Option<String>,
    pub is_enabled: Option<bool>,
    pub env_vars: Option<String>,
    pub command_args: Option<String>,
    pub work_dir: Option<String>,
    pub timeout_secs: Option<i64>,
    pub is_retry: Option<bool>,
    pub retry_interval_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub script_id: Option<ScriptId>,
}

#[derive(Debug, Clone)]
pub struct ScheduleQuery {
    pub enabled: Option<bool>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for ScheduleQuery {
    fn default() -> Self {
        Self {
            enabled: None,
            limit: 50,
            offset: 0,
        }
    }
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn create_schedule(&self, schedule: NewSchedule) -> Result<Schedule, StoreError>;
    async fn update_schedule(
        &self,
        id: ScheduleId,
        update: ScheduleUpdate,
    ) -> Result<(), StoreError>;
    async fn delete_schedule(&self, id: ScheduleId) -> Result<(), StoreError>;
    async fn find_schedule(&self, id: ScheduleId) -> Result<Schedule, StoreError>;
    async fn list_schedules(
        &self,
        query: ScheduleQuery,
    ) -> Result<(u64, Vec<Schedule>), StoreError>;
}
