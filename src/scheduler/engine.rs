//! Scheduler: keeps one live cron entry per enabled schedule and runs the
//! retry loop on every fire.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::cron::{fires_after, parse_spec, Crontab, EntryId, Job};
use super::{
    NewSchedule, Schedule, ScheduleId, ScheduleQuery, ScheduleStore, ScheduleUpdate,
};
use crate::jobs::store::ScriptStore;
use crate::jobs::{
    parse_command_args, parse_env_vars, ExecutionEngine, ExecutionOutcome, ExecutionStatus,
    JobsError, ScriptId,
};

/// Upper bound on fire times listed per schedule by a preview.
const PREVIEW_LIMIT_PER_SCHEDULE: usize = 500;

/// Live cron entry cross-referenced to its schedule.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleJobInfo {
    pub entry_id: EntryId,
    /// 0 when no schedule owns the entry.
    pub schedule_id: ScheduleId,
    pub specification: String,
    pub next_run: Option<DateTime<Utc>>,
    pub prev_run: Option<DateTime<Utc>>,
}

/// One upcoming fire in a dry-run preview.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedRun {
    pub at: DateTime<Utc>,
    pub schedule_id: ScheduleId,
    pub name: String,
    pub script_id: ScriptId,
}

/// Result of one fire's retry loop.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleRunReport {
    pub schedule_id: ScheduleId,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Outcome of the last attempt that produced a record.
    pub last: Option<ExecutionOutcome>,
    /// Error of the last attempt if it was rejected before producing a record.
    pub last_error: Option<String>,
}

impl ScheduleRunReport {
    pub fn succeeded(&self) -> bool {
        self.last_error.is_none()
            && self
                .last
                .as_ref()
                .is_some_and(|o| o.status == ExecutionStatus::Success)
    }
}

/// Owns the schedule id to cron entry mapping. Obtained by construction and
/// passed around; clones share state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    schedules: Arc<dyn ScheduleStore>,
    scripts: Arc<dyn ScriptStore>,
    engine: ExecutionEngine,
    crontab: Crontab,
    live: Mutex<HashMap<ScheduleId, EntryId>>,
    /// Serializes persist-then-install sequences so the live entry always
    /// reflects the latest stored row.
    ops: tokio::sync::Mutex<()>,
    shutdown_grace: Duration,
}

impl Scheduler {
    pub fn new(
        schedules: Arc<dyn ScheduleStore>,
        scripts: Arc<dyn ScriptStore>,
        engine: ExecutionEngine,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                schedules,
                scripts,
                engine,
                crontab: Crontab::new(),
                live: Mutex::new(HashMap::new()),
                ops: tokio::sync::Mutex::new(()),
                shutdown_grace,
            }),
        }
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.inner.engine
    }

    /// Persist a schedule, then install its entry if enabled.
    pub async fn create_schedule(&self, new: NewSchedule) -> Result<Schedule, JobsError> {
        parse_spec(&new.specification)?;
        validate_defaults(&new.command_args, &new.env_vars)?;
        self.inner.scripts.find_script(new.script_id).await?;

        let _ops = self.inner.ops.lock().await;
        let schedule = self.inner.schedules.create_schedule(new).await?;
        info!(
            schedule_id = schedule.id,
            name = %schedule.name,
            spec = %schedule.specification,
            enabled = schedule.is_enabled,
            "schedule created"
        );
        self.replace_entry(&schedule)?;
        Ok(schedule)
    }

    /// Persist an update, reload it and replace the live entry.
    pub async fn update_schedule(
        &self,
        id: ScheduleId,
        update: ScheduleUpdate,
    ) -> Result<Schedule, JobsError> {
        if let Some(spec) = &update.specification {
            parse_spec(spec)?;
        }
        validate_defaults(
            update.command_args.as_deref().unwrap_or_default(),
            update.env_vars.as_deref().unwrap_or_default(),
        )?;
        if let Some(script_id) = update.script_id {
            self.inner.scripts.find_script(script_id).await?;
        }

        let _ops = self.inner.ops.lock().await;
        self.inner.schedules.update_schedule(id, update).await?;
        let schedule = self.inner.schedules.find_schedule(id).await?;
        info!(
            schedule_id = id,
            spec = %schedule.specification,
            enabled = schedule.is_enabled,
            "schedule updated"
        );
        self.replace_entry(&schedule)?;
        Ok(schedule)
    }

    /// Delete a schedule, then remove its live entry.
    pub async fn delete_schedule(&self, id: ScheduleId) -> Result<(), JobsError> {
        let _ops = self.inner.ops.lock().await;
        self.inner.schedules.delete_schedule(id).await?;
        self.remove_entry(id);
        info!(schedule_id = id, "schedule deleted");
        Ok(())
    }

    /// Re-read a schedule and replace its live entry from the stored state.
    pub async fn reload_schedule(&self, id: ScheduleId) -> Result<Option<EntryId>, JobsError> {
        let _ops = self.inner.ops.lock().await;
        match self.inner.schedules.find_schedule(id).await {
            Ok(schedule) => self.replace_entry(&schedule),
            Err(e) => {
                self.remove_entry(id);
                Err(e.into())
            }
        }
    }

    pub async fn find_schedule(&self, id: ScheduleId) -> Result<Schedule, JobsError> {
        Ok(self.inner.schedules.find_schedule(id).await?)
    }

    pub async fn list_schedules(
        &self,
        query: ScheduleQuery,
    ) -> Result<(u64, Vec<Schedule>), JobsError> {
        Ok(self.inner.schedules.list_schedules(query).await?)
    }

    /// Install entries for every enabled schedule. Schedules whose stored
    /// specification no longer parses are skipped with a warning.
    pub async fn load_enabled(&self) -> Result<usize, JobsError> {
        let _ops = self.inner.ops.lock().await;
        let mut installed = 0;
        for schedule in self.enabled_schedules().await? {
            match self.replace_entry(&schedule) {
                Ok(Some(_)) => installed += 1,
                Ok(None) => {}
                Err(e) => warn!(schedule_id = schedule.id, error = %e, "skipping schedule"),
            }
        }
        info!(count = installed, "scheduled jobs loaded");
        Ok(installed)
    }

    /// Live cron entries with their owning schedule ids.
    pub fn list_schedule_jobs(&self) -> Vec<ScheduleJobInfo> {
        let owners: HashMap<EntryId, ScheduleId> = self
            .live()
            .iter()
            .map(|(schedule_id, entry_id)| (*entry_id, *schedule_id))
            .collect();
        self.inner
            .crontab
            .entries()
            .into_iter()
            .map(|entry| ScheduleJobInfo {
                entry_id: entry.id,
                schedule_id: owners.get(&entry.id).copied().unwrap_or(0),
                specification: entry.spec,
                next_run: entry.next,
                prev_run: entry.prev,
            })
            .collect()
    }

    /// Upcoming fires of enabled schedules within the next `hours`.
    pub async fn preview_next_runs(&self, hours: u64) -> Result<Vec<PlannedRun>, JobsError> {
        let now = Utc::now();
        let end = now + chrono::Duration::hours(hours.min(24 * 366) as i64);
        let mut preview = Vec::new();

        for schedule in self.enabled_schedules().await? {
            let Ok(cron) = parse_spec(&schedule.specification) else {
                continue;
            };
            for at in fires_after(&cron, now)
                .take_while(|at| *at <= end)
                .take(PREVIEW_LIMIT_PER_SCHEDULE)
            {
                preview.push(PlannedRun {
                    at,
                    schedule_id: schedule.id,
                    name: schedule.name.clone(),
                    script_id: schedule.script_id,
                });
            }
        }

        preview.sort_by(|a, b| a.at.cmp(&b.at).then(a.schedule_id.cmp(&b.schedule_id)));
        Ok(preview)
    }

    /// Run one fire of `schedule` immediately, retry loop included.
    pub async fn run_schedule_once(&self, schedule: &Schedule) -> ScheduleRunReport {
        run_fire(&self.inner.engine, schedule).await
    }

    /// Stop firing and wait for in-flight fires up to the configured grace.
    pub async fn shutdown(&self) -> bool {
        self.live().clear();
        self.inner.crontab.stop(self.inner.shutdown_grace).await
    }

    async fn enabled_schedules(&self) -> Result<Vec<Schedule>, JobsError> {
        let mut out = Vec::new();
        let mut query = ScheduleQuery {
            enabled: Some(true),
            limit: 200,
            offset: 0,
        };
        loop {
            let (total, page) = self.inner.schedules.list_schedules(query.clone()).await?;
            let fetched = page.len() as u32;
            out.extend(page);
            query.offset += fetched;
            if fetched == 0 || u64::from(query.offset) >= total {
                break;
            }
        }
        Ok(out)
    }

    /// Remove the schedule's entry and install a fresh one if it is enabled.
    /// The mapping lock is held across both steps so concurrent callers can
    /// never leave two entries for one schedule.
    fn replace_entry(&self, schedule: &Schedule) -> Result<Option<EntryId>, JobsError> {
        let mut live = self.live();
        if let Some(old) = live.remove(&schedule.id) {
            self.inner.crontab.remove(old);
            debug!(schedule_id = schedule.id, entry_id = old, "old cron entry removed");
        }
        if !schedule.is_enabled {
            return Ok(None);
        }

        let entry = self
            .inner
            .crontab
            .add(&schedule.specification, self.fire_job(schedule.clone()))?;
        live.insert(schedule.id, entry);
        debug!(
            schedule_id = schedule.id,
            entry_id = entry,
            spec = %schedule.specification,
            "cron entry installed"
        );
        Ok(Some(entry))
    }

    fn remove_entry(&self, id: ScheduleId) {
        if let Some(entry) = self.live().remove(&id) {
            self.inner.crontab.remove(entry);
            debug!(schedule_id = id, entry_id = entry, "cron entry removed");
        }
    }

    fn fire_job(&self, schedule: Schedule) -> Job {
        let engine = self.inner.engine.clone();
        let schedule = Arc::new(schedule);
        Arc::new(move || {
            let engine = engine.clone();
            let schedule = schedule.clone();
            async move {
                run_fire(&engine, &schedule).await;
            }
            .boxed()
        })
    }

    fn live(&self) -> MutexGuard<'_, HashMap<ScheduleId, EntryId>> {
        self.inner.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn validate_defaults(command_args: &str, env_vars: &str) -> Result<(), JobsError> {
    parse_command_args(command_args)?;
    parse_env_vars(env_vars)?;
    Ok(())
}

/// Attempts are strictly sequential. A long timeout times the retry count can
/// delay the schedule's next fire; the cron entry skips instants it missed.
async fn run_fire(engine: &ExecutionEngine, schedule: &Schedule) -> ScheduleRunReport {
    let max_attempts = schedule.max_attempts();
    let mut report = ScheduleRunReport {
        schedule_id: schedule.id,
        attempts: 0,
        max_attempts,
        last: None,
        last_error: None,
    };

    for attempt in 1..=max_attempts {
        report.attempts = attempt;
        match engine.execute_sync(schedule.to_execute_request()).await {
            Ok(outcome) => {
                info!(
                    schedule_id = schedule.id,
                    record_id = outcome.record_id,
                    attempt,
                    max_attempts,
                    status = %outcome.status,
                    "scheduled execution finished"
                );
                let success = outcome.status == ExecutionStatus::Success;
                report.last = Some(outcome);
                report.last_error = None;
                if success {
                    return report;
                }
            }
            Err(e) => {
                warn!(
                    schedule_id = schedule.id,
                    attempt,
                    max_attempts,
                    error = %e,
                    "scheduled execution rejected"
                );
                report.last_error = Some(e.to_string());
            }
        }

        if attempt < max_attempts {
            tokio::time::sleep(schedule.retry_interval()).await;
        }
    }

    error!(
        schedule_id = schedule.id,
        attempts = report.attempts,
        max_attempts,
        record_id = report.last.as_ref().map(|o| o.record_id),
        "scheduled execution failed after all attempts"
    );
    report
}
