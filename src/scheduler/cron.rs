//! In-process cron trigger.
//!
//! Each entry runs on its own task that sleeps until the next fire time and
//! then awaits its job to completion, so fires of one entry never overlap.
//! Removing an entry stops future fires but never aborts one in flight.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use cron::Schedule as CronSchedule;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::jobs::JobsError;

pub type EntryId = u64;

/// Callback run on every fire.
pub type Job = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("invalid cron specification '{spec}': {reason}")]
    InvalidSpec { spec: String, reason: String },

    #[error("cron trigger is stopped")]
    Stopped,
}

impl From<CronError> for JobsError {
    fn from(err: CronError) -> Self {
        match err {
            CronError::InvalidSpec { spec, reason } => JobsError::InvalidCron { spec, reason },
            CronError::Stopped => JobsError::InvalidRequest(err.to_string()),
        }
    }
}

/// Parse a cron specification. Standard 5-field specs fire at second 0 and
/// number the day of week 0-6 from Sunday, with 7 also meaning Sunday.
pub fn parse_spec(spec: &str) -> Result<CronSchedule, CronError> {
    let trimmed = spec.trim();
    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    let normalized = if fields.len() == 5 {
        let dow = weekday_names(fields[4]).unwrap_or_else(|| fields[4].to_string());
        format!("0 {} {}", fields[..4].join(" "), dow)
    } else {
        trimmed.to_string()
    };
    CronSchedule::from_str(&normalized).map_err(|e| CronError::InvalidSpec {
        spec: spec.to_string(),
        reason: e.to_string(),
    })
}

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];
const WEEKDAY_FULL_NAMES: [&str; 7] = [
    "sunday",
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
];

/// Rewrite a standard day-of-week field as an explicit list of day names,
/// which the `cron` crate reads independently of its own 1-7 numbering.
/// Returns `None` for `*`, `?` and anything malformed; those are passed
/// through and left to the parser.
fn weekday_names(field: &str) -> Option<String> {
    if field == "*" || field == "?" {
        return None;
    }
    let mut days = [false; 7];
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, step.parse::<usize>().ok().filter(|s| *s > 0)?),
            None => (item, 1),
        };
        let (start, end) = match range.split_once('-') {
            _ if range == "*" || range == "?" => (0, 6),
            Some((a, b)) => (weekday_number(a)?, weekday_number(b)?),
            // "N/step" runs to the end of the week.
            None if item.contains('/') => (weekday_number(range)?, 6),
            None => {
                let day = weekday_number(range)?;
                (day, day)
            }
        };
        if start > end {
            return None;
        }
        for day in (start..=end).step_by(step) {
            days[day % 7] = true;
        }
    }
    let names: Vec<&str> = WEEKDAYS
        .iter()
        .zip(days)
        .filter_map(|(name, set)| set.then_some(*name))
        .collect();
    Some(names.join(","))
}

fn weekday_number(token: &str) -> Option<usize> {
    if let Ok(n) = token.parse::<usize>() {
        return (n <= 7).then_some(n);
    }
    WEEKDAYS.iter().zip(WEEKDAY_FULL_NAMES).position(|(short, full)| {
        short.eq_ignore_ascii_case(token) || full.eq_ignore_ascii_case(token)
    })
}

/// First fire strictly after `from`. Specs are read in local time.
pub fn next_fire(schedule: &CronSchedule, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    fires_after(schedule, from).next()
}

/// Fires strictly after `from`, evaluated in local time and reported in UTC.
pub fn fires_after(
    schedule: &CronSchedule,
    from: DateTime<Utc>,
) -> impl Iterator<Item = DateTime<Utc>> + '_ {
    schedule
        .after(&from.with_timezone(&Local))
        .map(|at| at.with_timezone(&Utc))
}

/// Snapshot of one live entry.
#[derive(Debug, Clone, Serialize)]
pub struct CronEntry {
    pub id: EntryId,
    pub spec: String,
    pub next: Option<DateTime<Utc>>,
    pub prev: Option<DateTime<Utc>>,
}

struct EntryState {
    spec: String,
    next: Option<DateTime<Utc>>,
    prev: Option<DateTime<Utc>>,
    stop: CancellationToken,
}

#[derive(Default)]
struct Entries {
    next_id: EntryId,
    map: HashMap<EntryId, EntryState>,
}

/// Handle to the cron trigger. Clones share the same entries.
#[derive(Clone)]
pub struct Crontab {
    entries: Arc<Mutex<Entries>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Default for Crontab {
    fn default() -> Self {
        Self::new()
    }
}

impl Crontab {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Entries::default())),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Install `job` under `spec` and start firing it.
    pub fn add(&self, spec: &str, job: Job) -> Result<EntryId, CronError> {
        if self.shutdown.is_cancelled() {
            return Err(CronError::Stopped);
        }
        let schedule = parse_spec(spec)?;
        let stop = self.shutdown.child_token();

        let id = {
            let mut entries = self.lock();
            entries.next_id += 1;
            let id = entries.next_id;
            entries.map.insert(
                id,
                EntryState {
                    spec: spec.to_string(),
                    next: next_fire(&schedule, Utc::now()),
                    prev: None,
                    stop: stop.clone(),
                },
            );
            id
        };

        let crontab = self.clone();
        self.tasks
            .spawn(async move { crontab.drive(id, schedule, job, stop).await });
        debug!(entry_id = id, spec, "cron entry added");
        Ok(id)
    }

    /// Stop future fires of `id`. Returns whether the entry existed.
    pub fn remove(&self, id: EntryId) -> bool {
        match self.lock().map.remove(&id) {
            Some(state) => {
                state.stop.cancel();
                debug!(entry_id = id, spec = %state.spec, "cron entry removed");
                true
            }
            None => false,
        }
    }

    pub fn entries(&self) -> Vec<CronEntry> {
        let mut out: Vec<CronEntry> = self
            .lock()
            .map
            .iter()
            .map(|(id, state)| CronEntry {
                id: *id,
                spec: state.spec.clone(),
                next: state.next,
                prev: state.prev,
            })
            .collect();
        out.sort_by_key(|e| e.id);
        out
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop all entries and wait up to `grace` for in-flight fires to finish.
    /// Returns `false` if fires were still running when the grace expired.
    pub async fn stop(&self, grace: Duration) -> bool {
        self.shutdown.cancel();
        self.lock().map.clear();
        self.tasks.close();
        match tokio::time::timeout(grace, self.tasks.wait()).await {
            Ok(()) => {
                info!("cron trigger stopped");
                true
            }
            Err(_) => {
                warn!(
                    in_flight = self.tasks.len(),
                    grace_secs = grace.as_secs(),
                    "cron fires still running after shutdown grace"
                );
                false
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn drive(self, id: EntryId, schedule: CronSchedule, job: Job, stop: CancellationToken) {
        let mut last_fire: Option<DateTime<Utc>> = None;
        loop {
            // Never fire the same instant twice, and skip instants missed while busy.
            let from = match last_fire {
                Some(last) => last.max(Utc::now()),
                None => Utc::now(),
            };
            let Some(next) = next_fire(&schedule, from) else {
                debug!(entry_id = id, "cron entry has no further fire times");
                break;
            };
            self.update(id, |state| state.next = Some(next));

            let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            last_fire = Some(next);
            self.update(id, |state| state.prev = Some(next));
            debug!(entry_id = id, fire = %next, "cron entry fired");

            if AssertUnwindSafe(job()).catch_unwind().await.is_err() {
                error!(entry_id = id, "cron job panicked");
            }
        }
    }

    fn update(&self, id: EntryId, f: impl FnOnce(&mut EntryState)) {
        if let Some(state) = self.lock().map.get_mut(&id) {
            f(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike, Weekday};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_job(counter: Arc<AtomicUsize>) -> Job {
        Arc::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    #[test]
    fn test_parse_spec_accepts_five_and_six_fields() {
        assert!(parse_spec("*/5 * * * *").is_ok());
        assert!(parse_spec("0 30 4 * * *").is_ok());
        assert!(parse_spec("@daily").is_ok());
        assert!(matches!(
            parse_spec("not a cron"),
            Err(CronError::InvalidSpec { .. })
        ));
    }

    #[test]
    fn test_five_field_fires_on_second_zero() {
        let schedule = parse_spec("* * * * *").unwrap();
        let next = schedule.upcoming(Utc).next().unwrap();
        assert_eq!(next.timestamp() % 60, 0);
    }

    #[test]
    fn test_five_field_sunday_is_zero_or_seven() {
        for spec in ["* * * * 0", "0 4 * * 0", "0 4 * * 7", "0 4 * * sun"] {
            let schedule = parse_spec(spec).unwrap();
            for at in schedule.upcoming(Utc).take(5) {
                assert_eq!(at.weekday(), Weekday::Sun, "{spec}");
            }
        }
    }

    #[test]
    fn test_five_field_weekday_range() {
        let schedule = parse_spec("0 9 * * 1-5").unwrap();
        let days: Vec<Weekday> = schedule.upcoming(Utc).take(10).map(|at| at.weekday()).collect();
        assert!(days.iter().all(|d| !matches!(d, Weekday::Sat | Weekday::Sun)), "{days:?}");
        assert!(days.contains(&Weekday::Fri), "{days:?}");
        assert!(days.contains(&Weekday::Mon), "{days:?}");
    }

    #[test]
    fn test_weekday_field_rewrite() {
        assert_eq!(weekday_names("1-5").as_deref(), Some("MON,TUE,WED,THU,FRI"));
        assert_eq!(weekday_names("5-7").as_deref(), Some("SUN,FRI,SAT"));
        assert_eq!(weekday_names("*/2").as_deref(), Some("SUN,TUE,THU,SAT"));
        assert_eq!(weekday_names("3/2").as_deref(), Some("WED,FRI"));
        assert_eq!(weekday_names("0,6").as_deref(), Some("SUN,SAT"));
        assert_eq!(weekday_names("Mon-Wed").as_deref(), Some("MON,TUE,WED"));
        assert_eq!(weekday_names("*"), None);
        assert_eq!(weekday_names("8"), None);
        assert!(parse_spec("0 4 * * 8").is_err());
    }

    #[test]
    fn test_fire_times_follow_local_clock() {
        let schedule = parse_spec("0 3 * * *").unwrap();
        let now = Utc::now();
        let next = next_fire(&schedule, now).unwrap();
        assert!(next > now);
        let local = next.with_timezone(&Local);
        assert_eq!((local.hour(), local.minute(), local.second()), (3, 0, 0));
        assert!(next - now <= chrono::Duration::hours(25));
    }

    #[tokio::test]
    async fn test_entry_fires_and_stops_after_remove() {
        let crontab = Crontab::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = crontab
            .add("* * * * * *", counting_job(counter.clone()))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let fired = counter.load(Ordering::SeqCst);
        assert!(fired >= 1, "expected at least one fire, got {fired}");
        assert!(crontab.entries()[0].prev.is_some());

        assert!(crontab.remove(id));
        assert!(!crontab.remove(id));
        let after_remove = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after_remove);
        assert!(crontab.is_empty());
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_fire() {
        let crontab = Crontab::new();
        let finished = Arc::new(AtomicUsize::new(0));
        let done = finished.clone();
        let job: Job = Arc::new(move || {
            let done = done.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(800)).await;
                done.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        });
        crontab.add("* * * * * *", job).unwrap();

        // Wait until a fire is in flight.
        while crontab.entries()[0].prev.is_none() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(crontab.stop(Duration::from_secs(5)).await);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(matches!(
            crontab.add("* * * * *", counting_job(Arc::new(AtomicUsize::new(0)))),
            Err(CronError::Stopped)
        ));
    }
}
