//! Scheduler: recurring jobs, their next run times and last outcomes.
//!
//! Schedules are kept in memory and written through to a [`ScheduleStore`].
//! Triggering is left to the caller (CLI `schedule run-due`, daemon tick),
//! which hands due jobs to the orchestrator and reports back through
//! [`Scheduler::record_run`].

pub mod next_run;
pub mod store;

pub use next_run::{compute_next_run, compute_next_run_in, parse_time_of_day};
pub use store::{JsonScheduleStore, ScheduleStore};

use crate::job::BackupJob;
use crate::result::{BackupResult, BackupStatus};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

const NOTIFY_TARGET: &str = "backup_engine::notify";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Once,
    Daily,
    Weekly,
    Monthly,
    Custom,
}

/// Outcome of the last triggered run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRunSummary {
    pub status: BackupStatus,
    pub success: bool,
    pub message: String,
    pub processed_files: usize,
    pub failed_files: usize,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_id: Option<String>,
}

impl ScheduleRunSummary {
    pub fn from_result(result: &BackupResult) -> Self {
        Self {
            status: result.status,
            success: result.success,
            message: result.message.clone(),
            processed_files: result.processed_files,
            failed_files: result.failed_files,
            finished_at: result.finished_at,
            archive_id: result.archive.as_ref().map(|a| a.id.clone()),
        }
    }

    fn from_error(err: &EngineError, at: DateTime<Utc>) -> Self {
        Self {
            status: BackupStatus::Failed,
            success: false,
            message: err.to_string(),
            processed_files: 0,
            failed_files: 0,
            finished_at: at,
            archive_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSchedule {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub job: BackupJob,
    pub frequency: Frequency,
    /// Local wall time
    pub time_of_day: NaiveTime,
    #[serde(default)]
    pub day_of_week: Option<Weekday>,
    #[serde(default)]
    pub day_of_month: Option<u32>,
    /// First day a `Once` schedule runs on
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    /// Period of `Custom` schedules
    #[serde(default)]
    pub interval_minutes: Option<u32>,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_result: Option<ScheduleRunSummary>,
    #[serde(default)]
    pub notify_on_success: bool,
    #[serde(default = "default_enabled")]
    pub notify_on_failure: bool,
}

fn default_enabled() -> bool {
    true
}

impl BackupSchedule {
    pub fn new(name: impl Into<String>, job: BackupJob, frequency: Frequency, time_of_day: NaiveTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            enabled: true,
            job,
            frequency,
            time_of_day,
            day_of_week: None,
            day_of_month: None,
            start_date: None,
            interval_minutes: None,
            next_run: None,
            last_run: None,
            last_result: None,
            notify_on_success: false,
            notify_on_failure: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Schedule("name is required".into()));
        }
        if let Some(day) = self.day_of_month {
            if !(1..=31).contains(&day) {
                return Err(EngineError::Schedule(format!("day_of_month {} is out of range", day)));
            }
        }
        if self.frequency == Frequency::Custom && self.interval_minutes.map_or(true, |m| m == 0) {
            return Err(EngineError::Schedule("custom schedules need interval_minutes".into()));
        }
        self.job.validate()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run.is_some_and(|next| next <= now)
    }
}

pub struct Scheduler {
    store: Arc<dyn ScheduleStore>,
    schedules: Mutex<BTreeMap<Uuid, BackupSchedule>>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn ScheduleStore>) -> Self {
        Self {
            store,
            schedules: Mutex::new(BTreeMap::new()),
        }
    }

    /// Load persisted schedules, filling in missing next run times
    pub async fn load(&self) -> Result<usize> {
        let loaded = self.store.load_all().await?;
        let now = Utc::now();
        let mut schedules = self.schedules.lock().await;
        schedules.clear();

        for mut schedule in loaded {
            if schedule.enabled && schedule.next_run.is_none() && schedule.last_run.is_none() {
                schedule.next_run = compute_next_run(&schedule, now);
                self.store.upsert(&schedule).await?;
            }
            schedules.insert(schedule.id, schedule);
        }
        info!(count = schedules.len(), "Schedules loaded");
        Ok(schedules.len())
    }

    /// Add or replace a schedule; its next run is recomputed
    pub async fn add(&self, mut schedule: BackupSchedule) -> Result<BackupSchedule> {
        schedule.validate()?;
        schedule.next_run = if schedule.enabled {
            compute_next_run(&schedule, Utc::now())
        } else {
            None
        };

        self.store.upsert(&schedule).await?;
        info!(schedule = %schedule.name, next_run = ?schedule.next_run, "Schedule saved");
        self.schedules.lock().await.insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    pub async fn remove(&self, id: Uuid) -> Result<bool> {
        let removed = self.store.remove(id).await?;
        let cached = self.schedules.lock().await.remove(&id).is_some();
        if removed || cached {
            info!(schedule_id = %id, "Schedule removed");
        }
        Ok(removed || cached)
    }

    pub async fn list(&self) -> Vec<BackupSchedule> {
        self.schedules.lock().await.values().cloned().collect()
    }

    /// Enabled schedules whose next run is at or before `now`
    pub async fn due(&self, now: DateTime<Utc>) -> Vec<BackupSchedule> {
        self.schedules
            .lock()
            .await
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect()
    }

    /// Record the outcome of a triggered run and advance the schedule.
    /// A run refused with `JobAlreadyRunning` leaves the schedule due.
    pub async fn record_run(
        &self,
        id: Uuid,
        outcome: &std::result::Result<BackupResult, EngineError>,
        now: DateTime<Utc>,
    ) -> Result<Option<BackupSchedule>> {
        let mut schedules = self.schedules.lock().await;
        let Some(schedule) = schedules.get_mut(&id) else {
            return Ok(None);
        };

        let summary = match outcome {
            Err(EngineError::JobAlreadyRunning) => {
                info!(schedule = %schedule.name, "Another run is active, retrying on the next tick");
                return Ok(Some(schedule.clone()));
            }
            Ok(result) => ScheduleRunSummary::from_result(result),
            Err(e) => ScheduleRunSummary::from_error(e, now),
        };

        notify(schedule, &summary);
        schedule.last_run = Some(now);
        schedule.last_result = Some(summary);
        schedule.next_run = compute_next_run(schedule, now);
        if schedule.frequency == Frequency::Once {
            schedule.enabled = false;
        }

        self.store.upsert(schedule).await?;
        Ok(Some(schedule.clone()))
    }
}

fn notify(schedule: &BackupSchedule, summary: &ScheduleRunSummary) {
    if summary.success && schedule.notify_on_success {
        info!(
            target: NOTIFY_TARGET,
            schedule = %schedule.name,
            status = ?summary.status,
            files = summary.processed_files,
            "Scheduled backup succeeded: {}",
            summary.message
        );
    } else if !summary.success && schedule.notify_on_failure {
        warn!(
            target: NOTIFY_TARGET,
            schedule = %schedule.name,
            status = ?summary.status,
            failed = summary.failed_files,
            "Scheduled backup failed: {}",
            summary.message
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn scheduler(dir: &TempDir) -> Scheduler {
        Scheduler::new(Arc::new(JsonScheduleStore::new(dir.path().join("schedules.json"))))
    }

    fn schedule(frequency: Frequency) -> BackupSchedule {
        let job = BackupJob::new("docs", vec![PathBuf::from("/data")], "/backups");
        BackupSchedule::new("docs nightly", job, frequency, NaiveTime::from_hms_opt(1, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn test_add_computes_next_run_and_persists() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let added = scheduler(&dir).add(schedule(Frequency::Daily)).await?;
        assert!(added.next_run.is_some_and(|t| t > Utc::now()));

        let reloaded = scheduler(&dir);
        assert_eq!(reloaded.load().await?, 1);
        assert_eq!(reloaded.list().await[0].next_run, added.next_run);
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_schedule_rejected() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let mut custom = schedule(Frequency::Custom);
        custom.interval_minutes = None;
        assert!(matches!(scheduler(&dir).add(custom).await, Err(EngineError::Schedule(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_already_running_keeps_schedule_due() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let scheduler = scheduler(&dir);
        let added = scheduler.add(schedule(Frequency::Daily)).await?;
        let when = added.next_run.unwrap() + Duration::seconds(1);
        assert_eq!(scheduler.due(when).await.len(), 1);

        let outcome = Err(EngineError::JobAlreadyRunning);
        scheduler.record_run(added.id, &outcome, when).await?;
        assert_eq!(scheduler.due(when).await.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_record_run_advances_and_disables_once() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let scheduler = scheduler(&dir);
        let daily = scheduler.add(schedule(Frequency::Daily)).await?;
        let once = scheduler.add(schedule(Frequency::Once)).await?;
        let when = once.next_run.unwrap().max(daily.next_run.unwrap()) + Duration::seconds(1);

        let result = BackupResult::started().finish(BackupStatus::Completed, "ok");
        let daily = scheduler.record_run(daily.id, &Ok(result.clone()), when).await?.unwrap();
        assert!(daily.next_run.is_some_and(|t| t > when));
        assert!(daily.last_result.as_ref().is_some_and(|r| r.success));

        let once = scheduler.record_run(once.id, &Ok(result), when).await?.unwrap();
        assert!(!once.enabled);
        assert!(once.next_run.is_none());
        assert!(scheduler.due(when + Duration::days(2)).await.is_empty());
        Ok(())
    }
}
