//! Schedule persistence.

use super::BackupSchedule;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::Mutex;
use uuid::Uuid;

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<BackupSchedule>>;

    /// Insert or replace the schedule with the same id
    async fn upsert(&self, schedule: &BackupSchedule) -> Result<()>;

    /// `false` when no schedule had that id
    async fn remove(&self, id: Uuid) -> Result<bool>;
}

/// All schedules in one JSON file, rewritten on every change
pub struct JsonScheduleStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonScheduleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read(&self) -> Result<Vec<BackupSchedule>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, schedules: &[BackupSchedule]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp, serde_json::to_vec_pretty(schedules)?).await?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| EngineError::Schedule(format!("cannot replace {}: {}", self.path.display(), e)))
    }
}

#[async_trait]
impl ScheduleStore for JsonScheduleStore {
    async fn load_all(&self) -> Result<Vec<BackupSchedule>> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    async fn upsert(&self, schedule: &BackupSchedule) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut schedules = self.read().await?;
        match schedules.iter_mut().find(|s| s.id == schedule.id) {
            Some(existing) => *existing = schedule.clone(),
            None => schedules.push(schedule.clone()),
        }
        self.write(&schedules).await
    }

    async fn remove(&self, id: Uuid) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut schedules = self.read().await?;
        let before = schedules.len();
        schedules.retain(|s| s.id != id);
        if schedules.len() == before {
            return Ok(false);
        }
        self.write(&schedules).await?;
        Ok(true)
    }
}
