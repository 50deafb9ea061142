use crate::config::AppConfig;
use crate::db::connection::DbPool;
use backup_engine::transfer::{BackupProgress, ProgressObserver, WatchObserver};
use backup_engine::{BackupResult, BackupService};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

pub struct AppState {
    pub db: DbPool,
    pub config: AppConfig,
    pub service: Arc<BackupService>,
    /// Shared by every run started through the API
    pub observer: Arc<dyn ProgressObserver>,
    pub progress: watch::Receiver<Option<BackupProgress>>,
    pub last_result: Arc<Mutex<Option<BackupResult>>>,
}

impl AppState {
    pub fn new(db: DbPool, config: AppConfig, service: Arc<BackupService>) -> Self {
        let (observer, progress) = WatchObserver::new();
        Self {
            db,
            config,
            service,
            observer: Arc::new(observer),
            progress,
            last_result: Arc::new(Mutex::new(None)),
        }
    }

    /// Latest progress snapshot of the current or last run
    pub fn latest_progress(&self) -> Option<BackupProgress> {
        self.progress.borrow().clone()
    }
}
