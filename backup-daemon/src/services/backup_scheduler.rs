use crate::state::AppState;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

/// Periodically hands due schedules to the engine.
/// Next-run times live in the engine; the cron job only decides how often to look.
pub struct BackupScheduler {
    scheduler: Mutex<JobScheduler>,
    state: Arc<AppState>,
}

impl BackupScheduler {
    pub async fn new(state: Arc<AppState>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            state,
        })
    }

    pub async fn init_tick(&self) -> anyhow::Result<()> {
        let cron_expression = self.state.config.schedule_tick.clone();
        let state = self.state.clone();

        let job = Job::new_async(cron_expression.as_str(), move |_uuid, _lock| {
            let state = state.clone();
            Box::pin(async move {
                run_due(&state).await;
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(cron = %cron_expression, "Schedule tick registered");
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}

/// One tick: run every due schedule in turn
pub async fn run_due(state: &AppState) {
    if state.service.is_backup_in_progress() {
        tracing::debug!("Skipping schedule tick: a run is active");
        return;
    }
    match state.service.run_due_schedules(Utc::now()).await {
        Ok(ran) if !ran.is_empty() => tracing::info!(count = ran.len(), "Scheduled backups processed"),
        Ok(_) => {}
        Err(e) => tracing::error!(error = %e, "Schedule tick failed"),
    }
}
