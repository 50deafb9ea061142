//! BackupService: the façade that sequences one backup, restore or image run.
//!
//! Only one backup or restore may be active at a time. A second request fails
//! with `JobAlreadyRunning`. Operations that refuse before doing any work
//! (busy, invalid job, broken chain, wrong password, no imager) return `Err`.
//! Once a run has started its outcome is always a [`BackupResult`], fatal
//! failures included.

mod run_guard;
#[cfg(test)]
mod tests;

pub use run_guard::{RunKind, RunStatus};

use crate::config::EngineConfig;
use crate::crypto::{DerivedKey, EncryptionInfo};
use crate::executor::codec::FrameCodec;
use crate::executor::manifest::{BackupManifest, META_REQUESTED_TYPE};
use crate::executor::strategy::{self, BackupStrategy};
use crate::executor::writer::{ArchiveSink, PackWriter, TreeWriter};
use crate::executor::{BackupExecutor, TransferItem};
use crate::fs::drives::{self, DriveInfo, DriveSpace};
use crate::fs::snapshot::{provider_from_config, SnapshotHandle, SnapshotProvider};
use crate::fs::walker::{Enumerator, FileInfo, WalkOptions};
use crate::image::{self, CommandImager, ImageOutcome, SystemImager};
use crate::job::{BackupCompression, BackupJob, BackupType};
use crate::restore::{self, RestoreOptions};
use crate::result::{BackupError, BackupErrorKind, BackupResult, BackupStatus};
use crate::retention;
use crate::schedule::{BackupSchedule, JsonScheduleStore, ScheduleStore, Scheduler};
use crate::store::{self, ArchiveStore, BackupArchive};
use crate::transfer::observer::ProgressObserver;
use crate::transfer::progress::{format_bytes, ProgressPhase, ProgressTracker};
use crate::utils::errors::{EngineError, Result};
use crate::verify;
use chrono::{DateTime, Utc};
use run_guard::{ActiveSlot, RunGuard};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct BackupService {
    config: EngineConfig,
    store: ArchiveStore,
    snapshots: Arc<dyn SnapshotProvider>,
    imager: Option<Arc<dyn SystemImager>>,
    scheduler: Scheduler,
    active: ActiveSlot,
}

impl BackupService {
    /// Service with the providers named in `config` and a JSON schedule file
    pub fn new(config: EngineConfig) -> Self {
        let snapshots = provider_from_config(&config.snapshot);
        let imager = CommandImager::from_config(&config.imaging).map(|i| Arc::new(i) as Arc<dyn SystemImager>);
        let schedules: Arc<dyn ScheduleStore> = Arc::new(JsonScheduleStore::new(config.engine.schedule_file.clone()));
        Self {
            config,
            store: ArchiveStore::new(),
            snapshots,
            imager,
            scheduler: Scheduler::new(schedules),
            active: ActiveSlot::default(),
        }
    }

    pub fn with_snapshot_provider(mut self, provider: Arc<dyn SnapshotProvider>) -> Self {
        self.snapshots = provider;
        self
    }

    pub fn with_imager(mut self, imager: Arc<dyn SystemImager>) -> Self {
        self.imager = Some(imager);
        self
    }

    pub fn with_schedule_store(mut self, store: Arc<dyn ScheduleStore>) -> Self {
        self.scheduler = Scheduler::new(store);
        self
    }

    /// Load persisted schedules
    pub async fn init(&self) -> Result<()> {
        self.scheduler.load().await?;
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &ArchiveStore {
        &self.store
    }

    // ── Status ──

    pub fn is_backup_in_progress(&self) -> bool {
        self.active.is_busy()
    }

    pub fn current_run(&self) -> Option<RunStatus> {
        self.active.status()
    }

    /// Cancel the active run; `false` when nothing is running
    pub fn cancel_active(&self) -> bool {
        self.active.cancel()
    }

    // ── Backup ──

    pub async fn create_backup(
        &self,
        job: &BackupJob,
        observer: Option<Arc<dyn ProgressObserver>>,
        cancel: Option<CancellationToken>,
    ) -> Result<BackupResult> {
        job.validate()?;
        let guard = self.active.acquire(RunKind::Backup, &job.name, cancel)?;
        Ok(self.run_backup(job, observer, &guard).await)
    }

    /// Start a backup in the background. Fails immediately when a run is active.
    pub fn spawn_backup(
        self: &Arc<Self>,
        job: BackupJob,
        observer: Option<Arc<dyn ProgressObserver>>,
    ) -> Result<(CancellationToken, JoinHandle<BackupResult>)> {
        job.validate()?;
        let guard = self.active.acquire(RunKind::Backup, &job.name, None)?;
        let token = guard.token().clone();
        let service = Arc::clone(self);
        let handle = tokio::spawn(async move { service.run_backup(&job, observer, &guard).await });
        Ok((token, handle))
    }

    async fn run_backup(
        &self,
        job: &BackupJob,
        observer: Option<Arc<dyn ProgressObserver>>,
        guard: &RunGuard,
    ) -> BackupResult {
        let mut result = BackupResult::started();
        info!(job = %job.name, backup_type = %job.backup_type, "Backup started");

        let outcome = if job.backup_type == BackupType::SystemImage {
            self.capture_image(&job.destination_path, job, observer, guard.token(), &mut result)
                .await
        } else {
            self.capture_files(job, observer, guard.token(), &mut result).await
        };

        let result = match outcome {
            Ok((status, message)) => result.finish(status, message),
            Err(e) => {
                error!(job = %job.name, "Backup failed: {}", e);
                result.fail(&e)
            }
        };
        info!(job = %job.name, status = ?result.status, "{}", result.summary(5));
        result
    }

    async fn capture_files(
        &self,
        job: &BackupJob,
        observer: Option<Arc<dyn ProgressObserver>>,
        cancel: &CancellationToken,
        result: &mut BackupResult,
    ) -> Result<(BackupStatus, String)> {
        let destination = job.destination_path.clone();
        let mut tracker = self.tracker(observer.clone());
        tracker.phase(ProgressPhase::Preparing, format!("Preparing {}", job.name));

        tokio::fs::create_dir_all(&destination)
            .await
            .map_err(|e| EngineError::destination(&destination, e))?;

        let mirror = job.backup_type == BackupType::Mirror;
        if mirror && job.encrypt {
            result.warnings.push(BackupError::new(
                BackupErrorKind::Write,
                Some(&destination),
                "mirror trees are stored as plain files; encryption was not applied",
            ));
        }

        let encryption = if job.encrypt && !mirror {
            let password = job
                .password
                .clone()
                .ok_or_else(|| EngineError::InvalidJob("encryption requires a password".into()))?;
            let kdf = self.config.encryption.clone();
            let (info, key) = tokio::task::spawn_blocking(move || EncryptionInfo::create(&password, &kdf)).await??;
            Some((info, Arc::new(key)))
        } else {
            None
        };

        let snapshot = self.acquire_snapshot(job, result).await?;
        if cancel.is_cancelled() {
            return Ok((BackupStatus::Cancelled, "Cancelled before scanning".into()));
        }

        // Scanning
        tracker.phase(ProgressPhase::Scanning, format!("Scanning {} source paths", job.source_paths.len()));
        let (files, scan_warnings, tracker) = scan(job, tracker).await?;
        result.warnings.extend(scan_warnings);
        if cancel.is_cancelled() {
            return Ok((BackupStatus::Cancelled, "Cancelled after scanning".into()));
        }

        let plan = strategy::plan(&self.store, job).await?;
        result.warnings.extend(plan.warnings.iter().cloned());
        let source_set: HashSet<String> = if mirror {
            files.iter().map(|f| f.relative_path.clone()).collect()
        } else {
            HashSet::new()
        };
        let changes = plan.strategy.select(files, plan.baseline.as_ref());

        result.total_files = changes.selected.len() + changes.unchanged_files;
        result.total_bytes = changes.selected_bytes() + changes.unchanged_bytes;
        result.skipped_files = changes.unchanged_files;
        result.skipped_bytes = changes.unchanged_bytes;
        self.check_free_space(&destination, changes.selected_bytes(), result);

        // Transfer
        let id = new_archive_id();
        let sink_path = if mirror {
            store::mirror_root(&destination, &job.name)
        } else {
            store::partial_payload_path(&destination, &id)
        };
        let sink = if mirror {
            TreeWriter::new(&sink_path).map(ArchiveSink::Tree)
        } else {
            PackWriter::create(&sink_path).map(ArchiveSink::Packed)
        }
        .map_err(|e| EngineError::destination(&sink_path, e))?;

        let codec = match (&encryption, mirror) {
            (_, true) => FrameCodec::identity(),
            (Some((_, key)), false) => FrameCodec::new(job.compression.zstd_level(), Some(key.clone())),
            (None, false) => FrameCodec::new(job.compression.zstd_level(), None),
        };

        let items: Vec<TransferItem> = changes
            .selected
            .into_iter()
            .map(|info| TransferItem {
                read_path: snapshot.map(&info.path),
                info,
            })
            .collect();

        let mut tracker = tracker;
        tracker.phase(ProgressPhase::Transferring, format!("Backing up {}", job.name));
        tracker.set_totals(items.len(), items.iter().map(|i| i.info.size).sum());

        let executor = BackupExecutor::new(self.config.transfer.clone(), codec, cancel.clone());
        let (outcome, mut sink, _tracker) = executor.execute(items, sink, tracker).await?;
        if let Err(e) = snapshot.release() {
            warn!(job = %job.name, "Failed to release snapshot: {}", e);
        }

        if let Some(fatal) = outcome.fatal {
            if !mirror {
                let _ = tokio::fs::remove_file(&sink_path).await;
            }
            return Err(fatal);
        }
        sink.finish().map_err(|e| EngineError::destination(&sink_path, e))?;

        result.processed_files = outcome.entries.len();
        result.processed_bytes = outcome.entries.iter().map(|e| e.size).sum();
        result.failed_files = outcome.errors.len();
        result.errors.extend(outcome.errors);
        let cancelled = outcome.cancelled;

        if !cancelled {
            result
                .warnings
                .extend(plan.strategy.post_transfer(&sink_path, &source_set));
        }

        let status = BackupStatus::from_counts(result.processed_files, result.failed_files, cancelled);
        if result.processed_files == 0 && result.failed_files > 0 && !cancelled {
            if !mirror {
                let _ = tokio::fs::remove_file(&sink_path).await;
            }
            return Ok((BackupStatus::Failed, "No file could be backed up".into()));
        }

        // Save
        let mut manifest = BackupManifest::new(&id, plan.base.as_ref().map(|b| b.id.clone()));
        manifest.files = outcome.entries;
        if plan.fell_back() {
            manifest
                .metadata
                .insert(META_REQUESTED_TYPE.to_string(), plan.requested.to_string());
        }
        if matches!(plan.strategy, BackupStrategy::Incremental | BackupStrategy::Differential) {
            manifest.set_deleted_paths(&changes.deleted)?;
        }

        let (encryption_info, key) = match encryption {
            Some((info, key)) => (Some(info), Some(key)),
            None => (None, None),
        };
        let archive = BackupArchive {
            id: id.clone(),
            name: job.name.clone(),
            job_id: job.id,
            backup_type: plan.strategy.backup_type(),
            destination: destination.clone(),
            path: sink_path,
            created: result.started_at,
            total_size: manifest.total_size(),
            file_count: manifest.file_count(),
            stored_size: 0,
            compression: if mirror { BackupCompression::None } else { job.compression },
            is_encrypted: encryption_info.is_some(),
            is_verified: false,
            status,
            description: job.description.clone(),
            source_paths: job.source_paths.clone(),
            parent_id: plan.base.as_ref().map(|b| b.id.clone()),
            encryption: encryption_info,
            manifest: Some(manifest),
        };

        let mut saved = self.store.save(archive).await?;
        if mirror {
            self.forget_previous_mirrors(job, &saved.id).await;
        }

        if job.verify_after_backup && !cancelled {
            if cancel.is_cancelled() {
                saved.manifest = None;
                result.archive = Some(saved);
                return Ok((BackupStatus::Cancelled, "Cancelled before verification".into()));
            }
            let (report, _) = verify::verify_archive(saved.clone(), key, self.tracker(observer.clone())).await?;
            if report.is_ok() {
                saved.is_verified = true;
                self.store.update(&saved).await?;
            } else {
                warn!(archive_id = %saved.id, mismatches = report.mismatches.len(), "Verification after backup failed");
            }
            result.verification = Some(report);
        }

        if status.is_success() && !cancel.is_cancelled() {
            let mut tracker = self.tracker(observer);
            tracker.phase(ProgressPhase::Retention, "Applying retention");
            let protected = HashSet::from([saved.id.clone()]);
            let (deleted, warnings) = retention::apply(&self.store, job, &protected).await;
            result.deleted_archives = deleted;
            result.warnings.extend(warnings);
        }

        let message = format!(
            "{} backup {}: {} files ({}) captured, {} unchanged, {} failed",
            saved.backup_type,
            saved.id,
            result.processed_files,
            format_bytes(result.processed_bytes),
            result.skipped_files,
            result.failed_files
        );
        saved.manifest = None;
        result.archive = Some(saved);
        Ok((status, message))
    }

    async fn acquire_snapshot(&self, job: &BackupJob, result: &mut BackupResult) -> Result<SnapshotHandle> {
        if !job.use_snapshot {
            return Ok(SnapshotHandle::direct());
        }
        match self.snapshots.acquire(&job.source_paths).await {
            Ok(handle) => {
                info!(job = %job.name, provider = handle.provider(), "Reading through snapshot");
                Ok(handle)
            }
            Err(e) if self.config.snapshot.allow_fallback => {
                warn!(job = %job.name, "Snapshot unavailable, reading live files: {}", e);
                result.warnings.push(BackupError::new(
                    BackupErrorKind::Snapshot,
                    None,
                    format!("{}; files are read directly", e),
                ));
                Ok(SnapshotHandle::direct())
            }
            Err(e) => Err(e),
        }
    }

    /// Pre-flight space check; never fatal
    fn check_free_space(&self, destination: &Path, needed: u64, result: &mut BackupResult) {
        match drives::drive_space(destination) {
            Ok(space) if space.available_bytes < needed => {
                warn!(
                    needed = %format_bytes(needed),
                    available = %format_bytes(space.available_bytes),
                    "Destination may run out of space"
                );
                result.warnings.push(BackupError::new(
                    BackupErrorKind::Write,
                    Some(destination),
                    format!(
                        "only {} free for up to {} of data",
                        format_bytes(space.available_bytes),
                        format_bytes(needed)
                    ),
                ));
            }
            Ok(_) => {}
            Err(e) => warn!(path = %destination.display(), "Cannot determine free space: {}", e),
        }
    }

    /// Mirror runs replace the previous record of the same tree once the new one is saved
    async fn forget_previous_mirrors(&self, job: &BackupJob, keep_id: &str) {
        let previous = match self.store.list(&job.destination_path).await {
            Ok(archives) => archives,
            Err(e) => {
                warn!(job = %job.name, "Cannot list previous mirror records: {}", e);
                return;
            }
        };
        for archive in previous.iter().filter(|a| a.is_mirror() && a.name == job.name && a.id != keep_id) {
            if let Err(e) = self.store.forget(archive).await {
                warn!(archive_id = %archive.id, "Failed to drop previous mirror record: {}", e);
            }
        }
    }

    // ── System image ──

    pub async fn create_system_image(
        &self,
        destination: &Path,
        observer: Option<Arc<dyn ProgressObserver>>,
        cancel: Option<CancellationToken>,
    ) -> Result<BackupResult> {
        let mut job = BackupJob::new("system-image", Vec::new(), destination);
        job.backup_type = BackupType::SystemImage;
        job.compression = BackupCompression::None;
        if self.imager.is_none() {
            return Err(EngineError::Unsupported("no system imaging program is configured".into()));
        }
        let guard = self.active.acquire(RunKind::SystemImage, &job.name, cancel)?;
        Ok(self.run_backup(&job, observer, &guard).await)
    }

    async fn capture_image(
        &self,
        destination: &Path,
        job: &BackupJob,
        observer: Option<Arc<dyn ProgressObserver>>,
        cancel: &CancellationToken,
        result: &mut BackupResult,
    ) -> Result<(BackupStatus, String)> {
        let imager = self
            .imager
            .clone()
            .ok_or_else(|| EngineError::Unsupported("no system imaging program is configured".into()))?;
        tokio::fs::create_dir_all(destination)
            .await
            .map_err(|e| EngineError::destination(destination, e))?;

        let id = new_archive_id();
        let image_path = store::partial_payload_path(destination, &id);
        let (capture, _) = image::capture(imager.as_ref(), &id, image_path.clone(), self.tracker(observer), cancel).await?;
        if capture.outcome == ImageOutcome::Cancelled {
            return Ok((BackupStatus::Cancelled, "System image cancelled".into()));
        }

        result.total_files = capture.manifest.file_count();
        result.total_bytes = capture.manifest.total_size();
        result.processed_files = result.total_files;
        result.processed_bytes = result.total_bytes;

        let archive = BackupArchive {
            id: id.clone(),
            name: job.name.clone(),
            job_id: job.id,
            backup_type: BackupType::SystemImage,
            destination: destination.to_path_buf(),
            path: image_path,
            created: result.started_at,
            total_size: capture.manifest.total_size(),
            file_count: capture.manifest.file_count(),
            stored_size: 0,
            compression: BackupCompression::None,
            is_encrypted: false,
            is_verified: false,
            status: BackupStatus::Completed,
            description: Some("System image".into()),
            source_paths: vec![PathBuf::from("/")],
            parent_id: None,
            encryption: None,
            manifest: Some(capture.manifest),
        };
        let mut saved = self.store.save(archive).await?;
        let message = format!("System image {} created ({})", saved.id, format_bytes(saved.total_size));
        saved.manifest = None;
        result.archive = Some(saved);
        Ok((BackupStatus::Completed, message))
    }

    // ── Restore ──

    /// Restore `archive` (and its chain) under `destination`.
    /// A broken chain or wrong password is returned as `Err` before anything is written.
    pub async fn restore_backup(
        &self,
        archive: &BackupArchive,
        destination: &Path,
        options: RestoreOptions,
        observer: Option<Arc<dyn ProgressObserver>>,
        cancel: Option<CancellationToken>,
    ) -> Result<BackupResult> {
        let guard = self.active.acquire(RunKind::Restore, &archive.id, cancel)?;
        info!(archive_id = %archive.id, destination = %destination.display(), "Restore started");

        let plan = restore::prepare(&self.store, archive, &options).await?;
        guard.protect(plan.archive_ids());

        let (result, _) = restore::execute(
            plan,
            destination.to_path_buf(),
            options,
            self.tracker(observer),
            guard.token().clone(),
        )
        .await?;
        info!(archive_id = %archive.id, status = ?result.status, "{}", result.summary(5));
        Ok(result)
    }

    // ── History, verification, deletion ──

    /// Archives at `location` (default destination when `None`), newest first
    pub async fn get_backup_history(&self, location: Option<&Path>) -> Result<Vec<BackupArchive>> {
        let location = location.unwrap_or(&self.config.engine.default_destination);
        self.store.list(location).await
    }

    /// Archive `id` at `location` (default destination when `None`)
    pub async fn find_backup(&self, location: Option<&Path>, id: &str) -> Result<BackupArchive> {
        let location = location.unwrap_or(&self.config.engine.default_destination);
        self.store.load(location, id).await
    }

    /// Re-hash an archive against its manifest. Never modifies the archive.
    /// Without the password of an encrypted archive only stored bytes are checked.
    pub async fn verify_backup(
        &self,
        archive: &BackupArchive,
        observer: Option<Arc<dyn ProgressObserver>>,
        password: Option<&str>,
    ) -> Result<BackupResult> {
        let mut result = BackupResult::started();
        let archive = self.store.with_manifest(archive.clone()).await?;
        let key = self.unlock(&archive, password).await?;

        let (report, _) = verify::verify_archive(archive.clone(), key, self.tracker(observer)).await?;
        result.total_files = archive.file_count;
        result.total_bytes = archive.total_size;
        result.processed_files = report.checked_files;
        result.processed_bytes = report.checked_bytes;
        result.failed_files = report.mismatches.len();
        result.errors = report.mismatches.clone();

        let message = if report.is_ok() {
            format!("Archive {} verified: {} files intact", archive.id, report.checked_files)
        } else {
            format!("Archive {} has {} mismatches", archive.id, report.mismatches.len())
        };
        result.verification = Some(report);
        Ok(result.finish(BackupStatus::Completed, message))
    }

    async fn unlock(&self, archive: &BackupArchive, password: Option<&str>) -> Result<Option<Arc<DerivedKey>>> {
        let (Some(info), Some(password)) = (archive.encryption.clone(), password) else {
            return Ok(None);
        };
        let password = password.to_string();
        let key = tokio::task::spawn_blocking(move || info.unlock(&password)).await??;
        Ok(Some(Arc::new(key)))
    }

    /// Delete an archive. Refused while the running restore reads from it.
    pub async fn delete_backup(&self, archive: &BackupArchive) -> Result<BackupResult> {
        if self.active.is_protected(&archive.id) {
            return Err(EngineError::ArchiveInUse(archive.id.clone()));
        }

        let mut result = BackupResult::started();
        result.total_files = archive.file_count;
        result.total_bytes = archive.total_size;
        match self.store.delete(archive).await {
            Ok(()) => {
                result.deleted_archives.push(archive.id.clone());
                Ok(result.finish(BackupStatus::Completed, format!("Archive {} deleted", archive.id)))
            }
            Err(e) => Ok(result.fail(&e)),
        }
    }

    // ── Scheduling ──

    pub async fn schedule_backup(&self, schedule: BackupSchedule) -> Result<BackupSchedule> {
        self.scheduler.add(schedule).await
    }

    pub async fn remove_scheduled_backup(&self, id: Uuid) -> Result<bool> {
        self.scheduler.remove(id).await
    }

    pub async fn get_scheduled_backups(&self) -> Vec<BackupSchedule> {
        self.scheduler.list().await
    }

    /// Run every schedule due at `now`, one after another
    pub async fn run_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<BackupSchedule>> {
        let mut updated = Vec::new();
        for schedule in self.scheduler.due(now).await {
            info!(schedule = %schedule.name, "Running scheduled backup");
            let outcome = self.create_backup(&schedule.job, None, None).await;
            if let Some(schedule) = self.scheduler.record_run(schedule.id, &outcome, Utc::now()).await? {
                updated.push(schedule);
            }
        }
        Ok(updated)
    }

    // ── Drives and estimates ──

    pub async fn get_drive_space(&self, path: &Path) -> Result<DriveSpace> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || drives::drive_space(&path)).await?
    }

    pub async fn get_available_drives(&self) -> Result<Vec<DriveInfo>> {
        tokio::task::spawn_blocking(drives::available_drives).await?
    }

    /// Bytes the next run of `job` would transfer
    pub async fn estimate_backup_size(&self, job: &BackupJob) -> Result<u64> {
        job.validate()?;
        let (files, _, _) = scan(job, self.tracker(None)).await?;
        let plan = strategy::plan(&self.store, job).await?;
        Ok(plan.strategy.select(files, plan.baseline.as_ref()).selected_bytes())
    }

    fn tracker(&self, observer: Option<Arc<dyn ProgressObserver>>) -> ProgressTracker {
        ProgressTracker::new(
            observer,
            Duration::from_millis(self.config.transfer.progress_interval_ms),
            Duration::from_secs(self.config.transfer.throughput_window_secs.max(1)),
        )
    }
}

/// Enumerate a job's sources on the blocking pool
async fn scan(job: &BackupJob, mut tracker: ProgressTracker) -> Result<(Vec<FileInfo>, Vec<BackupError>, ProgressTracker)> {
    let sources = job.source_paths.clone();
    let options = WalkOptions::for_job(job);
    tokio::task::spawn_blocking(move || {
        let enumerator = Enumerator::new(&sources, options)?;
        let (files, warnings) = enumerator.collect_with(|file| tracker.scanned(&file.relative_path, file.size));
        Ok((files, warnings, tracker))
    })
    .await?
}

/// Sortable, unique archive id
fn new_archive_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%d-%H%M%S"), &uuid[..8])
}
