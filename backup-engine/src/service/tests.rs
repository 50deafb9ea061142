use super::*;
use crate::config::KdfConfig;
use crate::result::BackupErrorKind;
use crate::schedule::Frequency;
use crate::transfer::progress::BackupProgress;
use async_trait::async_trait;
use chrono::NaiveTime;
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    service: BackupService,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.engine.default_destination = dir.path().join("dest");
        config.engine.schedule_file = dir.path().join("schedules.json");
        config.transfer.workers = 2;
        config.transfer.chunk_size = 4096;
        config.transfer.progress_interval_ms = 0;
        config.encryption = KdfConfig {
            memory_cost: 1024,
            time_cost: 1,
            parallelism: 1,
        };
        let service = BackupService::new(config);
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        Self { dir, service }
    }

    fn src(&self) -> PathBuf {
        self.dir.path().join("src")
    }

    fn dest(&self) -> PathBuf {
        self.dir.path().join("dest")
    }

    fn write(&self, name: &str, content: &[u8]) {
        let path = self.src().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    fn job(&self, backup_type: BackupType) -> BackupJob {
        BackupJob::new("docs", vec![self.src()], self.dest()).with_type(backup_type)
    }

    async fn restore(&self, archive: &BackupArchive, out: &str, options: RestoreOptions) -> BackupResult {
        let out = self.dir.path().join(out);
        self.service
            .restore_backup(archive, &out, options, None, None)
            .await
            .unwrap()
    }
}

fn archive_of(result: &BackupResult) -> BackupArchive {
    result.archive.clone().expect("run saved an archive")
}

#[tokio::test]
async fn test_full_backup_counts_and_round_trip() -> anyhow::Result<()> {
    let fx = Fixture::new();
    fx.write("a.txt", b"alpha");
    fx.write("nested/b.txt", &vec![7u8; 20_000]);
    fx.write("c.txt", b"");

    let result = fx.service.create_backup(&fx.job(BackupType::Full), None, None).await?;
    assert_eq!(result.status, BackupStatus::Completed);
    assert!(result.success);
    assert_eq!(result.total_files, 3);
    assert_eq!(result.processed_files, 3);
    assert_eq!(result.processed_bytes, 20_005);

    let archive = archive_of(&result);
    assert_eq!(archive.file_count, 3);
    assert_eq!(archive.total_size, 20_005);
    assert!(store::payload_path(&fx.dest(), &archive.id).exists());
    assert!(!store::partial_payload_path(&fx.dest(), &archive.id).exists());

    let restored = fx.restore(&archive, "out", RestoreOptions::default()).await;
    assert_eq!(restored.status, BackupStatus::Completed);
    assert_eq!(restored.processed_files, 3);
    let out = fx.dir.path().join("out/src");
    assert_eq!(std::fs::read(out.join("a.txt"))?, b"alpha");
    assert_eq!(std::fs::read(out.join("nested/b.txt"))?, vec![7u8; 20_000]);
    assert_eq!(std::fs::read(out.join("c.txt"))?, b"");
    Ok(())
}

#[tokio::test]
async fn test_second_incremental_captures_nothing() -> anyhow::Result<()> {
    let fx = Fixture::new();
    fx.write("a.txt", b"one");
    fx.write("b.txt", b"two");

    let job = fx.job(BackupType::Incremental);
    let first = fx.service.create_backup(&job, None, None).await?;
    // No base yet: captured as a full backup
    assert_eq!(archive_of(&first).backup_type, BackupType::Full);
    assert_eq!(first.processed_files, 2);

    let second = fx.service.create_backup(&job, None, None).await?;
    assert_eq!(second.status, BackupStatus::Completed);
    assert_eq!(second.processed_files, 0);
    assert_eq!(second.skipped_files, 2);
    let archive = archive_of(&second);
    assert_eq!(archive.backup_type, BackupType::Incremental);
    assert_eq!(archive.file_count, 0);
    assert_eq!(archive.parent_id.as_deref(), Some(archive_of(&first).id.as_str()));
    Ok(())
}

#[tokio::test]
async fn test_incremental_chain_restores_latest_state() -> anyhow::Result<()> {
    let fx = Fixture::new();
    fx.write("keep.txt", b"keep");
    fx.write("gone.txt", b"gone");
    fx.write("edit.txt", b"v1");

    let job = fx.job(BackupType::Incremental);
    fx.service.create_backup(&job, None, None).await?;

    std::fs::remove_file(fx.src().join("gone.txt"))?;
    fx.write("edit.txt", b"version two");
    fx.write("new.txt", b"new");
    let second = fx.service.create_backup(&job, None, None).await?;
    assert_eq!(second.processed_files, 2);
    let archive = archive_of(&second);

    let restored = fx.restore(&archive, "out", RestoreOptions::default()).await;
    assert_eq!(restored.status, BackupStatus::Completed);
    let out = fx.dir.path().join("out/src");
    assert_eq!(std::fs::read(out.join("keep.txt"))?, b"keep");
    assert_eq!(std::fs::read(out.join("edit.txt"))?, b"version two");
    assert_eq!(std::fs::read(out.join("new.txt"))?, b"new");
    assert!(!out.join("gone.txt").exists());
    Ok(())
}

#[tokio::test]
async fn test_differential_diffs_against_last_full() -> anyhow::Result<()> {
    let fx = Fixture::new();
    fx.write("a.txt", b"v1");
    fx.write("b.txt", b"b");
    fx.write("c.txt", b"c");

    let full = archive_of(&fx.service.create_backup(&fx.job(BackupType::Full), None, None).await?);

    fx.write("a.txt", b"version two");
    std::fs::remove_file(fx.src().join("b.txt"))?;
    let incremental = fx.service.create_backup(&fx.job(BackupType::Incremental), None, None).await?;
    assert_eq!(archive_of(&incremental).backup_type, BackupType::Incremental);

    let differential = fx.service.create_backup(&fx.job(BackupType::Differential), None, None).await?;
    assert_eq!(differential.status, BackupStatus::Completed);
    // Changes since the full backup, not since the incremental
    assert_eq!(differential.processed_files, 1);
    let archive = archive_of(&differential);
    assert_eq!(archive.backup_type, BackupType::Differential);
    assert_eq!(archive.parent_id.as_deref(), Some(full.id.as_str()));

    let restored = fx.restore(&archive, "out", RestoreOptions::default()).await;
    assert_eq!(restored.status, BackupStatus::Completed);
    let out = fx.dir.path().join("out/src");
    assert_eq!(std::fs::read(out.join("a.txt"))?, b"version two");
    assert_eq!(std::fs::read(out.join("c.txt"))?, b"c");
    assert!(!out.join("b.txt").exists());
    Ok(())
}

#[tokio::test]
async fn test_retention_keeps_two_of_five() -> anyhow::Result<()> {
    let fx = Fixture::new();
    fx.write("a.txt", b"data");
    let mut job = fx.job(BackupType::Full);
    job.max_backups_to_keep = Some(2);

    let mut ids = Vec::new();
    let mut deleted = Vec::new();
    for _ in 0..5 {
        let result = fx.service.create_backup(&job, None, None).await?;
        ids.push(archive_of(&result).id);
        deleted.extend(result.deleted_archives);
    }

    let history = fx.service.get_backup_history(Some(&fx.dest())).await?;
    let mut kept: Vec<_> = history.iter().map(|a| a.id.clone()).collect();
    kept.sort();
    let mut newest = ids[3..].to_vec();
    newest.sort();
    assert_eq!(kept, newest);
    assert_eq!(deleted.len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_cancel_after_two_files() -> anyhow::Result<()> {
    let fx = Fixture::new();
    for i in 0..5 {
        fx.write(&format!("f{}.txt", i), format!("file {}", i).as_bytes());
    }

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let observer: Arc<dyn ProgressObserver> = Arc::new(move |p: &BackupProgress| {
        if p.phase == ProgressPhase::Transferring && p.processed_files >= 2 {
            trigger.cancel();
        }
    });

    let result = fx
        .service
        .create_backup(&fx.job(BackupType::Full), Some(observer), Some(cancel))
        .await?;
    assert_eq!(result.status, BackupStatus::Cancelled);
    assert!(!result.success);
    assert_eq!(result.processed_files, 2);
    assert_eq!(archive_of(&result).file_count, 2);
    assert!(!fx.service.is_backup_in_progress());
    Ok(())
}

#[tokio::test]
async fn test_verify_after_backup_marks_archive_verified() -> anyhow::Result<()> {
    let fx = Fixture::new();
    fx.write("one.txt", b"1");
    fx.write("two.txt", &vec![2u8; 9000]);
    fx.write("three.txt", b"three");

    let mut job = fx.job(BackupType::Full);
    job.compression = BackupCompression::Normal;
    job.verify_after_backup = true;

    let result = fx.service.create_backup(&job, None, None).await?;
    assert_eq!(result.status, BackupStatus::Completed);
    let report = result.verification.as_ref().unwrap();
    assert!(report.is_ok());
    assert_eq!(report.checked_files, 3);

    let stored = fx.service.find_backup(Some(&fx.dest()), &archive_of(&result).id).await?;
    assert!(stored.is_verified);

    let verified = fx.service.verify_backup(&stored, None, None).await?;
    assert!(verified.success);
    assert_eq!(verified.processed_files, 3);
    Ok(())
}

/// Maps one live file onto a path that does not exist, as if it were locked
struct LockingSnapshot {
    locked: PathBuf,
}

#[async_trait]
impl SnapshotProvider for LockingSnapshot {
    fn name(&self) -> &'static str {
        "locking"
    }

    async fn acquire(&self, _sources: &[PathBuf]) -> Result<SnapshotHandle> {
        Ok(SnapshotHandle::new(
            "locking",
            vec![(self.locked.clone(), self.locked.with_extension("missing"))],
            None,
        ))
    }
}

#[tokio::test]
async fn test_unreadable_file_gives_partial_success() -> anyhow::Result<()> {
    let mut fx = Fixture::new();
    fx.write("ok.txt", b"fine");
    fx.write("locked.txt", b"busy");
    let locked = fx.src().join("locked.txt");
    fx.service = fx.service.with_snapshot_provider(Arc::new(LockingSnapshot { locked }));

    let mut job = fx.job(BackupType::Full);
    job.use_snapshot = true;
    let result = fx.service.create_backup(&job, None, None).await?;

    assert_eq!(result.status, BackupStatus::PartialSuccess);
    assert_eq!(result.processed_files, 1);
    assert_eq!(result.failed_files, 1);
    assert_eq!(result.errors[0].kind, BackupErrorKind::Read);
    assert_eq!(archive_of(&result).file_count, 1);
    Ok(())
}

#[tokio::test]
async fn test_snapshot_fallback_is_a_warning() -> anyhow::Result<()> {
    let fx = Fixture::new();
    fx.write("a.txt", b"a");
    let mut job = fx.job(BackupType::Full);
    job.use_snapshot = true;

    let result = fx.service.create_backup(&job, None, None).await?;
    assert_eq!(result.status, BackupStatus::Completed);
    assert!(result.warnings.iter().any(|w| w.kind == BackupErrorKind::Snapshot));
    Ok(())
}

#[tokio::test]
async fn test_second_run_is_refused() -> anyhow::Result<()> {
    let fx = Fixture::new();
    fx.write("a.txt", b"a");
    let _guard = fx.service.active.acquire(RunKind::Backup, "other", None)?;

    assert!(fx.service.is_backup_in_progress());
    assert!(matches!(
        fx.service.create_backup(&fx.job(BackupType::Full), None, None).await,
        Err(EngineError::JobAlreadyRunning)
    ));
    assert!(fx.service.get_backup_history(Some(&fx.dest())).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_encrypted_restore_needs_the_password() -> anyhow::Result<()> {
    let fx = Fixture::new();
    fx.write("secret.txt", b"top secret");
    let mut job = fx.job(BackupType::Full);
    job.encrypt = true;
    job.password = Some("hunter2".into());

    let result = fx.service.create_backup(&job, None, None).await?;
    let archive = archive_of(&result);
    assert!(archive.is_encrypted);
    let payload = std::fs::read(store::payload_path(&fx.dest(), &archive.id))?;
    assert!(!payload.windows(10).any(|w| w == b"top secret"));

    let out = fx.dir.path().join("out");
    let wrong = RestoreOptions {
        password: Some("wrong".into()),
        ..Default::default()
    };
    assert!(matches!(
        fx.service.restore_backup(&archive, &out, wrong, None, None).await,
        Err(EngineError::InvalidPassword)
    ));
    assert!(!out.exists());
    assert!(!fx.service.is_backup_in_progress());

    let right = RestoreOptions {
        password: Some("hunter2".into()),
        ..Default::default()
    };
    let restored = fx.restore(&archive, "out", right).await;
    assert_eq!(restored.status, BackupStatus::Completed);
    assert_eq!(std::fs::read(out.join("src/secret.txt"))?, b"top secret");
    Ok(())
}

#[tokio::test]
async fn test_restore_skips_existing_without_overwrite() -> anyhow::Result<()> {
    let fx = Fixture::new();
    fx.write("a.txt", b"archived");
    let archive = archive_of(&fx.service.create_backup(&fx.job(BackupType::Full), None, None).await?);

    let existing = fx.dir.path().join("out/src/a.txt");
    std::fs::create_dir_all(existing.parent().unwrap())?;
    std::fs::write(&existing, b"local")?;

    let restored = fx.restore(&archive, "out", RestoreOptions::default()).await;
    assert_eq!(restored.skipped_files, 1);
    assert!(restored.warnings.iter().any(|w| w.kind == BackupErrorKind::Conflict));
    assert_eq!(std::fs::read(&existing)?, b"local");

    let overwrite = RestoreOptions {
        overwrite_existing: true,
        ..Default::default()
    };
    fx.restore(&archive, "out", overwrite).await;
    assert_eq!(std::fs::read(&existing)?, b"archived");
    Ok(())
}

#[tokio::test]
async fn test_restore_aborts_when_destination_is_unusable() -> anyhow::Result<()> {
    let fx = Fixture::new();
    fx.write("a.txt", b"a");
    fx.write("b.txt", b"b");
    fx.write("c.txt", b"c");
    let archive = archive_of(&fx.service.create_backup(&fx.job(BackupType::Full), None, None).await?);

    // A regular file where the restore root should be
    std::fs::write(fx.dir.path().join("blocker"), b"not a directory")?;
    let restored = fx.restore(&archive, "blocker", RestoreOptions::default()).await;
    assert_eq!(restored.status, BackupStatus::Failed);
    assert!(!restored.success);
    assert_eq!(restored.processed_files, 0);
    assert_eq!(restored.failed_files, 1);
    assert_eq!(restored.errors.len(), 1);
    assert_eq!(restored.errors[0].kind, BackupErrorKind::Fatal);
    assert_eq!(restored.errors[0].code.as_deref(), Some("DESTINATION_UNAVAILABLE"));
    Ok(())
}

#[tokio::test]
async fn test_delete_refused_while_restore_reads_archive() -> anyhow::Result<()> {
    let fx = Fixture::new();
    fx.write("a.txt", b"a");
    let archive = archive_of(&fx.service.create_backup(&fx.job(BackupType::Full), None, None).await?);

    let guard = fx.service.active.acquire(RunKind::Restore, &archive.id, None)?;
    guard.protect(vec![archive.id.clone()]);
    assert!(matches!(
        fx.service.delete_backup(&archive).await,
        Err(EngineError::ArchiveInUse(_))
    ));
    drop(guard);

    let deleted = fx.service.delete_backup(&archive).await?;
    assert!(deleted.success);
    assert_eq!(deleted.deleted_archives, vec![archive.id.clone()]);
    assert!(fx.service.get_backup_history(Some(&fx.dest())).await?.is_empty());

    let again = fx.service.delete_backup(&archive).await?;
    assert_eq!(again.status, BackupStatus::Failed);
    Ok(())
}

#[tokio::test]
async fn test_mirror_tracks_source_deletions() -> anyhow::Result<()> {
    let fx = Fixture::new();
    fx.write("a.txt", b"a");
    fx.write("b.txt", b"b");
    let job = fx.job(BackupType::Mirror);

    fx.service.create_backup(&job, None, None).await?;
    let tree = store::mirror_root(&fx.dest(), "docs");
    assert_eq!(std::fs::read(tree.join("src/a.txt"))?, b"a");

    std::fs::remove_file(fx.src().join("b.txt"))?;
    let second = fx.service.create_backup(&job, None, None).await?;
    assert_eq!(second.status, BackupStatus::Completed);
    assert!(tree.join("src/a.txt").exists());
    assert!(!tree.join("src/b.txt").exists());

    let history = fx.service.get_backup_history(Some(&fx.dest())).await?;
    assert_eq!(history.len(), 1);
    assert!(history[0].is_mirror());
    // The record that survives is the one just saved
    assert_eq!(history[0].id, archive_of(&second).id);
    Ok(())
}

struct FakeImager;

#[async_trait]
impl SystemImager for FakeImager {
    async fn create_image(&self, image_path: &Path, _cancel: &CancellationToken) -> Result<ImageOutcome> {
        tokio::fs::write(image_path, b"disk image").await?;
        Ok(ImageOutcome::Completed)
    }
}

#[tokio::test]
async fn test_system_image() -> anyhow::Result<()> {
    let fx = Fixture::new();
    assert!(matches!(
        fx.service.create_system_image(&fx.dest(), None, None).await,
        Err(EngineError::Unsupported(_))
    ));

    let service = fx.service.with_imager(Arc::new(FakeImager));
    let result = service.create_system_image(&fx.dir.path().join("dest"), None, None).await?;
    assert_eq!(result.status, BackupStatus::Completed);
    let archive = archive_of(&result);
    assert_eq!(archive.backup_type, BackupType::SystemImage);
    assert_eq!(archive.total_size, 10);

    let verified = service.verify_backup(&archive, None, None).await?;
    assert!(verified.success);
    Ok(())
}

#[tokio::test]
async fn test_estimate_and_invalid_job() -> anyhow::Result<()> {
    let fx = Fixture::new();
    fx.write("a.txt", b"12345");
    fx.write("skip.tmp", b"ignored");
    assert_eq!(fx.service.estimate_backup_size(&fx.job(BackupType::Full)).await?, 5);

    let mut job = fx.job(BackupType::Full);
    job.source_paths.clear();
    assert!(matches!(
        fx.service.create_backup(&job, None, None).await,
        Err(EngineError::InvalidJob(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_due_schedule_runs_and_advances() -> anyhow::Result<()> {
    let fx = Fixture::new();
    fx.write("a.txt", b"a");
    let schedule = BackupSchedule::new(
        "nightly",
        fx.job(BackupType::Full),
        Frequency::Daily,
        NaiveTime::from_hms_opt(3, 0, 0).unwrap(),
    );
    let saved = fx.service.schedule_backup(schedule).await?;
    assert_eq!(fx.service.get_scheduled_backups().await.len(), 1);

    let when = saved.next_run.unwrap() + chrono::Duration::seconds(1);
    let ran = fx.service.run_due_schedules(when).await?;
    assert_eq!(ran.len(), 1);
    assert!(ran[0].last_result.as_ref().is_some_and(|r| r.success));
    assert!(ran[0].next_run.is_some_and(|next| next > when));
    assert_eq!(fx.service.get_backup_history(Some(&fx.dest())).await?.len(), 1);

    assert!(fx.service.remove_scheduled_backup(saved.id).await?);
    assert!(fx.service.get_scheduled_backups().await.is_empty());
    Ok(())
}
