//! Point-in-time snapshots of source volumes.
//!
//! A snapshot lets the engine read files that are being written to while the
//! backup runs. Reads are remapped from the live path to the read-only view.
//! The handle releases the snapshot when dropped, so every exit path of a run
//! gives it back.

use crate::config::{SnapshotConfig, SnapshotKind};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

type ReleaseFn = Box<dyn FnOnce() -> std::io::Result<()> + Send>;

/// Scoped access to a snapshot (or to the live filesystem when none is active)
pub struct SnapshotHandle {
    provider: &'static str,
    /// (live prefix, snapshot prefix)
    mappings: Vec<(PathBuf, PathBuf)>,
    release: Option<ReleaseFn>,
}

impl SnapshotHandle {
    /// Handle that reads straight from the live filesystem
    pub fn direct() -> Self {
        Self {
            provider: "direct",
            mappings: Vec::new(),
            release: None,
        }
    }

    pub fn new(provider: &'static str, mappings: Vec<(PathBuf, PathBuf)>, release: Option<ReleaseFn>) -> Self {
        Self {
            provider,
            mappings,
            release,
        }
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    pub fn is_active(&self) -> bool {
        !self.mappings.is_empty()
    }

    /// Path to read `path` from; the longest matching live prefix wins
    pub fn map(&self, path: &Path) -> PathBuf {
        self.mappings
            .iter()
            .filter(|(live, _)| path.starts_with(live))
            .max_by_key(|(live, _)| live.components().count())
            .and_then(|(live, snap)| path.strip_prefix(live).ok().map(|rest| snap.join(rest)))
            .unwrap_or_else(|| path.to_path_buf())
    }

    /// Release the snapshot now and report failures
    pub fn release(mut self) -> std::io::Result<()> {
        match self.release.take() {
            Some(release) => release(),
            None => Ok(()),
        }
    }
}

impl Drop for SnapshotHandle {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            if let Err(e) = release() {
                warn!(provider = self.provider, "Failed to release snapshot: {}", e);
            }
        }
    }
}

#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create a consistent read-only view covering `sources`
    async fn acquire(&self, sources: &[PathBuf]) -> Result<SnapshotHandle>;
}

/// Provider used when no snapshot facility is configured
pub struct NoSnapshotProvider;

#[async_trait]
impl SnapshotProvider for NoSnapshotProvider {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn acquire(&self, _sources: &[PathBuf]) -> Result<SnapshotHandle> {
        Err(EngineError::SnapshotUnavailable(
            "no snapshot provider configured".into(),
        ))
    }
}

/// Read-only btrfs subvolume snapshots
pub struct BtrfsSnapshotProvider {
    snapshot_dir: PathBuf,
    subvolumes: Vec<PathBuf>,
}

impl BtrfsSnapshotProvider {
    pub fn new(snapshot_dir: PathBuf, subvolumes: Vec<PathBuf>) -> Self {
        Self {
            snapshot_dir,
            subvolumes,
        }
    }

    /// Deepest configured subvolume containing `source`
    fn subvolume_for(&self, source: &Path) -> Option<&PathBuf> {
        self.subvolumes
            .iter()
            .filter(|sv| source.starts_with(sv))
            .max_by_key(|sv| sv.components().count())
    }
}

#[async_trait]
impl SnapshotProvider for BtrfsSnapshotProvider {
    fn name(&self) -> &'static str {
        "btrfs"
    }

    async fn acquire(&self, sources: &[PathBuf]) -> Result<SnapshotHandle> {
        let mut needed: Vec<PathBuf> = Vec::new();
        for source in sources {
            let subvolume = self.subvolume_for(source).ok_or_else(|| {
                EngineError::SnapshotUnavailable(format!(
                    "{} is not on a configured btrfs subvolume",
                    source.display()
                ))
            })?;
            if !needed.contains(subvolume) {
                needed.push(subvolume.clone());
            }
        }

        tokio::fs::create_dir_all(&self.snapshot_dir)
            .await
            .map_err(|e| EngineError::SnapshotUnavailable(e.to_string()))?;

        let run_id = uuid::Uuid::new_v4();
        let mut mappings = Vec::new();
        for (idx, subvolume) in needed.iter().enumerate() {
            let target = self.snapshot_dir.join(format!("{}-{}", run_id, idx));
            let status = tokio::process::Command::new("btrfs")
                .args(["subvolume", "snapshot", "-r"])
                .arg(subvolume)
                .arg(&target)
                .status()
                .await;

            match status {
                Ok(s) if s.success() => mappings.push((subvolume.clone(), target)),
                Ok(s) => {
                    delete_snapshots(mappings.iter().map(|(_, snap)| snap.clone()).collect()).ok();
                    return Err(EngineError::SnapshotUnavailable(format!(
                        "btrfs snapshot of {} exited with {}",
                        subvolume.display(),
                        s
                    )));
                }
                Err(e) => {
                    delete_snapshots(mappings.iter().map(|(_, snap)| snap.clone()).collect()).ok();
                    return Err(EngineError::SnapshotUnavailable(e.to_string()));
                }
            }
        }

        info!(count = mappings.len(), "Created btrfs snapshots");
        let created: Vec<PathBuf> = mappings.iter().map(|(_, snap)| snap.clone()).collect();
        Ok(SnapshotHandle::new(
            "btrfs",
            mappings,
            Some(Box::new(move || delete_snapshots(created))),
        ))
    }
}

fn delete_snapshots(snapshots: Vec<PathBuf>) -> std::io::Result<()> {
    let mut last_err = None;
    for snapshot in snapshots {
        let status = std::process::Command::new("btrfs")
            .args(["subvolume", "delete"])
            .arg(&snapshot)
            .status();
        match status {
            Ok(s) if s.success() => {}
            Ok(s) => {
                last_err = Some(std::io::Error::other(format!(
                    "btrfs subvolume delete {} exited with {}",
                    snapshot.display(),
                    s
                )))
            }
            Err(e) => last_err = Some(e),
        }
    }
    match last_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

pub fn provider_from_config(config: &SnapshotConfig) -> Arc<dyn SnapshotProvider> {
    match config.provider {
        SnapshotKind::None => Arc::new(NoSnapshotProvider),
        SnapshotKind::Btrfs => Arc::new(BtrfsSnapshotProvider::new(
            config.snapshot_dir.clone(),
            config.subvolumes.clone(),
        )),
    }
}
