//! Archive Store: persists archives at a destination directory.
//!
//! Layout for an archive `<id>` in destination `D`:
//! - `D/<id>.bkp` payload container (`.bkp.partial` while the run is active)
//! - `D/<id>.manifest.json`
//! - `D/<id>.meta.json`, written last; an archive exists once this file does
//!
//! Mirror archives point at a plain tree `D/<job name>.mirror/` instead of a
//! container. Saves and deletes are serialized per destination; listing only
//! reads metadata files and may run concurrently with them.

pub mod archive;
pub mod payload;

pub use archive::BackupArchive;

use crate::executor::manifest::BackupManifest;
use crate::utils::errors::{EngineError, Result};
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

const META_SUFFIX: &str = ".meta.json";
const MANIFEST_SUFFIX: &str = ".manifest.json";
const PAYLOAD_SUFFIX: &str = ".bkp";
const PARTIAL_SUFFIX: &str = ".partial";
const DELETING_SUFFIX: &str = ".deleting";
const MIRROR_SUFFIX: &str = ".mirror";

pub fn payload_path(destination: &Path, id: &str) -> PathBuf {
    destination.join(format!("{}{}", id, PAYLOAD_SUFFIX))
}

pub fn partial_payload_path(destination: &Path, id: &str) -> PathBuf {
    destination.join(format!("{}{}{}", id, PAYLOAD_SUFFIX, PARTIAL_SUFFIX))
}

pub fn manifest_path(destination: &Path, id: &str) -> PathBuf {
    destination.join(format!("{}{}", id, MANIFEST_SUFFIX))
}

pub fn meta_path(destination: &Path, id: &str) -> PathBuf {
    destination.join(format!("{}{}", id, META_SUFFIX))
}

pub fn mirror_root(destination: &Path, job_name: &str) -> PathBuf {
    destination.join(format!("{}{}", job_name, MIRROR_SUFFIX))
}

#[derive(Default)]
pub struct ArchiveStore {
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl ArchiveStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclusive write access to one destination
    pub async fn lock(&self, destination: &Path) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(destination.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        mutex.lock_owned().await
    }

    /// Persist an archive with its attached manifest.
    /// The manifest is written first, then the payload is moved into place,
    /// and the metadata record last.
    pub async fn save(&self, mut archive: BackupArchive) -> Result<BackupArchive> {
        let manifest = archive
            .manifest
            .take()
            .ok_or_else(|| EngineError::ArchiveNotFound(format!("{} has no manifest", archive.id)))?;
        let destination = archive.destination.clone();
        let _guard = self.lock(&destination).await;

        write_json_atomic(&manifest_path(&destination, &archive.id), &manifest).await?;

        if archive.is_mirror() {
            archive.stored_size = manifest.total_size();
        } else {
            let partial = partial_payload_path(&destination, &archive.id);
            let payload = payload_path(&destination, &archive.id);
            if tokio::fs::try_exists(&partial).await.unwrap_or(false) {
                tokio::fs::rename(&partial, &payload)
                    .await
                    .map_err(|e| EngineError::destination(&payload, e))?;
            }
            archive.stored_size = tokio::fs::metadata(&payload)
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            archive.path = payload;
        }

        write_json_atomic(&meta_path(&destination, &archive.id), &archive).await?;
        info!(archive_id = %archive.id, files = archive.file_count, "Saved archive");

        archive.manifest = Some(manifest);
        Ok(archive)
    }

    /// Rewrite the metadata record (e.g. after verification)
    pub async fn update(&self, archive: &BackupArchive) -> Result<()> {
        let _guard = self.lock(&archive.destination).await;
        let path = meta_path(&archive.destination, &archive.id);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(EngineError::ArchiveNotFound(archive.id.clone()));
        }
        write_json_atomic(&path, archive).await
    }

    /// Archives at `location`, newest first. Unreadable records are skipped;
    /// leftovers of interrupted deletions are swept.
    pub async fn list(&self, location: &Path) -> Result<Vec<BackupArchive>> {
        let mut dir = match tokio::fs::read_dir(location).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EngineError::destination(location, e)),
        };

        let mut archives = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| EngineError::destination(location, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let path = entry.path();

            if name.ends_with(DELETING_SUFFIX) {
                debug!(path = %path.display(), "Sweeping interrupted deletion");
                remove_path(&path).await.ok();
                continue;
            }

            if name.ends_with(META_SUFFIX) {
                match read_json::<BackupArchive>(&path).await {
                    Ok(archive) => archives.push(archive),
                    Err(e) => warn!(path = %path.display(), "Skipping unreadable archive record: {}", e),
                }
            }
        }

        archives.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| b.id.cmp(&a.id)));
        Ok(archives)
    }

    /// Metadata record of one archive
    pub async fn load(&self, location: &Path, id: &str) -> Result<BackupArchive> {
        match read_json(&meta_path(location, id)).await {
            Ok(archive) => Ok(archive),
            Err(EngineError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(EngineError::ArchiveNotFound(id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn load_manifest(&self, archive: &BackupArchive) -> Result<BackupManifest> {
        match read_json(&manifest_path(&archive.destination, &archive.id)).await {
            Ok(manifest) => Ok(manifest),
            Err(EngineError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Err(EngineError::BrokenChain {
                archive_id: archive.id.clone(),
                reason: "manifest file is missing".into(),
            }),
            Err(e) => Err(e),
        }
    }

    /// Attach the manifest unless it is already present
    pub async fn with_manifest(&self, mut archive: BackupArchive) -> Result<BackupArchive> {
        if archive.manifest.is_none() {
            archive.manifest = Some(self.load_manifest(&archive).await?);
        }
        Ok(archive)
    }

    /// Remove an archive with its payload. Either every file goes or none does.
    pub async fn delete(&self, archive: &BackupArchive) -> Result<()> {
        let payload = if archive.is_mirror() {
            archive.path.clone()
        } else {
            payload_path(&archive.destination, &archive.id)
        };
        self.remove_files(archive, Some(payload)).await
    }

    /// Remove only the record of an archive, leaving its payload (mirror trees are shared)
    pub async fn forget(&self, archive: &BackupArchive) -> Result<()> {
        self.remove_files(archive, None).await
    }

    async fn remove_files(&self, archive: &BackupArchive, payload: Option<PathBuf>) -> Result<()> {
        let destination = &archive.destination;
        let _guard = self.lock(destination).await;

        let meta = meta_path(destination, &archive.id);
        if !tokio::fs::try_exists(&meta).await.unwrap_or(false) {
            return Err(EngineError::ArchiveNotFound(archive.id.clone()));
        }

        // Metadata first, so listing stops reporting the archive immediately
        let mut targets = vec![meta, manifest_path(destination, &archive.id)];
        targets.extend(payload);

        let mut renamed: Vec<(PathBuf, PathBuf)> = Vec::new();
        for target in targets {
            if !tokio::fs::try_exists(&target).await.unwrap_or(false) {
                continue;
            }
            let doomed = with_suffix(&target, DELETING_SUFFIX);
            if let Err(e) = tokio::fs::rename(&target, &doomed).await {
                for (original, moved) in renamed.iter().rev() {
                    if let Err(undo) = tokio::fs::rename(moved, original).await {
                        warn!(path = %original.display(), "Failed to roll back deletion: {}", undo);
                    }
                }
                return Err(EngineError::destination(&target, e));
            }
            renamed.push((target, doomed));
        }

        for (_, doomed) in renamed {
            if let Err(e) = remove_path(&doomed).await {
                warn!(path = %doomed.display(), "Deferred removal to next listing: {}", e);
            }
        }

        info!(archive_id = %archive.id, "Deleted archive");
        Ok(())
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(suffix);
    PathBuf::from(raw)
}

async fn remove_path(path: &Path) -> std::io::Result<()> {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let temp = with_suffix(path, ".tmp");
    tokio::fs::write(&temp, &bytes)
        .await
        .map_err(|e| EngineError::destination(&temp, e))?;
    tokio::fs::rename(&temp, path)
        .await
        .map_err(|e| EngineError::destination(path, e))
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}
