//! Restore Engine: rebuilds files from an archive chain.
//!
//! Restores happen in two steps. [`prepare`] resolves the chain and unlocks
//! every encrypted archive in it, so a broken chain or a wrong password fails
//! before the destination is touched. [`execute`] then writes the merged view.

pub mod chain;

use crate::crypto::DerivedKey;
use crate::executor::writer::temp_sibling;
use crate::fs::metadata::set_modified;
use crate::result::{BackupError, BackupErrorKind, BackupResult, BackupStatus, VerificationReport};
use crate::store::payload::read_entry;
use crate::store::{ArchiveStore, BackupArchive};
use crate::transfer::progress::{ProgressPhase, ProgressTracker};
use crate::utils::errors::{EngineError, Result};
use chain::{merge_chain, resolve_chain, MergedEntry};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreOptions {
    /// Replace files that already exist at the target
    pub overwrite_existing: bool,
    /// Re-apply the recorded permission bits
    pub preserve_permissions: bool,
    /// Write each file back to its original absolute path
    pub restore_to_original: bool,
    /// Root to restore under instead of the requested destination
    pub alternate_destination: Option<PathBuf>,
    /// Relative paths (files or directories) to restore; `None` restores everything
    pub selective_files: Option<Vec<String>>,
    pub verify_after_restore: bool,
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

impl RestoreOptions {
    /// Whether an entry is part of the selection
    pub fn selects(&self, entry: &MergedEntry) -> bool {
        let Some(selection) = &self.selective_files else {
            return true;
        };
        let relative = entry.entry.relative_path.as_str();
        let original = entry.entry.original_path.to_string_lossy();
        selection.iter().any(|wanted| {
            let wanted = wanted.trim_end_matches('/');
            [relative, original.as_ref()].iter().any(|candidate| {
                *candidate == wanted
                    || candidate
                        .strip_prefix(wanted)
                        .is_some_and(|rest| rest.starts_with('/'))
            })
        })
    }
}

/// A resolved, unlocked restore ready to write
pub struct RestorePlan {
    pub archive: BackupArchive,
    chain: Vec<BackupArchive>,
    keys: HashMap<String, Arc<DerivedKey>>,
}

impl RestorePlan {
    /// Ids of every archive the restore reads from
    pub fn archive_ids(&self) -> Vec<String> {
        self.chain.iter().map(|a| a.id.clone()).collect()
    }

    pub fn chain(&self) -> &[BackupArchive] {
        &self.chain
    }
}

/// Resolve the chain of `archive` and derive the key of each encrypted link
pub async fn prepare(store: &ArchiveStore, archive: &BackupArchive, options: &RestoreOptions) -> Result<RestorePlan> {
    let chain = resolve_chain(store, archive).await?;

    let locked: Vec<_> = chain
        .iter()
        .filter(|a| a.is_encrypted)
        .map(|a| {
            a.encryption
                .clone()
                .map(|info| (a.id.clone(), info))
                .ok_or_else(|| EngineError::Encryption(format!("archive {} has no encryption header", a.id)))
        })
        .collect::<Result<_>>()?;

    let mut keys = HashMap::new();
    if !locked.is_empty() {
        let password = options.password.clone().ok_or(EngineError::InvalidPassword)?;
        keys = tokio::task::spawn_blocking(move || {
            locked
                .into_iter()
                .map(|(id, info)| info.unlock(&password).map(|key| (id, Arc::new(key))))
                .collect::<Result<HashMap<_, _>>>()
        })
        .await??;
    }

    Ok(RestorePlan {
        archive: archive.clone(),
        chain,
        keys,
    })
}

/// Write the merged view of a prepared chain under `destination`
pub async fn execute(
    plan: RestorePlan,
    destination: PathBuf,
    options: RestoreOptions,
    tracker: ProgressTracker,
    cancel_token: CancellationToken,
) -> Result<(BackupResult, ProgressTracker)> {
    let root = options.alternate_destination.clone().unwrap_or(destination);
    let (result, tracker) =
        tokio::task::spawn_blocking(move || restore_blocking(&plan, &root, &options, tracker, &cancel_token)).await?;
    Ok((result, tracker))
}

fn restore_blocking(
    plan: &RestorePlan,
    root: &Path,
    options: &RestoreOptions,
    mut tracker: ProgressTracker,
    cancel_token: &CancellationToken,
) -> (BackupResult, ProgressTracker) {
    let mut result = BackupResult::started();
    let archives: HashMap<&str, &BackupArchive> = plan.chain.iter().map(|a| (a.id.as_str(), a)).collect();
    let entries: Vec<MergedEntry> = merge_chain(&plan.chain)
        .into_values()
        .filter(|e| options.selects(e))
        .collect();

    result.total_files = entries.len();
    result.total_bytes = entries.iter().map(|e| e.entry.size).sum();
    tracker.phase(ProgressPhase::Restoring, format!("Restoring {}", plan.archive.id));
    tracker.set_totals(result.total_files, result.total_bytes);

    let mut verification = options.verify_after_restore.then(VerificationReport::default);
    let mut cancelled = false;
    let mut fatal = false;

    for merged in &entries {
        if cancel_token.is_cancelled() {
            info!(archive_id = %plan.archive.id, "Restore cancelled");
            cancelled = true;
            break;
        }

        let entry = &merged.entry;
        let target = match target_path(root, options.restore_to_original, merged) {
            Ok(target) => target,
            Err(e) => {
                result.errors.push(e);
                result.failed_files += 1;
                tracker.file_failed();
                continue;
            }
        };

        if target.exists() && !options.overwrite_existing {
            debug!(path = %target.display(), "Skipping existing file");
            result.warnings.push(BackupError::new(
                BackupErrorKind::Conflict,
                Some(&target),
                "file exists and overwrite is disabled",
            ));
            result.skipped_files += 1;
            result.skipped_bytes += entry.size;
            tracker.file_skipped();
            continue;
        }

        let Some(archive) = archives.get(merged.archive_id.as_str()) else {
            result.errors.push(BackupError::new(
                BackupErrorKind::Missing,
                Some(&target),
                format!("archive {} is not part of the chain", merged.archive_id),
            ));
            result.failed_files += 1;
            tracker.file_failed();
            continue;
        };

        tracker.start_file(&entry.relative_path, entry.size);
        let key = plan.keys.get(&archive.id).cloned();
        match restore_file(archive, merged, &target, options, key, &mut tracker) {
            Ok(()) => {
                result.processed_files += 1;
                result.processed_bytes += entry.size;
                tracker.file_done(entry.size);

                if let Some(report) = verification.as_mut() {
                    check_restored(&target, merged, report);
                }
            }
            Err(e @ EngineError::DestinationUnavailable { .. }) => {
                error!(path = %target.display(), "Restore destination unavailable, aborting: {}", e);
                result.errors.push(BackupError::fatal(&e));
                result.failed_files += 1;
                tracker.file_failed();
                fatal = true;
                break;
            }
            Err(e) => {
                warn!(path = %target.display(), "Failed to restore file: {}", e);
                let kind = match e {
                    EngineError::Io(ref io) if io.kind() == std::io::ErrorKind::NotFound => BackupErrorKind::Missing,
                    _ => BackupErrorKind::Read,
                };
                let mut error = BackupError::new(kind, Some(&target), e.to_string());
                error.code = Some(e.code().to_string());
                result.errors.push(error);
                result.failed_files += 1;
                tracker.file_failed();
            }
        }
    }
    tracker.flush();

    result.verification = verification;
    let status = if fatal {
        BackupStatus::Failed
    } else {
        BackupStatus::from_counts(result.processed_files, result.failed_files, cancelled)
    };
    let message = format!(
        "Restored {} of {} files to {}",
        result.processed_files,
        result.total_files,
        root.display()
    );
    info!(archive_id = %plan.archive.id, status = ?status, "{}", message);
    (result.finish(status, message), tracker)
}

/// Where an entry lands; relative paths may not escape the restore root
fn target_path(root: &Path, to_original: bool, merged: &MergedEntry) -> std::result::Result<PathBuf, BackupError> {
    if to_original {
        return Ok(merged.entry.original_path.clone());
    }
    let relative = Path::new(&merged.entry.relative_path);
    if relative.components().all(|c| matches!(c, Component::Normal(_))) {
        Ok(root.join(relative))
    } else {
        Err(BackupError::new(
            BackupErrorKind::Write,
            Some(relative),
            "entry path escapes the restore destination",
        ))
    }
}

fn restore_file(
    archive: &BackupArchive,
    merged: &MergedEntry,
    target: &Path,
    options: &RestoreOptions,
    key: Option<Arc<DerivedKey>>,
    tracker: &mut ProgressTracker,
) -> Result<()> {
    let entry = &merged.entry;
    let destination = |e: std::io::Error| EngineError::destination(target, e);

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(destination)?;
    }
    let temp = temp_sibling(target);
    let mut writer = BufWriter::new(File::create(&temp).map_err(destination)?);
    let codec = archive.codec(key);

    let outcome = read_entry(archive, entry, Some(&codec), |chunk| {
        writer.write_all(chunk).map_err(destination)?;
        tracker.chunk(chunk.len() as u64);
        Ok(())
    })
    .and_then(|digest| {
        writer.flush().map_err(destination)?;
        match digest.content {
            Some((hash, _)) if hash == entry.hash => Ok(()),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("content of {} does not match the manifest", entry.relative_path),
            )
            .into()),
        }
    });
    drop(writer);

    if let Err(e) = outcome {
        let _ = std::fs::remove_file(&temp);
        return Err(e);
    }

    set_modified(&temp, entry.modified).map_err(destination)?;
    if options.preserve_permissions {
        entry.attributes.apply_permissions(&temp).map_err(destination)?;
    }
    std::fs::rename(&temp, target).map_err(destination)?;
    Ok(())
}

/// Re-hash a restored file from disk
fn check_restored(target: &Path, merged: &MergedEntry, report: &mut VerificationReport) {
    let hashed = File::open(target).and_then(|mut file| {
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    });

    match hashed {
        Ok(hash) if hash == merged.entry.hash => {
            report.checked_files += 1;
            report.checked_bytes += merged.entry.size;
        }
        Ok(_) => report.mismatches.push(BackupError::new(
            BackupErrorKind::Mismatch,
            Some(target),
            "restored file does not match the manifest hash",
        )),
        Err(e) => report.mismatches.push(BackupError::io(BackupErrorKind::Missing, target, &e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::manifest::{BackupFileEntry, StoredLocation};
    use crate::fs::metadata::FileAttributes;
    use chrono::Utc;

    fn merged(rel: &str) -> MergedEntry {
        MergedEntry {
            entry: BackupFileEntry {
                relative_path: rel.into(),
                original_path: PathBuf::from("/data").join(rel),
                size: 1,
                modified: Utc::now(),
                hash: String::new(),
                attributes: FileAttributes::default(),
                location: StoredLocation::Packed { offset: 0, length: 0 },
                stored_hash: String::new(),
            },
            archive_id: "a1".into(),
        }
    }

    #[test]
    fn test_selection_by_file_and_directory() {
        let options = RestoreOptions {
            selective_files: Some(vec!["docs/".into(), "notes.txt".into()]),
            ..Default::default()
        };
        assert!(options.selects(&merged("docs/a.txt")));
        assert!(options.selects(&merged("docs/sub/b.txt")));
        assert!(options.selects(&merged("notes.txt")));
        assert!(!options.selects(&merged("docsx/a.txt")));
        assert!(!options.selects(&merged("other/notes.txt")));

        let absolute = RestoreOptions {
            selective_files: Some(vec!["/data/docs".into()]),
            ..Default::default()
        };
        assert!(absolute.selects(&merged("docs/a.txt")));
        assert!(RestoreOptions::default().selects(&merged("anything")));
    }

    #[test]
    fn test_target_path() {
        let root = Path::new("/restore");
        assert_eq!(
            target_path(root, false, &merged("docs/a.txt")).unwrap(),
            PathBuf::from("/restore/docs/a.txt")
        );
        assert_eq!(
            target_path(root, true, &merged("docs/a.txt")).unwrap(),
            PathBuf::from("/data/docs/a.txt")
        );
        assert!(target_path(root, false, &merged("../etc/passwd")).is_err());
    }
}
