//! Per-type capture strategies.
//!
//! A strategy picks the archive a run is diffed against, selects the files to
//! transfer, and performs any cleanup once the transfer is done.

use super::manifest::{diff_against, BackupFileEntry, ChangeSet};
use crate::fs::walker::FileInfo;
use crate::job::{BackupJob, BackupType};
use crate::restore::chain::{merge_chain, resolve_chain};
use crate::result::{BackupError, BackupErrorKind};
use crate::store::{ArchiveStore, BackupArchive};
use crate::utils::errors::Result;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::{info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStrategy {
    Full,
    Incremental,
    Differential,
    Mirror,
}

impl BackupStrategy {
    /// `None` for system images, which do not go through file capture
    pub fn for_type(backup_type: BackupType) -> Option<Self> {
        match backup_type {
            BackupType::Full => Some(BackupStrategy::Full),
            BackupType::Incremental => Some(BackupStrategy::Incremental),
            BackupType::Differential => Some(BackupStrategy::Differential),
            BackupType::Mirror => Some(BackupStrategy::Mirror),
            BackupType::SystemImage => None,
        }
    }

    pub fn backup_type(&self) -> BackupType {
        match self {
            BackupStrategy::Full => BackupType::Full,
            BackupStrategy::Incremental => BackupType::Incremental,
            BackupStrategy::Differential => BackupType::Differential,
            BackupStrategy::Mirror => BackupType::Mirror,
        }
    }

    /// Archive this run is diffed against, from `history` (newest first)
    pub fn choose_base<'a>(&self, history: &'a [BackupArchive], job_name: &str) -> Option<&'a BackupArchive> {
        let mut candidates = history
            .iter()
            .filter(|a| a.name == job_name && a.is_usable_base());
        match self {
            BackupStrategy::Incremental => candidates.next(),
            BackupStrategy::Differential => candidates.find(|a| a.backup_type == BackupType::Full),
            BackupStrategy::Full | BackupStrategy::Mirror => None,
        }
    }

    /// Files to transfer given the merged baseline (if any)
    pub fn select(&self, files: Vec<FileInfo>, baseline: Option<&BTreeMap<String, BackupFileEntry>>) -> ChangeSet {
        match (self, baseline) {
            (BackupStrategy::Incremental | BackupStrategy::Differential, Some(baseline)) => {
                diff_against(files, baseline)
            }
            _ => ChangeSet::everything(files),
        }
    }

    /// Cleanup after transfer. Mirror removes tree files without a source counterpart.
    pub fn post_transfer(&self, tree_root: &Path, source_paths: &HashSet<String>) -> Vec<BackupError> {
        match self {
            BackupStrategy::Mirror => prune_mirror(tree_root, source_paths),
            _ => Vec::new(),
        }
    }
}

/// Outcome of preparing a file-capture run
pub struct Plan {
    pub strategy: BackupStrategy,
    pub requested: BackupType,
    pub base: Option<BackupArchive>,
    pub baseline: Option<BTreeMap<String, BackupFileEntry>>,
    pub warnings: Vec<BackupError>,
}

impl Plan {
    pub fn fell_back(&self) -> bool {
        self.strategy.backup_type() != self.requested
    }
}

/// Pick the strategy and baseline for a job. Incremental and differential
/// runs without a usable base fall back to a full capture.
pub async fn plan(store: &ArchiveStore, job: &BackupJob) -> Result<Plan> {
    let requested = job.backup_type;
    let strategy = BackupStrategy::for_type(requested).unwrap_or(BackupStrategy::Full);
    let mut warnings = Vec::new();

    if !matches!(strategy, BackupStrategy::Incremental | BackupStrategy::Differential) {
        return Ok(Plan {
            strategy,
            requested,
            base: None,
            baseline: None,
            warnings,
        });
    }

    let history = store.list(&job.destination_path).await?;
    if let Some(base) = strategy.choose_base(&history, &job.name) {
        match resolve_chain(store, base).await {
            Ok(chain) => {
                info!(job = %job.name, base = %base.id, links = chain.len(), "Diffing against base archive");
                return Ok(Plan {
                    strategy,
                    requested,
                    base: Some(base.clone()),
                    baseline: Some(merged_entries(&chain)),
                    warnings,
                });
            }
            Err(e) => {
                warn!(job = %job.name, "Base archive unusable, capturing everything: {}", e);
                warnings.push(BackupError::new(
                    BackupErrorKind::Enumeration,
                    None,
                    format!("base archive {} unusable: {}", base.id, e),
                ));
            }
        }
    } else {
        info!(job = %job.name, "No base archive for {} run, capturing everything", requested);
    }

    Ok(Plan {
        strategy: BackupStrategy::Full,
        requested,
        base: None,
        baseline: None,
        warnings,
    })
}

fn merged_entries(chain: &[BackupArchive]) -> BTreeMap<String, BackupFileEntry> {
    merge_chain(chain)
        .into_iter()
        .map(|(path, merged)| (path, merged.entry))
        .collect()
}

/// Remove files under `root` whose relative path is not in `keep`, then empty directories
fn prune_mirror(root: &Path, keep: &HashSet<String>) -> Vec<BackupError> {
    let mut errors = Vec::new();

    for entry in WalkDir::new(root).min_depth(1).contents_first(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                errors.push(BackupError::new(BackupErrorKind::Write, Some(&path), e.to_string()));
                continue;
            }
        };
        let path = entry.path();

        if entry.file_type().is_dir() {
            // Only succeeds once empty
            let _ = std::fs::remove_dir(path);
            continue;
        }

        let relative = path
            .strip_prefix(root)
            .map(|p| {
                p.components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .unwrap_or_default();

        if !keep.contains(&relative) {
            if let Err(e) = std::fs::remove_file(path) {
                errors.push(BackupError::io(BackupErrorKind::Write, path, &e));
            }
        }
    }

    errors
}
