//! Restore chains: an archive plus the parents it was diffed against.

use crate::executor::manifest::{BackupFileEntry, BackupManifest};
use crate::job::BackupType;
use crate::store::{ArchiveStore, BackupArchive};
use crate::utils::errors::{EngineError, Result};
use std::collections::{BTreeMap, HashSet};

/// One file of the merged view and the archive holding its bytes
#[derive(Debug, Clone)]
pub struct MergedEntry {
    pub entry: BackupFileEntry,
    pub archive_id: String,
}

/// Walk parent links back to the base Full archive.
/// Returns the chain oldest first, each archive with its manifest attached.
/// Fails before anything else happens when a parent is missing, the links
/// loop, or the chain does not start with a Full archive.
pub async fn resolve_chain(store: &ArchiveStore, archive: &BackupArchive) -> Result<Vec<BackupArchive>> {
    let broken = |reason: String| EngineError::BrokenChain {
        archive_id: archive.id.clone(),
        reason,
    };

    let mut chain = vec![store.with_manifest(archive.clone()).await?];
    let mut seen = HashSet::from([archive.id.clone()]);

    loop {
        let current = chain.last().ok_or_else(|| broken("empty chain".into()))?;
        match current.backup_type {
            BackupType::Incremental | BackupType::Differential => {}
            _ => break,
        }

        let parent_id = current
            .parent_id
            .clone()
            .ok_or_else(|| broken(format!("{} has no parent", current.id)))?;
        if !seen.insert(parent_id.clone()) {
            return Err(broken(format!("cycle at {}", parent_id)));
        }

        let parent = match store.load(&current.destination, &parent_id).await {
            Ok(parent) => parent,
            Err(EngineError::ArchiveNotFound(_)) => {
                return Err(broken(format!("parent {} is missing", parent_id)))
            }
            Err(e) => return Err(e),
        };
        chain.push(store.with_manifest(parent).await?);
    }

    chain.reverse();
    if chain.len() > 1 && chain[0].backup_type != BackupType::Full {
        return Err(broken(format!("chain starts with a {} archive", chain[0].backup_type)));
    }
    Ok(chain)
}

/// Merge manifests oldest to newest: deletions recorded by an increment drop
/// the path, then its entries override older ones.
pub fn merge(manifests: &[&BackupManifest]) -> BTreeMap<String, MergedEntry> {
    let mut merged = BTreeMap::new();
    for manifest in manifests {
        for deleted in manifest.deleted_paths() {
            merged.remove(&deleted);
        }
        for entry in &manifest.files {
            merged.insert(
                entry.relative_path.clone(),
                MergedEntry {
                    entry: entry.clone(),
                    archive_id: manifest.backup_id.clone(),
                },
            );
        }
    }
    merged
}

/// Merged view of a resolved chain
pub fn merge_chain(chain: &[BackupArchive]) -> BTreeMap<String, MergedEntry> {
    let manifests: Vec<&BackupManifest> = chain.iter().filter_map(|a| a.manifest.as_ref()).collect();
    merge(&manifests)
}
