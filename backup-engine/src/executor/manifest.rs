//! Manifest types and change detection.
//!
//! A manifest records every file captured by one archive with its size,
//! mtime, content hash and where its bytes live, allowing later runs to diff
//! against it and only transfer changed files.

use crate::fs::metadata::FileAttributes;
use crate::fs::walker::FileInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

/// Metadata key holding the JSON list of paths deleted since the base archive
pub const META_DELETED: &str = "deleted";
/// Metadata key set when a run fell back to a different type than requested
pub const META_REQUESTED_TYPE: &str = "requested_type";

/// Where the bytes of one entry are stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredLocation {
    /// Byte range of length-prefixed frames inside the payload container
    Packed { offset: u64, length: u64 },
    /// Plain file inside a mirror tree, relative to the tree root
    Tree { path: String },
    /// The payload file itself, unframed (system images)
    Raw,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupFileEntry {
    pub relative_path: String,
    pub original_path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
    /// SHA-256 of the original content, lowercase hex
    pub hash: String,
    pub attributes: FileAttributes,
    pub location: StoredLocation,
    /// SHA-256 of the bytes as stored at `location`
    pub stored_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub backup_id: String,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub files: Vec<BackupFileEntry>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl BackupManifest {
    pub fn new(backup_id: impl Into<String>, parent_id: Option<String>) -> Self {
        Self {
            backup_id: backup_id.into(),
            created: Utc::now(),
            parent_id,
            files: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Paths recorded as deleted relative to the base archive
    pub fn deleted_paths(&self) -> Vec<String> {
        self.metadata
            .get(META_DELETED)
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }

    pub fn set_deleted_paths(&mut self, deleted: &[String]) -> serde_json::Result<()> {
        if deleted.is_empty() {
            self.metadata.remove(META_DELETED);
        } else {
            self.metadata
                .insert(META_DELETED.to_string(), serde_json::to_string(deleted)?);
        }
        Ok(())
    }

    pub fn find(&self, relative_path: &str) -> Option<&BackupFileEntry> {
        self.files.iter().find(|f| f.relative_path == relative_path)
    }
}

/// Result of diffing scanned files against a baseline view
#[derive(Debug, Default)]
pub struct ChangeSet {
    /// Files to transfer (new or modified), in scan order
    pub selected: Vec<FileInfo>,
    pub unchanged_files: usize,
    pub unchanged_bytes: u64,
    /// Baseline paths no longer present on the source, sorted
    pub deleted: Vec<String>,
}

impl ChangeSet {
    /// Every scanned file is selected
    pub fn everything(files: Vec<FileInfo>) -> Self {
        Self {
            selected: files,
            ..Default::default()
        }
    }

    pub fn selected_bytes(&self) -> u64 {
        self.selected.iter().map(|f| f.size).sum()
    }
}

/// Compare scanned files against a baseline using size + mtime.
/// Hashes are not compared here so unchanged files are never read.
pub fn diff_against(files: Vec<FileInfo>, baseline: &BTreeMap<String, BackupFileEntry>) -> ChangeSet {
    let mut change_set = ChangeSet::default();
    let mut seen = HashSet::with_capacity(files.len());

    for file in files {
        seen.insert(file.relative_path.clone());

        if let Some(entry) = baseline.get(&file.relative_path) {
            if entry.size == file.size && entry.modified == file.modified {
                change_set.unchanged_files += 1;
                change_set.unchanged_bytes += file.size;
                continue;
            }
        }
        change_set.selected.push(file);
    }

    change_set.deleted = baseline
        .keys()
        .filter(|path| !seen.contains(*path))
        .cloned()
        .collect();

    change_set
}
