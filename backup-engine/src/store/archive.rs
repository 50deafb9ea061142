//! Archive metadata record.

use crate::crypto::{DerivedKey, EncryptionInfo};
use crate::executor::codec::FrameCodec;
use crate::executor::manifest::BackupManifest;
use crate::job::{BackupCompression, BackupType};
use crate::result::BackupStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Persisted record of one archive, indexed for history listing.
/// The manifest lives in its own file and is only attached on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupArchive {
    pub id: String,
    pub name: String,
    pub job_id: Uuid,
    pub backup_type: BackupType,
    /// Directory holding the archive files
    pub destination: PathBuf,
    /// Payload container, or mirror tree root
    pub path: PathBuf,
    pub created: DateTime<Utc>,
    /// Sum of original file sizes
    pub total_size: u64,
    pub file_count: usize,
    /// Bytes occupied at the destination
    #[serde(default)]
    pub stored_size: u64,
    pub compression: BackupCompression,
    pub is_encrypted: bool,
    pub is_verified: bool,
    /// Status of the run that produced the archive
    pub status: BackupStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub source_paths: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionInfo>,

    #[serde(skip)]
    pub manifest: Option<BackupManifest>,
}

impl BackupArchive {
    /// Holds a usable capture that later runs may diff against
    pub fn is_usable_base(&self) -> bool {
        matches!(self.status, BackupStatus::Completed | BackupStatus::PartialSuccess)
            && matches!(
                self.backup_type,
                BackupType::Full | BackupType::Incremental | BackupType::Differential
            )
    }

    pub fn is_mirror(&self) -> bool {
        self.backup_type == BackupType::Mirror
    }

    /// Codec that decodes this archive's frames
    pub fn codec(&self, key: Option<Arc<DerivedKey>>) -> FrameCodec {
        if self.is_mirror() {
            FrameCodec::identity()
        } else {
            FrameCodec::new(self.compression.zstd_level(), key)
        }
    }

    /// Counts of the attached manifest agree with the record
    pub fn matches_manifest(&self) -> bool {
        self.manifest
            .as_ref()
            .is_some_and(|m| m.file_count() == self.file_count && m.total_size() == self.total_size)
    }
}
