//! Verifier: re-reads an archive and compares it against its manifest.
//!
//! Verification never writes to the destination. Encrypted archives checked
//! without their key only get their stored bytes compared.

use crate::crypto::DerivedKey;
use crate::executor::manifest::BackupFileEntry;
use crate::result::{BackupError, BackupErrorKind, VerificationReport};
use crate::store::payload::read_entry;
use crate::store::BackupArchive;
use crate::transfer::progress::{ProgressPhase, ProgressTracker};
use crate::utils::errors::{EngineError, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// Verify an archive whose manifest is attached
pub async fn verify_archive(
    archive: BackupArchive,
    key: Option<Arc<DerivedKey>>,
    tracker: ProgressTracker,
) -> Result<(VerificationReport, ProgressTracker)> {
    let (report, tracker) = tokio::task::spawn_blocking(move || verify_blocking(&archive, key, tracker)).await?;
    Ok((report, tracker))
}

fn verify_blocking(
    archive: &BackupArchive,
    key: Option<Arc<DerivedKey>>,
    mut tracker: ProgressTracker,
) -> (VerificationReport, ProgressTracker) {
    let mut report = VerificationReport::default();
    let Some(manifest) = archive.manifest.as_ref() else {
        report.mismatches.push(BackupError::new(
            BackupErrorKind::Missing,
            Some(&archive.path),
            "archive manifest is not loaded",
        ));
        return (report, tracker);
    };

    let stored_only = archive.is_encrypted && key.is_none();
    let codec = archive.codec(key);
    report.stored_only = stored_only;

    tracker.phase(ProgressPhase::Verifying, format!("Verifying {}", archive.id));
    tracker.set_totals(manifest.file_count(), manifest.total_size());

    if !archive.matches_manifest() {
        report.mismatches.push(BackupError::new(
            BackupErrorKind::Mismatch,
            None,
            format!(
                "record lists {} files / {} bytes, manifest holds {} / {}",
                archive.file_count,
                archive.total_size,
                manifest.file_count(),
                manifest.total_size()
            ),
        ));
    }

    if !archive.path.exists() {
        warn!(archive_id = %archive.id, path = %archive.path.display(), "Archive payload is missing");
        for entry in &manifest.files {
            report
                .mismatches
                .push(BackupError::new(BackupErrorKind::Missing, Some(&entry.original_path), "payload is missing"));
            tracker.file_failed();
        }
        tracker.flush();
        return (report, tracker);
    }

    for entry in &manifest.files {
        tracker.start_file(&entry.relative_path, entry.size);
        let codec = (!stored_only).then_some(&codec);

        match read_entry(archive, entry, codec, |_| Ok(())) {
            Ok(digest) => match check_digest(entry, &digest.stored_hash, digest.content.as_ref()) {
                Some(problem) => {
                    report.mismatches.push(problem);
                    tracker.file_failed();
                }
                None => {
                    report.checked_files += 1;
                    report.checked_bytes += entry.size;
                    tracker.file_done(entry.size);
                }
            },
            Err(EngineError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                report.mismatches.push(BackupError::io(BackupErrorKind::Missing, &entry.original_path, &e));
                tracker.file_failed();
            }
            Err(e) => {
                let mut problem = BackupError::new(BackupErrorKind::Mismatch, Some(&entry.original_path), e.to_string());
                problem.code = Some(e.code().to_string());
                report.mismatches.push(problem);
                tracker.file_failed();
            }
        }
    }
    tracker.flush();

    info!(
        archive_id = %archive.id,
        checked = report.checked_files,
        mismatches = report.mismatches.len(),
        stored_only,
        "Verification finished"
    );
    (report, tracker)
}

fn check_digest(entry: &BackupFileEntry, stored_hash: &str, content: Option<&(String, u64)>) -> Option<BackupError> {
    let mismatch = |message: String| Some(BackupError::new(BackupErrorKind::Mismatch, Some(&entry.original_path), message));

    if stored_hash != entry.stored_hash {
        return mismatch("stored bytes do not match the manifest".into());
    }
    if let Some((hash, size)) = content {
        if *size != entry.size {
            return mismatch(format!("restored size {} differs from recorded {}", size, entry.size));
        }
        if *hash != entry.hash {
            return mismatch("content hash does not match the manifest".into());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::manifest::StoredLocation;
    use crate::fs::metadata::FileAttributes;
    use crate::job::{BackupCompression, BackupType};
    use crate::result::BackupStatus;
    use crate::store::payload_path;
    use chrono::Utc;
    use sha2::{Digest, Sha256};
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tempfile::TempDir;

    fn sha(bytes: &[u8]) -> String {
        format!("{:x}", Sha256::digest(bytes))
    }

    /// Payload with one stored (uncompressed) file
    fn packed_archive(dest: &Path, content: &[u8]) -> BackupArchive {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(content.len() as u32).to_le_bytes());
        payload.extend_from_slice(content);
        let path = payload_path(dest, "a1");
        std::fs::write(&path, &payload).unwrap();

        let mut manifest = crate::executor::manifest::BackupManifest::new("a1", None);
        manifest.files.push(BackupFileEntry {
            relative_path: "data/a.txt".into(),
            original_path: PathBuf::from("/data/a.txt"),
            size: content.len() as u64,
            modified: Utc::now(),
            hash: sha(content),
            attributes: FileAttributes::default(),
            location: StoredLocation::Packed {
                offset: 0,
                length: payload.len() as u64,
            },
            stored_hash: sha(&payload),
        });

        BackupArchive {
            id: "a1".into(),
            name: "job".into(),
            job_id: uuid::Uuid::nil(),
            backup_type: BackupType::Full,
            destination: dest.to_path_buf(),
            path,
            created: Utc::now(),
            total_size: manifest.total_size(),
            file_count: manifest.file_count(),
            stored_size: payload.len() as u64,
            compression: BackupCompression::None,
            is_encrypted: false,
            is_verified: false,
            status: BackupStatus::Completed,
            description: None,
            source_paths: Vec::new(),
            parent_id: None,
            encryption: None,
            manifest: Some(manifest),
        }
    }

    fn tracker() -> ProgressTracker {
        ProgressTracker::new(None, Duration::ZERO, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_intact_archive_verifies() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let archive = packed_archive(dir.path(), b"hello world");

        let (report, tracker) = verify_archive(archive, None, tracker()).await?;
        assert!(report.is_ok(), "{:?}", report.mismatches);
        assert_eq!(report.checked_files, 1);
        assert_eq!(report.checked_bytes, 11);
        assert!(!report.stored_only);
        assert_eq!(tracker.progress().processed_files, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_corruption_is_reported_without_mutation() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let archive = packed_archive(dir.path(), b"hello world");
        let mut bytes = std::fs::read(&archive.path)?;
        bytes[6] ^= 0xff;
        std::fs::write(&archive.path, &bytes)?;

        let (report, _) = verify_archive(archive.clone(), None, tracker()).await?;
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].kind, BackupErrorKind::Mismatch);
        assert_eq!(std::fs::read(&archive.path)?, bytes);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_payload_lists_every_entry() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let archive = packed_archive(dir.path(), b"abc");
        std::fs::remove_file(&archive.path)?;

        let (report, _) = verify_archive(archive, None, tracker()).await?;
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].kind, BackupErrorKind::Missing);
        assert_eq!(report.mismatches[0].path.as_deref(), Some(Path::new("/data/a.txt")));
        Ok(())
    }

    #[tokio::test]
    async fn test_encrypted_without_key_checks_stored_bytes() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let mut archive = packed_archive(dir.path(), b"opaque");
        archive.is_encrypted = true;

        let (report, _) = verify_archive(archive, None, tracker()).await?;
        assert!(report.stored_only);
        assert!(report.is_ok());
        Ok(())
    }
}
