//! Outcome of a backup, restore, verification or delete run.

use crate::store::archive::BackupArchive;
use crate::transfer::progress::{format_bytes, format_duration};
use crate::utils::errors::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    PartialSuccess,
    Verifying,
}

impl BackupStatus {
    /// Final status from per-item counters.
    /// Cancellation wins; otherwise any failure with zero successes is `Failed`.
    pub fn from_counts(processed: usize, failed: usize, cancelled: bool) -> Self {
        if cancelled {
            BackupStatus::Cancelled
        } else if failed > 0 && processed == 0 {
            BackupStatus::Failed
        } else if failed > 0 {
            BackupStatus::PartialSuccess
        } else {
            BackupStatus::Completed
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BackupStatus::Completed | BackupStatus::PartialSuccess)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupErrorKind {
    Read,
    Write,
    Enumeration,
    Snapshot,
    Conflict,
    Mismatch,
    Missing,
    Retention,
    Fatal,
}

/// A single recorded problem, usually tied to one file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupError {
    pub kind: BackupErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl BackupError {
    pub fn new(kind: BackupErrorKind, path: Option<&Path>, message: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.map(Path::to_path_buf),
            message: message.into(),
            code: None,
        }
    }

    /// Record an I/O failure against a path, keeping the OS error kind as code
    pub fn io(kind: BackupErrorKind, path: &Path, err: &std::io::Error) -> Self {
        Self {
            kind,
            path: Some(path.to_path_buf()),
            message: err.to_string(),
            code: Some(format!("{:?}", err.kind())),
        }
    }

    pub fn fatal(err: &EngineError) -> Self {
        Self {
            kind: BackupErrorKind::Fatal,
            path: None,
            message: err.to_string(),
            code: Some(err.code().to_string()),
        }
    }
}

impl std::fmt::Display for BackupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}: {}", path.display(), self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Outcome of re-hashing an archive against its manifest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationReport {
    pub checked_files: usize,
    pub checked_bytes: u64,
    /// Only stored bytes could be checked (encrypted archive without key)
    pub stored_only: bool,
    pub mismatches: Vec<BackupError>,
}

impl VerificationReport {
    pub fn is_ok(&self) -> bool {
        self.mismatches.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupResult {
    pub success: bool,
    pub status: BackupStatus,
    pub message: String,
    pub total_files: usize,
    pub total_bytes: u64,
    pub processed_files: usize,
    pub processed_bytes: u64,
    pub skipped_files: usize,
    pub skipped_bytes: u64,
    pub failed_files: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
    pub errors: Vec<BackupError>,
    pub warnings: Vec<BackupError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<BackupArchive>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted_archives: Vec<String>,
}

impl BackupResult {
    /// Empty result for a run starting now
    pub fn started() -> Self {
        let now = Utc::now();
        Self {
            success: false,
            status: BackupStatus::Running,
            message: String::new(),
            total_files: 0,
            total_bytes: 0,
            processed_files: 0,
            processed_bytes: 0,
            skipped_files: 0,
            skipped_bytes: 0,
            failed_files: 0,
            started_at: now,
            finished_at: now,
            duration: Duration::ZERO,
            errors: Vec::new(),
            warnings: Vec::new(),
            verification: None,
            archive: None,
            deleted_archives: Vec::new(),
        }
    }

    /// Close the result with a final status and message
    pub fn finish(mut self, status: BackupStatus, message: impl Into<String>) -> Self {
        self.finished_at = Utc::now();
        self.duration = (self.finished_at - self.started_at).to_std().unwrap_or_default();
        self.status = status;
        self.success = status.is_success()
            && self.verification.as_ref().map_or(true, VerificationReport::is_ok);
        self.message = message.into();
        self
    }

    /// Close the result because of a fatal error
    pub fn fail(mut self, err: &EngineError) -> Self {
        self.errors.push(BackupError::fatal(err));
        self.finish(BackupStatus::Failed, err.to_string())
    }

    /// Caller-facing summary with the error list capped at `limit` entries
    pub fn summary(&self, limit: usize) -> String {
        let mut out = format!(
            "{:?}: {} ({} of {} files, {}, {} skipped, {} failed, {})",
            self.status,
            self.message,
            self.processed_files,
            self.total_files,
            format_bytes(self.processed_bytes),
            self.skipped_files,
            self.failed_files,
            format_duration(self.duration.as_secs()),
        );
        for err in self.errors.iter().take(limit) {
            out.push_str("\n  - ");
            out.push_str(&err.to_string());
        }
        if self.errors.len() > limit {
            out.push_str(&format!("\n  ... and {} more", self.errors.len() - limit));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_counts() {
        assert_eq!(BackupStatus::from_counts(3, 0, false), BackupStatus::Completed);
        assert_eq!(BackupStatus::from_counts(2, 1, false), BackupStatus::PartialSuccess);
        assert_eq!(BackupStatus::from_counts(0, 3, false), BackupStatus::Failed);
        assert_eq!(BackupStatus::from_counts(0, 0, false), BackupStatus::Completed);
        assert_eq!(BackupStatus::from_counts(2, 1, true), BackupStatus::Cancelled);
    }

    #[test]
    fn test_finish_marks_success() {
        let result = BackupResult::started().finish(BackupStatus::PartialSuccess, "done");
        assert!(result.success);
        assert!(result.finished_at >= result.started_at);

        let mut result = BackupResult::started();
        result.verification = Some(VerificationReport {
            mismatches: vec![BackupError::new(BackupErrorKind::Mismatch, None, "bad")],
            ..Default::default()
        });
        let result = result.finish(BackupStatus::Completed, "verify failed");
        assert!(!result.success);
        assert_eq!(result.status, BackupStatus::Completed);
    }

    #[test]
    fn test_summary_caps_errors() {
        let mut result = BackupResult::started();
        for i in 0..7 {
            result.errors.push(BackupError::new(
                BackupErrorKind::Read,
                Some(Path::new(&format!("/data/f{}", i))),
                "denied",
            ));
        }
        let summary = result.finish(BackupStatus::PartialSuccess, "done").summary(5);
        assert!(summary.contains("/data/f4"));
        assert!(!summary.contains("/data/f5"));
        assert!(summary.contains("and 2 more"));
    }

    #[test]
    fn test_fail_records_fatal_error() {
        let result = BackupResult::started().fail(&EngineError::JobAlreadyRunning);
        assert_eq!(result.status, BackupStatus::Failed);
        assert!(!result.success);
        assert_eq!(result.errors[0].code.as_deref(), Some("JOB_ALREADY_RUNNING"));
    }
}
