//! Custom error types for the backup engine.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("A backup or restore is already in progress")]
    JobAlreadyRunning,

    #[error("Destination unavailable: {}: {source}", path.display())]
    DestinationUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Snapshot unavailable: {0}")]
    SnapshotUnavailable(String),

    #[error("Restore chain of archive {archive_id} is broken: {reason}")]
    BrokenChain { archive_id: String, reason: String },

    #[error("Archive not found: {0}")]
    ArchiveNotFound(String),

    #[error("Archive is in use by the running restore: {0}")]
    ArchiveInUse(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Invalid password for encrypted archive")]
    InvalidPassword,

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Invalid exclude pattern: {0}")]
    Pattern(#[from] globset::Error),

    #[error("System image error: {0}")]
    Imaging(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Schedule error: {0}")]
    Schedule(String),

    #[error("Background task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl EngineError {
    /// Stable short code used in `BackupError` records and API responses
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "CONFIG",
            EngineError::Io(_) => "IO",
            EngineError::Serialization(_) => "SERIALIZATION",
            EngineError::InvalidJob(_) => "INVALID_JOB",
            EngineError::JobAlreadyRunning => "JOB_ALREADY_RUNNING",
            EngineError::DestinationUnavailable { .. } => "DESTINATION_UNAVAILABLE",
            EngineError::SnapshotUnavailable(_) => "SNAPSHOT_UNAVAILABLE",
            EngineError::BrokenChain { .. } => "BROKEN_CHAIN",
            EngineError::ArchiveNotFound(_) => "ARCHIVE_NOT_FOUND",
            EngineError::ArchiveInUse(_) => "ARCHIVE_IN_USE",
            EngineError::Encryption(_) => "ENCRYPTION",
            EngineError::InvalidPassword => "INVALID_PASSWORD",
            EngineError::Compression(_) => "COMPRESSION",
            EngineError::Pattern(_) => "INVALID_PATTERN",
            EngineError::Imaging(_) => "IMAGING",
            EngineError::Unsupported(_) => "UNSUPPORTED",
            EngineError::Schedule(_) => "SCHEDULE",
            EngineError::TaskJoin(_) => "TASK_FAILED",
        }
    }

    pub fn destination(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::DestinationUnavailable {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
