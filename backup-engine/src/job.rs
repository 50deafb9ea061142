//! Declarative backup job description.
//!
//! A `BackupJob` is owned by the caller and only read by the engine while a
//! run is active.

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Transient and editor lock files that are never worth capturing
pub const DEFAULT_EXCLUDE_PATTERNS: &[&str] = &[
    "~$*",
    "*.tmp",
    "*.swp",
    ".~lock.*#",
    "Thumbs.db",
    ".DS_Store",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Full,
    Incremental,
    Differential,
    SystemImage,
    Mirror,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incremental",
            BackupType::Differential => "differential",
            BackupType::SystemImage => "system_image",
            BackupType::Mirror => "mirror",
        }
    }
}

impl std::fmt::Display for BackupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackupDestinationType {
    #[default]
    LocalDrive,
    ExternalDrive,
    NetworkShare,
    Cloud,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackupCompression {
    None,
    Fast,
    #[default]
    Normal,
    Maximum,
}

impl BackupCompression {
    /// zstd level for this setting, `None` when data is stored as-is
    pub fn zstd_level(&self) -> Option<i32> {
        match self {
            BackupCompression::None => None,
            BackupCompression::Fast => Some(1),
            BackupCompression::Normal => Some(3),
            BackupCompression::Maximum => Some(19),
        }
    }
}

/// Credentials for a network share destination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkCredentials {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJob {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default = "default_backup_type")]
    pub backup_type: BackupType,
    #[serde(default)]
    pub destination_type: BackupDestinationType,
    pub source_paths: Vec<PathBuf>,
    #[serde(default)]
    pub exclude_paths: Vec<PathBuf>,
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub include_hidden: bool,
    #[serde(default)]
    pub include_system: bool,
    pub destination_path: PathBuf,
    #[serde(default)]
    pub credentials: Option<NetworkCredentials>,
    #[serde(default)]
    pub compression: BackupCompression,
    #[serde(default)]
    pub encrypt: bool,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub verify_after_backup: bool,
    #[serde(default)]
    pub use_snapshot: bool,
    #[serde(default)]
    pub max_backups_to_keep: Option<u32>,
    #[serde(default)]
    pub max_age_days: Option<u32>,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_backup_type() -> BackupType {
    BackupType::Full
}

fn default_exclude_patterns() -> Vec<String> {
    DEFAULT_EXCLUDE_PATTERNS.iter().map(|p| p.to_string()).collect()
}

impl BackupJob {
    /// Create a full, unencrypted job with the default exclude patterns
    pub fn new(name: impl Into<String>, source_paths: Vec<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            backup_type: BackupType::Full,
            destination_type: BackupDestinationType::LocalDrive,
            source_paths,
            exclude_paths: Vec::new(),
            exclude_patterns: default_exclude_patterns(),
            include_hidden: false,
            include_system: false,
            destination_path: destination.into(),
            credentials: None,
            compression: BackupCompression::Normal,
            encrypt: false,
            password: None,
            verify_after_backup: false,
            use_snapshot: false,
            max_backups_to_keep: None,
            max_age_days: None,
            description: None,
        }
    }

    pub fn with_type(mut self, backup_type: BackupType) -> Self {
        self.backup_type = backup_type;
        self
    }

    /// Check the job before a run starts
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::InvalidJob("name is required".into()));
        }
        if self.name.contains(['/', '\\']) {
            return Err(EngineError::InvalidJob("name must not contain path separators".into()));
        }
        if self.backup_type != BackupType::SystemImage && self.source_paths.is_empty() {
            return Err(EngineError::InvalidJob("source_paths must not be empty".into()));
        }
        if self.destination_path.as_os_str().is_empty() {
            return Err(EngineError::InvalidJob("destination_path is required".into()));
        }
        if self.encrypt && self.password.as_deref().map_or(true, str::is_empty) {
            return Err(EngineError::InvalidJob("encryption requires a password".into()));
        }
        for source in &self.source_paths {
            if self.destination_path.starts_with(source) && self.backup_type != BackupType::SystemImage {
                return Err(EngineError::InvalidJob(format!(
                    "destination {} lies inside source {}",
                    self.destination_path.display(),
                    source.display()
                )));
            }
        }
        Ok(())
    }
}
