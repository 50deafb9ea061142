//! Configuration management for the backup engine.
//!
//! Loads configuration from an optional TOML file with environment variable
//! overrides (`BACKUP_ENGINE_<SECTION>__<KEY>`).

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub engine: EngineSection,
    pub transfer: TransferConfig,
    pub snapshot: SnapshotConfig,
    pub encryption: KdfConfig,
    pub imaging: ImagingConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Destination used for history listing when no location is given
    pub default_destination: PathBuf,

    /// JSON file holding persisted schedules
    pub schedule_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunk size in bytes (default: 1MB)
    pub chunk_size: usize,

    /// Number of files read/compressed/encrypted concurrently
    pub workers: usize,

    /// Encoded chunks a worker may run ahead of the destination writer
    pub frame_buffer: usize,

    /// Minimum interval between chunk-level progress ticks
    pub progress_interval_ms: u64,

    /// Window used for throughput and ETA estimation
    pub throughput_window_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    None,
    Btrfs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub provider: SnapshotKind,

    /// Continue with direct reads when a snapshot cannot be created
    pub allow_fallback: bool,

    /// Directory in which read-only snapshots are created
    pub snapshot_dir: PathBuf,

    /// Subvolumes eligible for snapshotting (btrfs)
    pub subvolumes: Vec<PathBuf>,
}

/// Argon2id cost parameters used when a new archive key is derived
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub memory_cost: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagingConfig {
    /// External program producing a system image; the image path is appended
    pub program: Option<String>,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            default_destination: PathBuf::from("/var/backups/backup-engine"),
            schedule_file: PathBuf::from("/var/lib/backup-engine/schedules.json"),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            workers: default_workers(),
            frame_buffer: 4,
            progress_interval_ms: 250,
            throughput_window_secs: 5,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            provider: SnapshotKind::None,
            allow_fallback: true,
            snapshot_dir: PathBuf::from("/var/lib/backup-engine/snapshots"),
            subvolumes: Vec::new(),
        }
    }
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            memory_cost: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .clamp(1, 16)
}

impl EngineConfig {
    /// Load configuration from an optional TOML file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix("BACKUP_ENGINE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| EngineError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.transfer.chunk_size == 0 {
            return Err(EngineError::Config("transfer.chunk_size must be > 0".into()));
        }
        if self.transfer.workers == 0 {
            return Err(EngineError::Config("transfer.workers must be > 0".into()));
        }
        if self.transfer.frame_buffer == 0 {
            return Err(EngineError::Config("transfer.frame_buffer must be > 0".into()));
        }
        Ok(())
    }
}
