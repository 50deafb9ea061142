//! Backup Engine Library
//!
//! Backup and restore orchestration: full, incremental, differential and
//! mirror backups into local archives, chain-aware restore, verification,
//! retention and scheduling.

pub mod config;
pub mod crypto;
pub mod executor;
pub mod fs;
pub mod image;
pub mod job;
pub mod restore;
pub mod result;
pub mod retention;
pub mod schedule;
pub mod service;
pub mod store;
pub mod transfer;
pub mod utils;
pub mod verify;

// Re-export commonly used types
pub use config::EngineConfig;
pub use job::{BackupCompression, BackupJob, BackupType};
pub use result::{BackupResult, BackupStatus};
pub use service::BackupService;
pub use store::BackupArchive;
pub use utils::errors::{EngineError, Result};
