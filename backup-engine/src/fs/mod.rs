//! Filesystem access: enumeration, attributes, snapshots and drives.

pub mod drives;
pub mod metadata;
pub mod snapshot;
pub mod walker;

pub use drives::{DriveInfo, DriveSpace};
pub use metadata::FileAttributes;
pub use snapshot::{SnapshotHandle, SnapshotProvider};
pub use walker::{Enumerator, FileInfo, WalkOptions};
