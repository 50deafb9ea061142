//! Mounted drives and free space queries.

use crate::job::BackupDestinationType;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Filesystems that never make sense as a backup target
const PSEUDO_FILESYSTEMS: &[&str] = &[
    "proc", "sysfs", "devtmpfs", "devpts", "tmpfs", "cgroup", "cgroup2", "securityfs", "pstore",
    "debugfs", "tracefs", "configfs", "fusectl", "mqueue", "hugetlbfs", "bpf", "autofs",
    "binfmt_misc", "efivarfs", "overlay", "squashfs", "nsfs", "rpc_pipefs", "ramfs",
];

const NETWORK_FILESYSTEMS: &[&str] = &["nfs", "nfs4", "cifs", "smb3", "smbfs", "fuse.sshfs", "9p"];

const REMOVABLE_ROOTS: &[&str] = &["/media", "/run/media", "/mnt"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveSpace {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveInfo {
    pub mount_point: PathBuf,
    pub device: String,
    pub filesystem: String,
    pub kind: BackupDestinationType,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

/// Total and available bytes of the filesystem holding `path`.
/// A path that does not exist yet is resolved through its nearest existing ancestor.
pub fn drive_space(path: &Path) -> Result<DriveSpace> {
    let existing = path
        .ancestors()
        .find(|p| p.exists())
        .ok_or_else(|| EngineError::destination(path, std::io::Error::from(std::io::ErrorKind::NotFound)))?;

    let stat = nix::sys::statvfs::statvfs(existing)
        .map_err(|errno| EngineError::destination(path, std::io::Error::from(errno)))?;

    let fragment = stat.fragment_size() as u64;
    Ok(DriveSpace {
        total_bytes: stat.blocks() as u64 * fragment,
        available_bytes: stat.blocks_available() as u64 * fragment,
    })
}

/// Drives that could hold a backup, read from the mount table
pub fn available_drives() -> Result<Vec<DriveInfo>> {
    let mounts = std::fs::read_to_string("/proc/mounts")?;
    let mut drives = Vec::new();

    for (device, mount_point, filesystem) in parse_mounts(&mounts) {
        match drive_space(&mount_point) {
            Ok(space) if space.total_bytes > 0 => drives.push(DriveInfo {
                kind: classify(&mount_point, &filesystem),
                mount_point,
                device,
                filesystem,
                total_bytes: space.total_bytes,
                available_bytes: space.available_bytes,
            }),
            Ok(_) => {}
            Err(e) => tracing::debug!(mount = %mount_point.display(), "Skipping mount: {}", e),
        }
    }

    Ok(drives)
}

/// Parse `/proc/mounts` lines into (device, mount point, filesystem), without pseudo filesystems
fn parse_mounts(content: &str) -> Vec<(String, PathBuf, String)> {
    let mut seen = std::collections::HashSet::new();
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = unescape_mount(fields.next()?);
            let filesystem = fields.next()?;
            Some((device.to_string(), PathBuf::from(mount_point), filesystem.to_string()))
        })
        .filter(|(_, _, fs)| !PSEUDO_FILESYSTEMS.contains(&fs.as_str()))
        .filter(|(_, mount, _)| seen.insert(mount.clone()))
        .collect()
}

/// Mount points escape spaces and tabs as octal (`\040`)
fn unescape_mount(raw: &str) -> String {
    raw.replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

fn classify(mount_point: &Path, filesystem: &str) -> BackupDestinationType {
    if NETWORK_FILESYSTEMS.contains(&filesystem) {
        BackupDestinationType::NetworkShare
    } else if REMOVABLE_ROOTS.iter().any(|root| mount_point.starts_with(root)) {
        BackupDestinationType::ExternalDrive
    } else {
        BackupDestinationType::LocalDrive
    }
}
