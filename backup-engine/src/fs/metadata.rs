//! File attribute capture and restoration.
//!
//! Attributes are recorded in every manifest entry so a restore can put
//! permissions and timestamps back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::SystemTime;

/// Roots of OS pseudo filesystems; anything below them counts as a system file
const SYSTEM_ROOTS: &[&str] = &["/proc", "/sys", "/dev", "/run"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    pub hidden: bool,
    pub system: bool,
    pub readonly: bool,

    /// File permissions (Unix mode bits)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

impl FileAttributes {
    /// Derive attributes from a path and its metadata
    pub fn from_metadata(path: &Path, metadata: &fs::Metadata) -> Self {
        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            Some(metadata.permissions().mode())
        };

        #[cfg(not(unix))]
        let mode = None;

        Self {
            hidden: is_hidden(path),
            system: is_system(path),
            readonly: metadata.permissions().readonly(),
            mode,
        }
    }

    /// Apply the recorded permissions to a restored file
    #[cfg(unix)]
    pub fn apply_permissions(&self, path: &Path) -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        if let Some(mode) = self.mode {
            fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn apply_permissions(&self, path: &Path) -> std::io::Result<()> {
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_readonly(self.readonly);
        fs::set_permissions(path, perms)
    }
}

pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

pub fn is_system(path: &Path) -> bool {
    SYSTEM_ROOTS.iter().any(|root| path.starts_with(root))
}

/// Modification time of a file as UTC
pub fn modified_utc(metadata: &fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| DateTime::<Utc>::from(SystemTime::UNIX_EPOCH))
}

/// Set the modification time of a file
pub fn set_modified(path: &Path, modified: DateTime<Utc>) -> std::io::Result<()> {
    let file = fs::OpenOptions::new().write(true).open(path)?;
    file.set_modified(SystemTime::from(modified))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_extract_attributes() -> std::io::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join(".hidden");
        fs::write(&path, b"x")?;

        let attrs = FileAttributes::from_metadata(&path, &fs::metadata(&path)?);
        assert!(attrs.hidden);
        assert!(!attrs.system);
        Ok(())
    }

    #[test]
    fn test_system_roots() {
        assert!(is_system(Path::new("/proc/self/status")));
        assert!(!is_system(Path::new("/processing/data.txt")));
    }

    #[test]
    #[cfg(unix)]
    fn test_permissions_roundtrip() -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let temp_file = NamedTempFile::new()?;
        fs::set_permissions(temp_file.path(), fs::Permissions::from_mode(0o640))?;
        let attrs = FileAttributes::from_metadata(temp_file.path(), &fs::metadata(temp_file.path())?);

        fs::set_permissions(temp_file.path(), fs::Permissions::from_mode(0o600))?;
        attrs.apply_permissions(temp_file.path())?;

        let mode = fs::metadata(temp_file.path())?.permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
        Ok(())
    }

    #[test]
    fn test_set_modified() -> std::io::Result<()> {
        let mut temp_file = NamedTempFile::new()?;
        temp_file.write_all(b"content")?;
        temp_file.flush()?;

        let when = DateTime::parse_from_rfc3339("2021-03-04T05:06:07Z")
            .unwrap()
            .with_timezone(&Utc);
        set_modified(temp_file.path(), when)?;

        assert_eq!(modified_utc(&fs::metadata(temp_file.path())?), when);
        Ok(())
    }
}
