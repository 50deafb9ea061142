//! System images produced by an external imaging program.

use crate::config::ImagingConfig;
use crate::executor::manifest::{BackupFileEntry, BackupManifest, StoredLocation};
use crate::fs::metadata::FileAttributes;
use crate::transfer::progress::{ProgressPhase, ProgressTracker};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Entry name of the image inside its archive
pub const IMAGE_ENTRY: &str = "system.img";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOutcome {
    Completed,
    Cancelled,
}

#[async_trait]
pub trait SystemImager: Send + Sync {
    /// Write a full image of the system to `image_path`
    async fn create_image(&self, image_path: &Path, cancel: &CancellationToken) -> Result<ImageOutcome>;
}

/// Runs `program args... <image path>`
pub struct CommandImager {
    program: String,
    args: Vec<String>,
}

impl CommandImager {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `None` when no imaging program is configured
    pub fn from_config(config: &ImagingConfig) -> Option<Self> {
        config
            .program
            .as_ref()
            .filter(|p| !p.trim().is_empty())
            .map(|program| Self::new(program.clone(), config.args.clone()))
    }
}

#[async_trait]
impl SystemImager for CommandImager {
    async fn create_image(&self, image_path: &Path, cancel: &CancellationToken) -> Result<ImageOutcome> {
        info!(program = %self.program, image = %image_path.display(), "Starting system image");
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(image_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Imaging(format!("cannot start {}: {}", self.program, e)))?;

        let mut stderr = child.stderr.take();
        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| EngineError::Imaging(e.to_string()))?;
                if status.success() {
                    return Ok(ImageOutcome::Completed);
                }
                let mut detail = String::new();
                if let Some(stderr) = stderr.as_mut() {
                    use tokio::io::AsyncReadExt;
                    let _ = stderr.read_to_string(&mut detail).await;
                }
                Err(EngineError::Imaging(format!("{} exited with {}: {}", self.program, status, detail.trim())))
            }
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to stop imaging program: {}", e);
                }
                Ok(ImageOutcome::Cancelled)
            }
        }
    }
}

/// A finished image and its one-entry manifest
pub struct ImageCapture {
    pub outcome: ImageOutcome,
    pub manifest: BackupManifest,
}

/// Run the imager into `image_path` and describe the result
pub async fn capture(
    imager: &dyn SystemImager,
    id: &str,
    image_path: PathBuf,
    mut tracker: ProgressTracker,
    cancel: &CancellationToken,
) -> Result<(ImageCapture, ProgressTracker)> {
    tracker.phase(ProgressPhase::Imaging, "Creating system image");
    let outcome = imager.create_image(&image_path, cancel).await?;
    let mut manifest = BackupManifest::new(id, None);
    if outcome == ImageOutcome::Cancelled {
        let _ = tokio::fs::remove_file(&image_path).await;
        return Ok((ImageCapture { outcome, manifest }, tracker));
    }

    let (entry, tracker) = tokio::task::spawn_blocking(move || -> Result<(BackupFileEntry, ProgressTracker)> {
        let entry = describe_image(&image_path, &mut tracker)?;
        Ok((entry, tracker))
    })
    .await??;

    manifest.files.push(entry);
    Ok((ImageCapture { outcome, manifest }, tracker))
}

fn describe_image(path: &Path, tracker: &mut ProgressTracker) -> Result<BackupFileEntry> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| EngineError::Imaging(format!("image {} was not produced: {}", path.display(), e)))?;
    tracker.set_totals(1, metadata.len());
    tracker.start_file(IMAGE_ENTRY, metadata.len());

    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        tracker.chunk(n as u64);
    }
    tracker.file_done(metadata.len());
    let hash = format!("{:x}", hasher.finalize());

    Ok(BackupFileEntry {
        relative_path: IMAGE_ENTRY.to_string(),
        original_path: PathBuf::from("/"),
        size: metadata.len(),
        modified: Utc::now(),
        attributes: FileAttributes::from_metadata(path, &metadata),
        location: StoredLocation::Raw,
        stored_hash: hash.clone(),
        hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    struct FakeImager(&'static [u8]);

    #[async_trait]
    impl SystemImager for FakeImager {
        async fn create_image(&self, image_path: &Path, _cancel: &CancellationToken) -> Result<ImageOutcome> {
            tokio::fs::write(image_path, self.0).await?;
            Ok(ImageOutcome::Completed)
        }
    }

    fn tracker() -> ProgressTracker {
        ProgressTracker::new(None, Duration::ZERO, Duration::from_secs(5))
    }

    #[test]
    fn test_unconfigured_imager() {
        assert!(CommandImager::from_config(&ImagingConfig::default()).is_none());
        let blank = ImagingConfig {
            program: Some("  ".into()),
            args: Vec::new(),
        };
        assert!(CommandImager::from_config(&blank).is_none());
    }

    #[tokio::test]
    async fn test_capture_hashes_image() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("img.partial");
        let (capture, tracker) = capture(&FakeImager(b"disk"), "img1", path, tracker(), &CancellationToken::new()).await?;

        assert_eq!(capture.outcome, ImageOutcome::Completed);
        assert_eq!(capture.manifest.file_count(), 1);
        let entry = &capture.manifest.files[0];
        assert_eq!(entry.size, 4);
        assert_eq!(entry.hash, format!("{:x}", Sha256::digest(b"disk")));
        assert_eq!(entry.location, StoredLocation::Raw);
        assert_eq!(tracker.progress().processed_files, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_command_imager_runs_program() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("out.img");
        let imager = CommandImager::new("sh", vec!["-c".into(), "printf image > \"$0\"".into()]);

        let outcome = imager.create_image(&path, &CancellationToken::new()).await?;
        assert_eq!(outcome, ImageOutcome::Completed);
        assert_eq!(std::fs::read(&path)?, b"image");

        let failing = CommandImager::new("sh", vec!["-c".into(), "exit 3".into()]);
        assert!(matches!(
            failing.create_image(&path, &CancellationToken::new()).await,
            Err(EngineError::Imaging(_))
        ));
        Ok(())
    }
}
