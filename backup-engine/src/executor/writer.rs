//! Destination writers.
//!
//! Only the single writer task touches a sink. A file is staged, then either
//! committed (its entry becomes valid) or rolled back, so a manifest never
//! points at half-written bytes.

use super::codec::write_frame;
use super::manifest::StoredLocation;
use crate::fs::metadata;
use crate::fs::walker::FileInfo;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub enum ArchiveSink {
    Packed(PackWriter),
    Tree(TreeWriter),
}

impl ArchiveSink {
    pub fn begin(&mut self, file: &FileInfo) -> std::io::Result<()> {
        match self {
            ArchiveSink::Packed(w) => w.begin(),
            ArchiveSink::Tree(w) => w.begin(file),
        }
    }

    pub fn write(&mut self, frame: &[u8]) -> std::io::Result<()> {
        match self {
            ArchiveSink::Packed(w) => w.write(frame),
            ArchiveSink::Tree(w) => w.write(frame),
        }
    }

    /// Make the staged file durable; returns its location and stored hash
    pub fn commit(&mut self, file: &FileInfo) -> std::io::Result<(StoredLocation, String)> {
        match self {
            ArchiveSink::Packed(w) => w.commit(),
            ArchiveSink::Tree(w) => w.commit(file),
        }
    }

    pub fn rollback(&mut self) -> std::io::Result<()> {
        match self {
            ArchiveSink::Packed(w) => w.rollback(),
            ArchiveSink::Tree(w) => w.rollback(),
        }
    }

    pub fn finish(&mut self) -> std::io::Result<()> {
        match self {
            ArchiveSink::Packed(w) => w.finish(),
            ArchiveSink::Tree(_) => Ok(()),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            ArchiveSink::Packed(w) => &w.path,
            ArchiveSink::Tree(w) => &w.root,
        }
    }
}

/// Appends length-prefixed frames to one payload container
pub struct PackWriter {
    path: PathBuf,
    out: BufWriter<File>,
    offset: u64,
    file_start: u64,
    hasher: Sha256,
}

impl PackWriter {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
            offset: 0,
            file_start: 0,
            hasher: Sha256::new(),
        })
    }

    fn begin(&mut self) -> std::io::Result<()> {
        self.file_start = self.offset;
        self.hasher = Sha256::new();
        Ok(())
    }

    fn write(&mut self, frame: &[u8]) -> std::io::Result<()> {
        let len = (frame.len() as u32).to_le_bytes();
        self.hasher.update(len);
        self.hasher.update(frame);
        self.offset += write_frame(&mut self.out, frame)?;
        Ok(())
    }

    fn commit(&mut self) -> std::io::Result<(StoredLocation, String)> {
        let hasher = std::mem::replace(&mut self.hasher, Sha256::new());
        let location = StoredLocation::Packed {
            offset: self.file_start,
            length: self.offset - self.file_start,
        };
        self.file_start = self.offset;
        Ok((location, format!("{:x}", hasher.finalize())))
    }

    /// Drop every frame written since `begin`
    fn rollback(&mut self) -> std::io::Result<()> {
        self.out.flush()?;
        let file = self.out.get_mut();
        file.set_len(self.file_start)?;
        file.seek(SeekFrom::Start(self.file_start))?;
        self.offset = self.file_start;
        self.hasher = Sha256::new();
        Ok(())
    }

    fn finish(&mut self) -> std::io::Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_all()
    }
}

struct StagedFile {
    temp: PathBuf,
    target: PathBuf,
    out: BufWriter<File>,
    hasher: Sha256,
}

/// Writes plain files into a directory tree (mirror jobs)
pub struct TreeWriter {
    root: PathBuf,
    staged: Option<StagedFile>,
}

impl TreeWriter {
    pub fn new(root: &Path) -> std::io::Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            staged: None,
        })
    }

    fn begin(&mut self, file: &FileInfo) -> std::io::Result<()> {
        let target = self.root.join(&file.relative_path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp = temp_sibling(&target);
        let out = BufWriter::new(File::create(&temp)?);
        self.staged = Some(StagedFile {
            temp,
            target,
            out,
            hasher: Sha256::new(),
        });
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let staged = self.staged.as_mut().ok_or_else(not_staged)?;
        staged.hasher.update(bytes);
        staged.out.write_all(bytes)
    }

    fn commit(&mut self, file: &FileInfo) -> std::io::Result<(StoredLocation, String)> {
        let mut staged = self.staged.take().ok_or_else(not_staged)?;
        staged.out.flush()?;
        drop(staged.out);

        fs::rename(&staged.temp, &staged.target)?;
        metadata::set_modified(&staged.target, file.modified)?;

        Ok((
            StoredLocation::Tree {
                path: file.relative_path.clone(),
            },
            format!("{:x}", staged.hasher.finalize()),
        ))
    }

    fn rollback(&mut self) -> std::io::Result<()> {
        if let Some(staged) = self.staged.take() {
            drop(staged.out);
            match fs::remove_file(&staged.temp) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
        }
        Ok(())
    }
}

/// `dir/.name.partial` next to `target`
pub fn temp_sibling(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.partial", name))
}

fn not_staged() -> std::io::Error {
    std::io::Error::other("no file staged in tree writer")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::codec::FrameReader;
    use crate::fs::metadata::FileAttributes;
    use chrono::Utc;
    use tempfile::TempDir;

    fn info(rel: &str) -> FileInfo {
        FileInfo {
            path: PathBuf::from("/src").join(rel),
            relative_path: rel.to_string(),
            size: 0,
            modified: Utc::now(),
            attributes: FileAttributes::default(),
        }
    }

    #[test]
    fn test_pack_rollback_discards_frames() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("a.bkp.partial");
        let mut sink = ArchiveSink::Packed(PackWriter::create(&path)?);

        sink.begin(&info("one"))?;
        sink.write(b"first file")?;
        let (first, _) = sink.commit(&info("one"))?;

        sink.begin(&info("two"))?;
        sink.write(b"half written")?;
        sink.rollback()?;

        sink.begin(&info("three"))?;
        sink.write(b"third")?;
        let (third, _) = sink.commit(&info("three"))?;
        sink.finish()?;

        assert_eq!(first, StoredLocation::Packed { offset: 0, length: 14 });
        assert_eq!(third, StoredLocation::Packed { offset: 14, length: 9 });
        assert_eq!(fs::metadata(&path)?.len(), 23);

        let file = File::open(&path)?;
        let mut reader = FrameReader::new(std::io::BufReader::new(file), 14);
        assert_eq!(reader.next_frame()?.unwrap(), b"first file");
        Ok(())
    }

    #[test]
    fn test_pack_stored_hash_covers_frames() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("b.bkp.partial");
        let mut sink = ArchiveSink::Packed(PackWriter::create(&path)?);
        sink.begin(&info("x"))?;
        sink.write(b"abc")?;
        let (_, stored_hash) = sink.commit(&info("x"))?;
        sink.finish()?;

        let bytes = fs::read(&path)?;
        assert_eq!(stored_hash, format!("{:x}", Sha256::digest(&bytes)));
        Ok(())
    }

    #[test]
    fn test_tree_commit_and_rollback() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let root = dir.path().join("job.mirror");
        let mut sink = ArchiveSink::Tree(TreeWriter::new(&root)?);

        sink.begin(&info("data/keep.txt"))?;
        sink.write(b"keep")?;
        let (location, _) = sink.commit(&info("data/keep.txt"))?;
        assert_eq!(
            location,
            StoredLocation::Tree {
                path: "data/keep.txt".into()
            }
        );
        assert_eq!(fs::read(root.join("data/keep.txt"))?, b"keep");

        sink.begin(&info("data/drop.txt"))?;
        sink.write(b"partial")?;
        sink.rollback()?;
        assert!(!root.join("data/drop.txt").exists());
        assert!(!root.join("data/.drop.txt.partial").exists());
        Ok(())
    }
}
