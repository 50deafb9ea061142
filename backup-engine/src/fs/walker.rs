//! Source enumeration with exclusion filtering.
//!
//! Walks every source path in a stable (lexicographic) order and yields the
//! candidate files of a job. Unreadable directories become warnings instead of
//! aborting the walk. The sequence is lazy and can be restarted by calling
//! [`Enumerator::files`] again.

use crate::fs::metadata::{self, FileAttributes};
use crate::job::BackupJob;
use crate::result::{BackupError, BackupErrorKind};
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Absolute paths to skip (prefix match, case-insensitive)
    pub exclude_paths: Vec<PathBuf>,

    /// File name globs to skip (case-insensitive)
    pub exclude_patterns: Vec<String>,

    pub include_hidden: bool,
    pub include_system: bool,
}

impl WalkOptions {
    pub fn for_job(job: &BackupJob) -> Self {
        Self {
            follow_links: false,
            exclude_paths: job.exclude_paths.clone(),
            exclude_patterns: job.exclude_patterns.clone(),
            include_hidden: job.include_hidden,
            include_system: job.include_system,
        }
    }
}

/// Information about a file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Absolute path on the source
    pub path: PathBuf,

    /// Archive-relative path (`<source label>/<path below source>`, `/` separated)
    pub relative_path: String,

    /// File size in bytes
    pub size: u64,

    pub modified: DateTime<Utc>,

    pub attributes: FileAttributes,
}

/// Exclusion rules of a job
pub struct PathFilter {
    exclude_paths: Vec<PathBuf>,
    globs: GlobSet,
    include_hidden: bool,
    include_system: bool,
}

impl PathFilter {
    pub fn new(options: &WalkOptions) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &options.exclude_patterns {
            let glob = GlobBuilder::new(pattern)
                .case_insensitive(true)
                .literal_separator(true)
                .build()?;
            builder.add(glob);
        }

        Ok(Self {
            exclude_paths: options.exclude_paths.iter().map(|p| lowercase_path(p)).collect(),
            globs: builder.build()?,
            include_hidden: options.include_hidden,
            include_system: options.include_system,
        })
    }

    /// True when `path` (file or directory) must not be captured
    pub fn is_excluded(&self, path: &Path) -> bool {
        if !self.exclude_paths.is_empty() {
            let lowered = lowercase_path(path);
            if self.exclude_paths.iter().any(|ex| lowered.starts_with(ex)) {
                return true;
            }
        }

        if let Some(name) = path.file_name() {
            if self.globs.is_match(Path::new(name)) {
                return true;
            }
        }

        if !self.include_hidden && metadata::is_hidden(path) {
            return true;
        }

        !self.include_system && metadata::is_system(path)
    }
}

fn lowercase_path(path: &Path) -> PathBuf {
    PathBuf::from(path.to_string_lossy().to_lowercase())
}

/// One source root and the label its files are stored under
#[derive(Debug, Clone)]
pub struct SourceRoot {
    pub path: PathBuf,
    pub label: String,
}

/// Assign every source a unique archive label derived from its file name
pub fn source_roots(sources: &[PathBuf]) -> Vec<SourceRoot> {
    let mut used = HashSet::new();
    sources
        .iter()
        .map(|path| {
            let base = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| "root".to_string());
            let mut label = base.clone();
            let mut n = 1;
            while !used.insert(label.clone()) {
                label = format!("{}_{}", base, n);
                n += 1;
            }
            SourceRoot {
                path: path.clone(),
                label,
            }
        })
        .collect()
}

/// Lazy, restartable enumeration over the sources of a job
pub struct Enumerator {
    roots: Vec<SourceRoot>,
    options: WalkOptions,
    filter: PathFilter,
}

impl Enumerator {
    pub fn new(sources: &[PathBuf], options: WalkOptions) -> Result<Self> {
        let filter = PathFilter::new(&options)?;
        Ok(Self {
            roots: source_roots(sources),
            options,
            filter,
        })
    }

    pub fn roots(&self) -> &[SourceRoot] {
        &self.roots
    }

    /// Candidate files in stable order; `Err` items are per-path warnings
    pub fn files(&self) -> impl Iterator<Item = std::result::Result<FileInfo, BackupError>> + '_ {
        self.roots.iter().flat_map(move |root| self.walk_root(root))
    }

    /// Collect files and warnings, calling `on_file` for every file found
    pub fn collect_with<F>(&self, mut on_file: F) -> (Vec<FileInfo>, Vec<BackupError>)
    where
        F: FnMut(&FileInfo),
    {
        let mut files = Vec::new();
        let mut warnings = Vec::new();
        for item in self.files() {
            match item {
                Ok(file) => {
                    on_file(&file);
                    files.push(file);
                }
                Err(warning) => warnings.push(warning),
            }
        }
        (files, warnings)
    }

    fn walk_root<'a>(
        &'a self,
        root: &'a SourceRoot,
    ) -> Box<dyn Iterator<Item = std::result::Result<FileInfo, BackupError>> + 'a> {
        if !root.path.exists() {
            return Box::new(std::iter::once(Err(BackupError::new(
                BackupErrorKind::Enumeration,
                Some(&root.path),
                "source path does not exist",
            ))));
        }

        let walker = WalkDir::new(&root.path)
            .follow_links(self.options.follow_links)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| {
                // A source directory is always entered; a source file is filtered like any other
                (entry.depth() == 0 && entry.file_type().is_dir()) || !self.filter.is_excluded(entry.path())
            });

        Box::new(walker.filter_map(move |entry| match entry {
            Ok(entry) => {
                if entry.file_type().is_dir() {
                    return None;
                }
                file_info(&entry, root).transpose()
            }
            Err(err) => {
                let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| root.path.clone());
                tracing::warn!(path = %path.display(), "Skipping unreadable path: {}", err);
                Some(Err(BackupError::new(
                    BackupErrorKind::Enumeration,
                    Some(&path),
                    err.to_string(),
                )))
            }
        }))
    }
}

/// Build a `FileInfo` for a regular file (or a symlink to one).
/// Broken links, links to directories and special files are skipped.
fn file_info(entry: &DirEntry, root: &SourceRoot) -> std::result::Result<Option<FileInfo>, BackupError> {
    let path = entry.path();
    let metadata = std::fs::metadata(path)
        .map_err(|e| BackupError::io(BackupErrorKind::Enumeration, path, &e))?;

    if !metadata.is_file() {
        return Ok(None);
    }

    let below = path.strip_prefix(&root.path).unwrap_or(Path::new(""));
    let mut relative_path = root.label.clone();
    for component in below.components() {
        relative_path.push('/');
        relative_path.push_str(&component.as_os_str().to_string_lossy());
    }

    Ok(Some(FileInfo {
        path: path.to_path_buf(),
        relative_path,
        size: metadata.len(),
        modified: metadata::modified_utc(&metadata),
        attributes: FileAttributes::from_metadata(path, &metadata),
    }))
}
