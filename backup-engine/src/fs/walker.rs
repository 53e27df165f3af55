//! Source tree traversal.
//!
//! The scanner walks the source root and yields one [`FileRecord`] per
//! regular file. Metadata is read eagerly, the content fingerprint only on
//! demand. Every call to [`TreeScanner::scan`] walks the tree from scratch.

use crate::fs::fingerprint::{hash_file, Fingerprint};
use crate::fs::metadata::{modified_utc, to_relative};
use crate::utils::{EngineError, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// File names containing any of these substrings are excluded
    pub exclude_patterns: Vec<String>,
}

/// One regular file under the source root.
#[derive(Debug)]
pub struct FileRecord {
    /// Full path to the file
    pub absolute_path: PathBuf,

    /// `/`-separated path relative to the root
    pub relative_path: String,

    /// File size in bytes
    pub size: u64,

    /// Last modification time reported by the source filesystem
    pub modified: DateTime<Utc>,

    fingerprint: OnceCell<Fingerprint>,
}

impl FileRecord {
    pub fn new(absolute_path: PathBuf, relative_path: String, size: u64, modified: DateTime<Utc>) -> Self {
        Self {
            absolute_path,
            relative_path,
            size,
            modified,
            fingerprint: OnceCell::new(),
        }
    }

    /// Content fingerprint, hashed on first request.
    pub fn fingerprint(&self) -> io::Result<Fingerprint> {
        self.fingerprint
            .get_or_try_init(|| hash_file(&self.absolute_path))
            .copied()
    }

    /// Whether the content has been hashed for this record.
    pub fn is_hashed(&self) -> bool {
        self.fingerprint.get().is_some()
    }
}

/// Result of visiting one walk entry.
#[derive(Debug)]
pub enum ScanItem {
    File(FileRecord),
    /// Entry that was not recorded (symlink, special file, unreadable).
    Skipped { path: PathBuf, reason: String },
}

/// Walks a source root.
#[derive(Debug, Clone)]
pub struct TreeScanner {
    root: PathBuf,
    options: ScanOptions,
}

impl TreeScanner {
    /// Create a scanner; fails when the root does not exist.
    pub fn new(root: impl Into<PathBuf>, options: ScanOptions) -> Result<Self> {
        let root = root.into();
        if std::fs::symlink_metadata(&root).is_err() {
            return Err(EngineError::SourceMissing(root));
        }
        Ok(Self { root, options })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start a fresh walk.
    ///
    /// Entries are visited sorted by file name within each directory, so the
    /// order is stable for an unchanged tree.
    pub fn scan(&self) -> Scan {
        // A single-file root is recorded under its own file name.
        let base = if self.root.is_file() {
            self.root.parent().map(Path::to_path_buf).unwrap_or_default()
        } else {
            self.root.clone()
        };

        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name();

        Scan {
            inner: walker.into_iter(),
            base,
            exclude_patterns: self.options.exclude_patterns.clone(),
        }
    }

    /// Collect every record, logging skipped entries.
    pub fn collect_files(&self) -> Vec<FileRecord> {
        self.scan()
            .filter_map(|item| match item {
                ScanItem::File(record) => Some(record),
                ScanItem::Skipped { .. } => None,
            })
            .collect()
    }
}

/// Lazy sequence of scan items.
pub struct Scan {
    inner: walkdir::IntoIter,
    base: PathBuf,
    exclude_patterns: Vec<String>,
}

impl Iterator for Scan {
    type Item = ScanItem;

    fn next(&mut self) -> Option<ScanItem> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                    warn!("Skipping unreadable entry {}: {}", path.display(), e);
                    return Some(ScanItem::Skipped {
                        path,
                        reason: e.to_string(),
                    });
                }
            };

            if should_exclude(&entry, &self.exclude_patterns) {
                if entry.file_type().is_dir() {
                    self.inner.skip_current_dir();
                }
                continue;
            }

            let file_type = entry.file_type();
            if file_type.is_dir() {
                continue;
            }

            if !file_type.is_file() {
                let kind = if file_type.is_symlink() { "symlink" } else { "special file" };
                warn!("Skipping {} {}", kind, entry.path().display());
                return Some(ScanItem::Skipped {
                    path: entry.path().to_path_buf(),
                    reason: format!("{} not followed", kind),
                });
            }

            return Some(match record_from_entry(&entry, &self.base) {
                Ok(record) => ScanItem::File(record),
                Err(e) => {
                    warn!("Skipping {}: {}", entry.path().display(), e);
                    ScanItem::Skipped {
                        path: entry.path().to_path_buf(),
                        reason: e.to_string(),
                    }
                }
            });
        }
    }
}

fn record_from_entry(entry: &DirEntry, base: &Path) -> io::Result<FileRecord> {
    let metadata = entry.metadata().map_err(io::Error::from)?;
    let path = entry.path().to_path_buf();
    let relative_path = to_relative(&path, base).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "path is not valid UTF-8")
    })?;

    Ok(FileRecord::new(
        path,
        relative_path,
        metadata.len(),
        modified_utc(&metadata)?,
    ))
}

/// Check if a directory entry should be excluded based on patterns
fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    if entry.depth() == 0 {
        return false;
    }
    let file_name = entry.file_name().to_string_lossy();
    patterns.iter().any(|pattern| file_name.contains(pattern.as_str()))
}
