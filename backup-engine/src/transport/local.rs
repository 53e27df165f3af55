//! Local filesystem destination.

use super::{DestinationEntry, EntryKind, Transport, UploadReceipt, STAGING_PREFIX};
use crate::compress::{self, ArchiveFormat};
use crate::fs::fingerprint::copy_buffered;
use crate::fs::metadata::{modified_utc, normalize_relative, to_relative};
use crate::fs::HashingReader;
use crate::utils::{EngineError, Result};
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

pub struct LocalTransport {
    root: PathBuf,
}

impl LocalTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, relative: &str) -> PathBuf {
        let relative = normalize_relative(relative);
        if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }
}

impl Transport for LocalTransport {
    fn identity(&self) -> String {
        let root = fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone());
        format!("local:{}", root.display())
    }

    fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<DestinationEntry>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        let mut walker = WalkDir::new(&self.root)
            .follow_links(false)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter();

        while let Some(entry) = walker.next() {
            let entry = entry.map_err(io::Error::from)?;
            if entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
                continue;
            }
            let Some(path) = to_relative(entry.path(), &self.root) else {
                continue;
            };
            let metadata = entry.metadata().map_err(io::Error::from)?;
            let file_type = entry.file_type();
            let kind = if file_type.is_dir() {
                EntryKind::Dir
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                EntryKind::Other
            };

            entries.push(DestinationEntry {
                path,
                kind,
                size: if kind == EntryKind::File { metadata.len() } else { 0 },
                modified: modified_utc(&metadata).ok(),
            });
        }

        Ok(entries)
    }

    fn upload(&self, local: &Path, relative: &str) -> Result<UploadReceipt> {
        let target = self.resolve(relative);
        let parent = target
            .parent()
            .ok_or_else(|| EngineError::Io(io::Error::new(io::ErrorKind::InvalidInput, "destination has no parent")))?;
        fs::create_dir_all(parent)?;

        // Write next to the target, then rename over it.
        let mut reader = HashingReader::new(fs::File::open(local)?);
        let tmp = tempfile::Builder::new().prefix(STAGING_PREFIX).tempfile_in(parent)?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            copy_buffered(&mut reader, &mut writer)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| e.error)?;

        let (fingerprint, bytes) = reader.finish();
        debug!("Copied {} -> {} ({} bytes)", local.display(), target.display(), bytes);
        Ok(UploadReceipt { bytes, fingerprint })
    }

    fn delete(&self, relative: &str) -> Result<()> {
        fs::remove_file(self.resolve(relative))?;
        Ok(())
    }

    fn remove_dir(&self, relative: &str) -> Result<()> {
        fs::remove_dir(self.resolve(relative))?;
        Ok(())
    }

    fn remove_tree(&self, relative: &str) -> Result<()> {
        let path = self.resolve(relative);
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path)?,
            Ok(_) => fs::remove_file(&path)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn unpack(&self, archive: &str, format: ArchiveFormat) -> Result<()> {
        let archive_path = self.resolve(archive);
        let result = compress::decompress(&archive_path, format, &self.root);
        fs::remove_file(&archive_path)?;
        result.map(|_| ())
    }
}
