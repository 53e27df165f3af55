//! Persisted fingerprint store.
//!
//! The store is loaded once at the start of a run, mutated in memory while
//! the executor confirms transfers and deletions, and flushed once at the
//! end. A flush always writes a complete replacement file and renames it
//! into place, so an interrupted flush leaves the previous index intact.

use super::manifest::{FingerprintEntry, IndexFile, INDEX_VERSION};
use crate::fs::metadata::is_within;
use crate::utils::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Identifies the (source, destination) pair an index belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreIdentity {
    pub source: String,
    pub destination: String,
}

impl StoreIdentity {
    pub fn new(source: &Path, destination: impl Into<String>) -> Self {
        let source = std::fs::canonicalize(source).unwrap_or_else(|_| source.to_path_buf());
        Self {
            source: source.to_string_lossy().into_owned(),
            destination: destination.into(),
        }
    }

    /// Index file name derived from both halves of the identity.
    pub fn file_name(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.source.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.destination.as_bytes());
        let hex = hasher.finalize().to_hex();
        format!("{}.json", &hex[..32])
    }
}

/// In-memory view of the fingerprint index for one run.
#[derive(Debug)]
pub struct FingerprintStore {
    path: PathBuf,
    identity: StoreIdentity,
    entries: BTreeMap<String, FingerprintEntry>,
}

impl FingerprintStore {
    /// Load the index for `identity` from `state_dir`.
    ///
    /// A missing index is a first run. An unreadable or foreign index is
    /// discarded with a warning; the run then re-copies everything.
    pub fn load(state_dir: &Path, identity: StoreIdentity) -> Self {
        let path = state_dir.join(identity.file_name());
        let entries = match read_index(&path) {
            Ok(Some(index)) if index.source == identity.source && index.destination == identity.destination => {
                info!("Loaded fingerprint index: {} entries from {}", index.entries.len(), path.display());
                index.entries
            }
            Ok(Some(_)) => {
                warn!("Fingerprint index {} belongs to another source/destination pair, ignoring it", path.display());
                BTreeMap::new()
            }
            Ok(None) => {
                info!("No fingerprint index at {}, treating as first run", path.display());
                BTreeMap::new()
            }
            Err(e) => {
                warn!("Failed to read fingerprint index {}: {}. All files will be re-copied", path.display(), e);
                BTreeMap::new()
            }
        };

        Self { path, identity, entries }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn identity(&self) -> &StoreIdentity {
        &self.identity
    }

    pub fn lookup(&self, relative_path: &str) -> Option<&FingerprintEntry> {
        self.entries.get(relative_path)
    }

    /// Record a confirmed transfer.
    pub fn commit(&mut self, relative_path: &str, entry: FingerprintEntry) {
        debug!("Commit fingerprint for {}", relative_path);
        self.entries.insert(relative_path.to_string(), entry);
    }

    /// Forget a path so a later re-creation is treated as new.
    pub fn remove(&mut self, relative_path: &str) -> Option<FingerprintEntry> {
        self.entries.remove(relative_path)
    }

    /// Forget a path and everything below it.
    pub fn remove_tree(&mut self, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|path, _| !is_within(path, prefix));
        before - self.entries.len()
    }

    /// Record that the content was re-hashed and matched at `at`.
    pub fn mark_verified(&mut self, relative_path: &str, at: DateTime<Utc>) {
        if let Some(entry) = self.entries.get_mut(relative_path) {
            entry.verified_at = Some(at);
        }
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Atomically replace the persisted index with the in-memory mapping.
    pub fn flush(&self) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let index = IndexFile {
            version: INDEX_VERSION,
            source: self.identity.source.clone(),
            destination: self.identity.destination.clone(),
            updated_at: Utc::now(),
            entries: self.entries.clone(),
        };

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer(&mut writer, &index)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        info!("Flushed fingerprint index: {} entries to {}", self.entries.len(), self.path.display());
        Ok(())
    }
}

fn read_index(path: &Path) -> Result<Option<IndexFile>> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let index: IndexFile = serde_json::from_slice(&content)?;
    if index.version != INDEX_VERSION {
        warn!("Fingerprint index version {} is not supported (expected {})", index.version, INDEX_VERSION);
        return Ok(None);
    }
    Ok(Some(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::Fingerprint;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn identity() -> StoreIdentity {
        StoreIdentity {
            source: "/data/src".to_string(),
            destination: "local:/backup".to_string(),
        }
    }

    fn entry(content: &[u8]) -> FingerprintEntry {
        let modified = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        FingerprintEntry::new(Fingerprint::of(content), content.len() as u64, modified)
    }

    #[test]
    fn test_load_missing_index_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = FingerprintStore::load(temp_dir.path(), identity());
        assert!(store.is_empty());
    }

    #[test]
    fn test_flush_and_reload_round_trip() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut store = FingerprintStore::load(temp_dir.path(), identity());
        store.commit("a.txt", entry(b"alpha"));
        store.commit("dir/b.txt", entry(b"beta"));
        store.flush()?;

        let reloaded = FingerprintStore::load(temp_dir.path(), identity());
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.lookup("a.txt"), store.lookup("a.txt"));
        assert_eq!(reloaded.lookup("dir/b.txt").unwrap().size, 4);
        // Nanosecond mtime survives the round trip.
        assert_eq!(reloaded.lookup("a.txt").unwrap().modified.timestamp_subsec_nanos(), 123_456_789);
        Ok(())
    }

    #[test]
    fn test_flush_replaces_previous_contents() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut store = FingerprintStore::load(temp_dir.path(), identity());
        store.commit("old.txt", entry(b"old"));
        store.flush()?;

        store.remove("old.txt");
        store.commit("new.txt", entry(b"new"));
        store.flush()?;

        let reloaded = FingerprintStore::load(temp_dir.path(), identity());
        assert!(reloaded.lookup("old.txt").is_none());
        assert!(reloaded.lookup("new.txt").is_some());

        // No temp files are left next to the index.
        let files = std::fs::read_dir(temp_dir.path())?.count();
        assert_eq!(files, 1);
        Ok(())
    }

    #[test]
    fn test_corrupt_index_degrades_to_empty() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join(identity().file_name());
        std::fs::write(&path, b"{ not json")?;

        let store = FingerprintStore::load(temp_dir.path(), identity());
        assert!(store.is_empty());
        Ok(())
    }

    #[test]
    fn test_identity_mismatch_is_ignored() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut store = FingerprintStore::load(temp_dir.path(), identity());
        store.commit("a.txt", entry(b"alpha"));
        store.flush()?;

        // Same file name, different recorded destination.
        let mut raw: serde_json::Value = serde_json::from_slice(&std::fs::read(store.path())?)?;
        raw["destination"] = serde_json::Value::String("local:/other".to_string());
        std::fs::write(store.path(), serde_json::to_vec(&raw)?)?;

        let reloaded = FingerprintStore::load(temp_dir.path(), identity());
        assert!(reloaded.is_empty());
        Ok(())
    }

    #[test]
    fn test_remove_tree() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = FingerprintStore::load(temp_dir.path(), identity());
        store.commit("docs/a.txt", entry(b"a"));
        store.commit("docs/sub/b.txt", entry(b"b"));
        store.commit("docs2/c.txt", entry(b"c"));

        assert_eq!(store.remove_tree("docs"), 2);
        assert_eq!(store.paths().collect::<Vec<_>>(), vec!["docs2/c.txt"]);
    }

    #[test]
    fn test_distinct_identities_use_distinct_files() {
        let other = StoreIdentity {
            source: "/data/src".to_string(),
            destination: "ssh://root@host:22/backup".to_string(),
        };
        assert_ne!(identity().file_name(), other.file_name());
    }
}
