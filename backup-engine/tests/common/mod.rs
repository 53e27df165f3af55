#![allow(dead_code)]

use backup_engine::compress::ArchiveFormat;
use backup_engine::index::{FingerprintStore, StoreIdentity};
use backup_engine::transport::{DestinationEntry, LocalTransport, Transport, UploadReceipt};
use backup_engine::utils::{EngineError, Result};
use backup_engine::BackupConfig;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// Source, destination and state directories for one test.
pub struct Workspace {
    _tmp: TempDir,
    pub source: PathBuf,
    pub dest: PathBuf,
    pub state: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("source");
        let dest = tmp.path().join("dest");
        let state = tmp.path().join("state");
        fs::create_dir_all(&source).unwrap();
        Self {
            _tmp: tmp,
            source,
            dest,
            state,
        }
    }

    pub fn write(&self, relative: &str, content: &str) {
        let path = self.source.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    pub fn remove(&self, relative: &str) {
        let path = self.source.join(relative);
        if path.is_dir() {
            fs::remove_dir_all(path).unwrap();
        } else {
            fs::remove_file(path).unwrap();
        }
    }

    pub fn config(&self) -> BackupConfig {
        BackupConfig::local(&self.source, &self.dest, &self.state)
    }

    /// Fingerprint index as the last run saved it.
    pub fn store(&self) -> FingerprintStore {
        let identity = StoreIdentity::new(&self.source, LocalTransport::new(&self.dest).identity());
        FingerprintStore::load(&self.state, identity)
    }

    pub fn dest_file(&self, relative: &str) -> Option<String> {
        fs::read_to_string(self.dest.join(relative)).ok()
    }

    /// Every regular file under `root` with its content.
    pub fn tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
        WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = e
                    .path()
                    .strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/");
                (rel, fs::read(e.path()).unwrap())
            })
            .collect()
    }
}

fn injected() -> EngineError {
    EngineError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "injected failure"))
}

/// Local transport that fails uploads or deletes of selected paths and
/// records every upload it attempts.
pub struct FailingTransport {
    inner: LocalTransport,
    fail_uploads: Vec<String>,
    fail_deletes: Vec<String>,
    pub uploads: AtomicUsize,
    pub uploaded: Mutex<Vec<String>>,
}

impl FailingTransport {
    pub fn new(root: &Path, fail_uploads: &[&str]) -> Self {
        Self {
            inner: LocalTransport::new(root),
            fail_uploads: fail_uploads.iter().map(|s| s.to_string()).collect(),
            fail_deletes: Vec::new(),
            uploads: AtomicUsize::new(0),
            uploaded: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_deletes(mut self, paths: &[&str]) -> Self {
        self.fail_deletes = paths.iter().map(|s| s.to_string()).collect();
        self
    }
}

impl Transport for FailingTransport {
    fn identity(&self) -> String {
        self.inner.identity()
    }

    fn prepare(&self) -> Result<()> {
        self.inner.prepare()
    }

    fn list(&self) -> Result<Vec<DestinationEntry>> {
        self.inner.list()
    }

    fn upload(&self, local: &Path, relative: &str) -> Result<UploadReceipt> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.uploaded.lock().unwrap().push(relative.to_string());
        if self.fail_uploads.iter().any(|p| p == relative) {
            return Err(injected());
        }
        self.inner.upload(local, relative)
    }

    fn delete(&self, relative: &str) -> Result<()> {
        if self.fail_deletes.iter().any(|p| p == relative) {
            return Err(injected());
        }
        self.inner.delete(relative)
    }

    fn remove_dir(&self, relative: &str) -> Result<()> {
        self.inner.remove_dir(relative)
    }

    fn remove_tree(&self, relative: &str) -> Result<()> {
        self.inner.remove_tree(relative)
    }

    fn unpack(&self, archive: &str, format: ArchiveFormat) -> Result<()> {
        self.inner.unpack(archive, format)
    }
}

/// Local transport that cancels the run during its first upload.
pub struct CancellingTransport {
    inner: LocalTransport,
    token: CancellationToken,
    pub uploaded: Mutex<Vec<String>>,
}

impl CancellingTransport {
    pub fn new(root: &Path, token: CancellationToken) -> Self {
        Self {
            inner: LocalTransport::new(root),
            token,
            uploaded: Mutex::new(Vec::new()),
        }
    }
}

impl Transport for CancellingTransport {
    fn identity(&self) -> String {
        self.inner.identity()
    }

    fn prepare(&self) -> Result<()> {
        self.inner.prepare()
    }

    fn list(&self) -> Result<Vec<DestinationEntry>> {
        self.inner.list()
    }

    fn upload(&self, local: &Path, relative: &str) -> Result<UploadReceipt> {
        self.token.cancel();
        let receipt = self.inner.upload(local, relative)?;
        self.uploaded.lock().unwrap().push(relative.to_string());
        Ok(receipt)
    }

    fn delete(&self, relative: &str) -> Result<()> {
        self.inner.delete(relative)
    }

    fn remove_dir(&self, relative: &str) -> Result<()> {
        self.inner.remove_dir(relative)
    }

    fn remove_tree(&self, relative: &str) -> Result<()> {
        self.inner.remove_tree(relative)
    }

    fn unpack(&self, archive: &str, format: ArchiveFormat) -> Result<()> {
        self.inner.unpack(archive, format)
    }
}

/// Local transport whose uploads of selected paths stall past any timeout.
pub struct StallingTransport {
    inner: LocalTransport,
    stall_uploads: Vec<String>,
    stall_for: Duration,
}

impl StallingTransport {
    pub fn new(root: &Path, stall_uploads: &[&str], stall_for: Duration) -> Self {
        Self {
            inner: LocalTransport::new(root),
            stall_uploads: stall_uploads.iter().map(|s| s.to_string()).collect(),
            stall_for,
        }
    }
}

impl Transport for StallingTransport {
    fn identity(&self) -> String {
        self.inner.identity()
    }

    fn prepare(&self) -> Result<()> {
        self.inner.prepare()
    }

    fn list(&self) -> Result<Vec<DestinationEntry>> {
        self.inner.list()
    }

    fn upload(&self, local: &Path, relative: &str) -> Result<UploadReceipt> {
        if self.stall_uploads.iter().any(|p| p == relative) {
            // Never writes, so nothing lands after the run has moved on
            std::thread::sleep(self.stall_for);
            return Err(injected());
        }
        self.inner.upload(local, relative)
    }

    fn delete(&self, relative: &str) -> Result<()> {
        self.inner.delete(relative)
    }

    fn remove_dir(&self, relative: &str) -> Result<()> {
        self.inner.remove_dir(relative)
    }

    fn remove_tree(&self, relative: &str) -> Result<()> {
        self.inner.remove_tree(relative)
    }

    fn unpack(&self, archive: &str, format: ArchiveFormat) -> Result<()> {
        self.inner.unpack(archive, format)
    }
}
