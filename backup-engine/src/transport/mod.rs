//! Destination access.
//!
//! A [`Transport`] exposes the handful of blocking operations the executor
//! needs against the destination root. Paths are `/`-separated and relative
//! to that root. Local and remote destinations implement the same contract.

pub mod local;
pub mod remote;

use crate::compress::ArchiveFormat;
use crate::config::TransportConfig;
use crate::fs::Fingerprint;
use crate::utils::{EngineError, Result};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub use local::LocalTransport;
pub use remote::RemoteTransport;

/// Prefix of temporary names used while writing into the destination.
/// Entries carrying it are never listed.
pub const STAGING_PREFIX: &str = ".mirror-incoming-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    /// Symlinks, sockets and the like
    Other,
}

/// One entry in the destination listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationEntry {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

impl DestinationEntry {
    pub fn file(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::File,
            size,
            modified: None,
        }
    }

    pub fn dir(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Dir,
            size: 0,
            modified: None,
        }
    }
}

/// Outcome of a confirmed upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadReceipt {
    pub bytes: u64,
    /// Digest of the bytes that were sent
    pub fingerprint: Fingerprint,
}

/// Blocking operations against a destination root.
pub trait Transport: Send + Sync {
    /// Stable identity of the destination, used to key the fingerprint index.
    fn identity(&self) -> String;

    /// Make sure the destination root exists.
    fn prepare(&self) -> Result<()>;

    /// Recursive listing of the destination root.
    fn list(&self) -> Result<Vec<DestinationEntry>>;

    /// Upload `local` to `relative`, replacing an existing file.
    fn upload(&self, local: &Path, relative: &str) -> Result<UploadReceipt>;

    /// Remove a file.
    fn delete(&self, relative: &str) -> Result<()>;

    /// Remove an empty directory.
    fn remove_dir(&self, relative: &str) -> Result<()>;

    /// Remove a file or a directory with everything below it.
    fn remove_tree(&self, relative: &str) -> Result<()>;

    /// Extract an uploaded archive into the destination root, then remove it.
    fn unpack(&self, archive: &str, format: ArchiveFormat) -> Result<()>;
}

/// Open the transport described by `config`.
///
/// Remote connections are attempted in a blocking task bounded by
/// `connect_timeout`; any failure is reported as an unreachable destination.
pub async fn connect(config: &TransportConfig, connect_timeout: Duration) -> Result<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = match config {
        TransportConfig::Local { root } => Arc::new(LocalTransport::new(root)),
        TransportConfig::Remote(remote) => {
            let remote = remote.clone();
            let task = tokio::task::spawn_blocking(move || RemoteTransport::connect(remote, connect_timeout));
            let transport = match tokio::time::timeout(connect_timeout * 2, task).await {
                Ok(Ok(Ok(transport))) => transport,
                Ok(Ok(Err(e))) => return Err(EngineError::DestinationUnreachable(e.to_string())),
                Ok(Err(e)) => return Err(EngineError::DestinationUnreachable(format!("connect task failed: {}", e))),
                Err(_) => {
                    return Err(EngineError::DestinationUnreachable(format!(
                        "connection timed out after {}s",
                        connect_timeout.as_secs()
                    )))
                }
            };
            Arc::new(transport)
        }
    };

    let prepare = Arc::clone(&transport);
    tokio::task::spawn_blocking(move || prepare.prepare())
        .await
        .map_err(|e| EngineError::DestinationUnreachable(e.to_string()))?
        .map_err(|e| EngineError::DestinationUnreachable(e.to_string()))?;

    Ok(transport)
}
