//! Configuration management for the backup engine.
//!
//! [`ConfigFile`] is the raw record loaded from TOML (and patched by the
//! command line). [`BackupConfig`] is the validated form the engine accepts;
//! contradictory or incomplete combinations are rejected when it is built.

use crate::compress::{ArchiveFormat, ArchiveGranularity};
use crate::utils::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub backup: BackupSection,

    /// Present only for remote destinations
    #[serde(default)]
    pub remote: Option<RemoteSection>,

    #[serde(default)]
    pub compression: CompressionSection,

    #[serde(default)]
    pub performance: PerformanceSection,

    #[serde(default)]
    pub log: LogSection,

    #[serde(default)]
    pub state: StateSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupSection {
    /// Source directory (or single file) to mirror
    pub source: Option<PathBuf>,

    /// Destination root, local path or path on the remote host
    pub destination: Option<String>,

    /// Retransfer every file regardless of change detection
    #[serde(default)]
    pub force_copy: bool,

    /// Delete destination entries that no longer exist at the source
    #[serde(default)]
    pub clean_artifacts: bool,

    /// Always compare content hashes when metadata is unchanged
    #[serde(default)]
    pub always_checksum: bool,

    /// File-name substrings excluded from the scan
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteSection {
    pub host: Option<String>,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    pub user: Option<String>,

    pub password: Option<String>,

    /// Private key file (OpenSSH format)
    pub key_file: Option<PathBuf>,

    pub key_passphrase: Option<String>,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Upper bound on parallel SSH sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl fmt::Debug for RemoteSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("key_file", &self.key_file)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("max_sessions", &self.max_sessions)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompressionSection {
    #[serde(default)]
    pub enabled: bool,

    /// Archive format (tar, tar.zst, tar.gz)
    #[serde(default = "default_compression_format")]
    pub format: String,

    /// Codec level (1-22 for zstd, 0-9 for gzip)
    #[serde(default = "default_compression_level")]
    pub level: i32,

    /// One archive per run (batch) or one per file (per_file)
    #[serde(default)]
    pub granularity: ArchiveGranularity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PerformanceSection {
    /// Concurrent transfer/delete workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Timeout for a single transfer or delete
    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogSection {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Optional log file, in addition to stderr
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateSection {
    /// Directory holding fingerprint indexes
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

// Default values
fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_max_sessions() -> usize {
    2
}

fn default_compression_format() -> String {
    "tar.zst".to_string()
}

fn default_compression_level() -> i32 {
    3
}

fn default_workers() -> usize {
    4
}

fn default_transfer_timeout_secs() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CompressionSection {
    fn default() -> Self {
        Self {
            enabled: false,
            format: default_compression_format(),
            level: default_compression_level(),
            granularity: ArchiveGranularity::default(),
        }
    }
}

impl Default for PerformanceSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            transfer_timeout_secs: default_transfer_timeout_secs(),
        }
    }
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl RemoteSection {
    fn is_blank(&self) -> bool {
        self.host.is_none()
            && self.user.is_none()
            && self.password.is_none()
            && self.key_file.is_none()
            && self.key_passphrase.is_none()
    }
}

impl ConfigFile {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Mutable access to the remote section, creating it when absent.
    pub fn remote_mut(&mut self) -> &mut RemoteSection {
        self.remote.get_or_insert_with(|| RemoteSection {
            port: default_ssh_port(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_sessions: default_max_sessions(),
            ..Default::default()
        })
    }
}

/// SSH credentials.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Password(String),
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
    /// Keys offered by a running ssh-agent
    Agent,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Password(_) => f.write_str("Password(***)"),
            Credentials::KeyFile { path, .. } => write!(f, "KeyFile({})", path.display()),
            Credentials::Agent => f.write_str("Agent"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub credentials: Credentials,
    /// Destination root on the remote host
    pub root: String,
    pub max_sessions: usize,
}

/// Where the mirror is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConfig {
    Local { root: PathBuf },
    Remote(RemoteConfig),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionConfig {
    pub format: ArchiveFormat,
    pub level: i32,
    pub granularity: ArchiveGranularity,
}

/// Validated configuration for one backup run.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub source: PathBuf,
    pub transport: TransportConfig,
    pub force_copy: bool,
    pub clean_artifacts: bool,
    pub always_checksum: bool,
    pub exclude: Vec<String>,
    /// None when compression is disabled
    pub compression: Option<CompressionConfig>,
    pub workers: usize,
    pub transfer_timeout: Duration,
    pub connect_timeout: Duration,
    pub state_dir: PathBuf,
}

impl BackupConfig {
    /// Local mirror with default options, mostly useful for tests and embedding.
    pub fn local(source: impl Into<PathBuf>, destination: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            transport: TransportConfig::Local { root: destination.into() },
            force_copy: false,
            clean_artifacts: false,
            always_checksum: false,
            exclude: Vec::new(),
            compression: None,
            workers: default_workers(),
            transfer_timeout: Duration::from_secs(default_transfer_timeout_secs()),
            connect_timeout: Duration::from_secs(default_connect_timeout_secs()),
            state_dir: state_dir.into(),
        }
    }
}

impl TryFrom<ConfigFile> for BackupConfig {
    type Error = EngineError;

    fn try_from(file: ConfigFile) -> Result<Self> {
        let source = file
            .backup
            .source
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| EngineError::Config("backup.source is required".into()))?;
        let destination = file
            .backup
            .destination
            .filter(|d| !d.trim().is_empty())
            .ok_or_else(|| EngineError::Config("backup.destination is required".into()))?;

        let remote = file.remote.filter(|r| !r.is_blank());
        let connect_timeout_secs = remote
            .as_ref()
            .map(|r| r.connect_timeout_secs)
            .unwrap_or_else(default_connect_timeout_secs);

        let transport = match remote {
            None => TransportConfig::Local {
                root: PathBuf::from(destination),
            },
            Some(remote) => TransportConfig::Remote(validate_remote(remote, destination)?),
        };

        // Unsupported formats fail here, before anything is transferred.
        let format: ArchiveFormat = file.compression.format.parse()?;
        let compression = if file.compression.enabled {
            format.validate_level(file.compression.level)?;
            Some(CompressionConfig {
                format,
                level: file.compression.level,
                granularity: file.compression.granularity,
            })
        } else {
            None
        };

        if file.performance.workers == 0 {
            return Err(EngineError::Config("performance.workers must be at least 1".into()));
        }
        if file.performance.transfer_timeout_secs == 0 || connect_timeout_secs == 0 {
            return Err(EngineError::Config("timeouts must be at least 1 second".into()));
        }

        Ok(Self {
            source,
            transport,
            force_copy: file.backup.force_copy,
            clean_artifacts: file.backup.clean_artifacts,
            always_checksum: file.backup.always_checksum,
            exclude: file.backup.exclude,
            compression,
            workers: file.performance.workers,
            transfer_timeout: Duration::from_secs(file.performance.transfer_timeout_secs),
            connect_timeout: Duration::from_secs(connect_timeout_secs),
            state_dir: file.state.dir.unwrap_or_else(default_state_dir),
        })
    }
}

fn validate_remote(remote: RemoteSection, root: String) -> Result<RemoteConfig> {
    let host = remote
        .host
        .filter(|h| !h.trim().is_empty())
        .ok_or_else(|| EngineError::Config("remote options given without remote.host".into()))?;
    let user = remote
        .user
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| EngineError::Config(format!("remote.user is required for host {}", host)))?;

    let credentials = match (remote.password, remote.key_file, remote.key_passphrase) {
        (Some(_), Some(_), _) => {
            return Err(EngineError::Config(
                "remote.password and remote.key_file are mutually exclusive".into(),
            ))
        }
        (Some(_), None, Some(_)) | (None, None, Some(_)) => {
            return Err(EngineError::Config("remote.key_passphrase requires remote.key_file".into()))
        }
        (Some(password), None, None) => Credentials::Password(password),
        (None, Some(path), passphrase) => Credentials::KeyFile { path, passphrase },
        (None, None, None) => Credentials::Agent,
    };

    if remote.max_sessions == 0 {
        return Err(EngineError::Config("remote.max_sessions must be at least 1".into()));
    }
    // SFTP does not expand `~`; relative paths already resolve from the login directory.
    if root.starts_with('~') {
        return Err(EngineError::Config(format!(
            "remote destination {:?} must not start with ~, use a path relative to the login directory",
            root
        )));
    }

    Ok(RemoteConfig {
        host,
        port: remote.port,
        user,
        credentials,
        root,
        max_sessions: remote.max_sessions,
    })
}

fn default_state_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("XDG_STATE_HOME").filter(|d| !d.is_empty()) {
        return PathBuf::from(dir).join("mirror-backup");
    }
    match std::env::var_os("HOME").filter(|d| !d.is_empty()) {
        Some(home) => PathBuf::from(home).join(".local/state/mirror-backup"),
        None => PathBuf::from(".mirror-backup"),
    }
}
