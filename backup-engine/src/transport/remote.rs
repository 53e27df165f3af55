//! SSH/SFTP destination.
//!
//! Sessions are pooled: up to `max_sessions` authenticated connections are
//! opened on demand and shared by the executor's workers. A session that
//! fails below the SFTP layer is discarded instead of being returned.

use super::{DestinationEntry, EntryKind, Transport, UploadReceipt, STAGING_PREFIX};
use crate::compress::ArchiveFormat;
use crate::config::{Credentials, RemoteConfig};
use crate::fs::fingerprint::copy_buffered;
use crate::fs::metadata::{from_unix_secs, normalize_relative};
use crate::fs::HashingReader;
use crate::utils::{EngineError, Result};
use ssh2::{ErrorCode, OpenFlags, OpenType, RenameFlags, Session, Sftp};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// libssh2 status for a missing remote path.
const SFTP_NO_SUCH_FILE: i32 = 2;

struct Connection {
    session: Session,
    sftp: Sftp,
}

struct Pool {
    idle: Vec<Connection>,
    opened: usize,
}

pub struct RemoteTransport {
    config: RemoteConfig,
    connect_timeout: Duration,
    pool: Mutex<Pool>,
    available: Condvar,
}

impl RemoteTransport {
    /// Open and authenticate the first session. Later sessions are opened
    /// lazily when workers ask for more.
    pub fn connect(config: RemoteConfig, connect_timeout: Duration) -> Result<Self> {
        let first = open_connection(&config, connect_timeout)?;
        info!(
            "Connected to {}@{}:{} ({} session(s) max)",
            config.user, config.host, config.port, config.max_sessions
        );

        Ok(Self {
            config,
            connect_timeout,
            pool: Mutex::new(Pool {
                idle: vec![first],
                opened: 1,
            }),
            available: Condvar::new(),
        })
    }

    fn lock_pool(&self) -> MutexGuard<'_, Pool> {
        self.pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn checkout(&self) -> Result<PooledConnection<'_>> {
        let mut pool = self.lock_pool();
        loop {
            if let Some(conn) = pool.idle.pop() {
                return Ok(PooledConnection::new(self, conn));
            }
            if pool.opened < self.config.max_sessions {
                pool.opened += 1;
                drop(pool);
                return match open_connection(&self.config, self.connect_timeout) {
                    Ok(conn) => Ok(PooledConnection::new(self, conn)),
                    Err(e) => {
                        self.release_slot();
                        Err(e)
                    }
                };
            }
            pool = self
                .available
                .wait(pool)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn release_slot(&self) {
        let mut pool = self.lock_pool();
        pool.opened = pool.opened.saturating_sub(1);
        self.available.notify_one();
    }

    fn give_back(&self, conn: Connection) {
        let mut pool = self.lock_pool();
        pool.idle.push(conn);
        self.available.notify_one();
    }

    /// Run `op` on a pooled connection, discarding the session if the
    /// failure was not a plain SFTP status.
    fn with_connection<T>(&self, op: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut pooled = self.checkout()?;
        let result = op(pooled.connection());
        if let Err(e) = &result {
            if is_session_failure(e) {
                debug!("Dropping SSH session after error: {}", e);
                pooled.poison();
            }
        }
        result
    }

    fn remote_path(&self, relative: &str) -> String {
        join_remote(&self.config.root, relative)
    }
}

/// Connection checked out of the pool; returned on drop unless poisoned.
struct PooledConnection<'a> {
    owner: &'a RemoteTransport,
    conn: Option<Connection>,
    poisoned: bool,
}

impl<'a> PooledConnection<'a> {
    fn new(owner: &'a RemoteTransport, conn: Connection) -> Self {
        Self {
            owner,
            conn: Some(conn),
            poisoned: false,
        }
    }

    fn connection(&self) -> &Connection {
        // Only taken in drop.
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }

    fn poison(&mut self) {
        self.poisoned = true;
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.poisoned {
                drop(conn);
                self.owner.release_slot();
            } else {
                self.owner.give_back(conn);
            }
        }
    }
}

fn open_connection(config: &RemoteConfig, timeout: Duration) -> Result<Connection> {
    let addr = format!("{}:{}", config.host, config.port);
    let mut last_err = None;
    let mut tcp = None;
    for sock in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&sock, timeout) {
            Ok(stream) => {
                tcp = Some(stream);
                break;
            }
            Err(e) => last_err = Some(e),
        }
    }
    let tcp = match (tcp, last_err) {
        (Some(tcp), _) => tcp,
        (None, Some(e)) => return Err(e.into()),
        (None, None) => {
            return Err(EngineError::DestinationUnreachable(format!("{} did not resolve", addr)));
        }
    };

    let mut session = Session::new()?;
    // Bounds every blocking libssh2 call so a stalled peer surfaces as an error.
    session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
    session.set_tcp_stream(tcp);
    session.handshake()?;

    let auth = match &config.credentials {
        Credentials::Password(password) => session.userauth_password(&config.user, password),
        Credentials::KeyFile { path, passphrase } => {
            session.userauth_pubkey_file(&config.user, None, path, passphrase.as_deref())
        }
        Credentials::Agent => session.userauth_agent(&config.user),
    };
    auth.map_err(|e| EngineError::DestinationUnreachable(format!("SSH authentication failed: {}", e)))?;
    if !session.authenticated() {
        return Err(EngineError::DestinationUnreachable("SSH authentication failed".into()));
    }

    let sftp = session.sftp()?;
    debug!("Opened SSH session to {}", addr);
    Ok(Connection { session, sftp })
}

fn is_session_failure(err: &EngineError) -> bool {
    match err {
        EngineError::Ssh(e) => !matches!(e.code(), ErrorCode::SFTP(_)),
        EngineError::Io(_) => true,
        _ => false,
    }
}

fn is_not_found(err: &ssh2::Error) -> bool {
    matches!(err.code(), ErrorCode::SFTP(SFTP_NO_SUCH_FILE))
}

/// Join a relative destination path onto the remote root.
fn join_remote(root: &str, relative: &str) -> String {
    let relative = normalize_relative(relative);
    if root.starts_with('/') && root.trim_end_matches('/').is_empty() {
        return format!("/{}", relative);
    }
    let root = root.trim_end_matches('/');
    match (root.is_empty(), relative.is_empty()) {
        (true, true) => ".".to_string(),
        (true, false) => relative,
        (false, true) => root.to_string(),
        (false, false) => format!("{}/{}", root, relative),
    }
}

fn parent_of(path: &str) -> Option<&str> {
    path.rfind('/').map(|idx| if idx == 0 { "/" } else { &path[..idx] })
}

/// Destination identity; relative roots resolve under the login directory
/// and are kept distinct from absolute ones.
fn remote_identity(config: &RemoteConfig) -> String {
    let root = config.root.trim_end_matches('/');
    let root = if config.root.starts_with('/') {
        if root.is_empty() { "/" } else { root }.to_string()
    } else {
        format!("/~/{}", root.trim_start_matches("./"))
    };
    format!("ssh://{}@{}:{}{}", config.user, config.host, config.port, root)
}

/// Shell command extracting `archive` into `root`, output merged into one stream.
fn unpack_command(archive: &str, root: &str, format: ArchiveFormat) -> String {
    let mut args: Vec<&str> = vec!["tar", "-x"];
    args.extend_from_slice(format.tar_flags());
    args.extend_from_slice(&["-f", archive, "-C", root]);
    format!("{} 2>&1", shell_words::join(args))
}

fn mkdir_p(sftp: &Sftp, dir: &str) -> Result<()> {
    if dir.is_empty() || dir == "." || dir == "/" {
        return Ok(());
    }
    if let Ok(stat) = sftp.stat(Path::new(dir)) {
        if stat.is_dir() {
            return Ok(());
        }
    }
    if let Some(parent) = parent_of(dir) {
        mkdir_p(sftp, parent)?;
    }
    if let Err(e) = sftp.mkdir(Path::new(dir), 0o755) {
        // Another worker may have created it meanwhile.
        match sftp.stat(Path::new(dir)) {
            Ok(stat) if stat.is_dir() => {}
            _ => return Err(e.into()),
        }
    }
    Ok(())
}

fn remove_tree_sftp(sftp: &Sftp, path: &str) -> Result<()> {
    let stat = match sftp.lstat(Path::new(path)) {
        Ok(stat) => stat,
        Err(e) if is_not_found(&e) => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if !stat.is_dir() {
        sftp.unlink(Path::new(path))?;
        return Ok(());
    }
    for (child, _) in sftp.readdir(Path::new(path))? {
        remove_tree_sftp(sftp, &child.to_string_lossy())?;
    }
    sftp.rmdir(Path::new(path))?;
    Ok(())
}

impl Transport for RemoteTransport {
    fn identity(&self) -> String {
        remote_identity(&self.config)
    }

    fn prepare(&self) -> Result<()> {
        let root = self.config.root.clone();
        self.with_connection(|conn| mkdir_p(&conn.sftp, root.trim_end_matches('/')))
    }

    fn list(&self) -> Result<Vec<DestinationEntry>> {
        let root = join_remote(&self.config.root, "");
        self.with_connection(|conn| {
            let mut entries = Vec::new();
            let mut pending: VecDeque<String> = VecDeque::from([String::new()]);

            while let Some(relative) = pending.pop_front() {
                let dir = join_remote(&root, &relative);
                let mut children = match conn.sftp.readdir(Path::new(&dir)) {
                    Ok(children) => children,
                    Err(e) if relative.is_empty() && is_not_found(&e) => return Ok(Vec::new()),
                    Err(e) => return Err(e.into()),
                };
                children.sort_by(|a, b| a.0.cmp(&b.0));

                for (path, stat) in children {
                    let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                        continue;
                    };
                    if name.starts_with(STAGING_PREFIX) {
                        continue;
                    }
                    let child = if relative.is_empty() {
                        name
                    } else {
                        format!("{}/{}", relative, name)
                    };
                    let file_type = stat.file_type();
                    let kind = if file_type.is_dir() {
                        pending.push_back(child.clone());
                        EntryKind::Dir
                    } else if file_type.is_file() {
                        EntryKind::File
                    } else {
                        EntryKind::Other
                    };
                    entries.push(DestinationEntry {
                        path: child,
                        kind,
                        size: if kind == EntryKind::File { stat.size.unwrap_or(0) } else { 0 },
                        modified: stat.mtime.and_then(from_unix_secs),
                    });
                }
            }

            entries.sort_by(|a, b| a.path.cmp(&b.path));
            Ok(entries)
        })
    }

    fn upload(&self, local: &Path, relative: &str) -> Result<UploadReceipt> {
        let target = self.remote_path(relative);
        let parent = parent_of(&target).unwrap_or(".").to_string();
        let staging = format!("{}/{}{}", parent, STAGING_PREFIX, uuid::Uuid::new_v4().simple());
        let mut reader = HashingReader::new(File::open(local)?);

        self.with_connection(|conn| {
            mkdir_p(&conn.sftp, &parent)?;

            let written = conn
                .sftp
                .open_mode(
                    Path::new(&staging),
                    OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                    0o644,
                    OpenType::File,
                )
                .map_err(EngineError::from)
                .and_then(|mut remote| Ok(copy_buffered(&mut reader, &mut remote)?));
            if let Err(e) = written {
                let _ = conn.sftp.unlink(Path::new(&staging));
                return Err(e);
            }

            let flags = RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE;
            if conn.sftp.rename(Path::new(&staging), Path::new(&target), Some(flags)).is_err() {
                // Servers without POSIX rename refuse to overwrite.
                let _ = conn.sftp.unlink(Path::new(&target));
                if let Err(e) = conn.sftp.rename(Path::new(&staging), Path::new(&target), None) {
                    let _ = conn.sftp.unlink(Path::new(&staging));
                    return Err(e.into());
                }
            }
            Ok(())
        })?;

        let (fingerprint, bytes) = reader.finish();
        debug!("Uploaded {} -> {} ({} bytes)", local.display(), target, bytes);
        Ok(UploadReceipt { bytes, fingerprint })
    }

    fn delete(&self, relative: &str) -> Result<()> {
        let path = self.remote_path(relative);
        self.with_connection(|conn| Ok(conn.sftp.unlink(Path::new(&path))?))
    }

    fn remove_dir(&self, relative: &str) -> Result<()> {
        let path = self.remote_path(relative);
        self.with_connection(|conn| Ok(conn.sftp.rmdir(Path::new(&path))?))
    }

    fn remove_tree(&self, relative: &str) -> Result<()> {
        let path = self.remote_path(relative);
        self.with_connection(|conn| remove_tree_sftp(&conn.sftp, &path))
    }

    fn unpack(&self, archive: &str, format: ArchiveFormat) -> Result<()> {
        let archive_path = self.remote_path(archive);
        let root = join_remote(&self.config.root, "");
        let command = unpack_command(&archive_path, &root, format);

        self.with_connection(|conn| {
            let outcome = run_command(&conn.session, &command);
            if let Err(e) = conn.sftp.unlink(Path::new(&archive_path)) {
                warn!("Failed to remove staged archive {}: {}", archive_path, e);
            }
            outcome
        })
    }
}

fn run_command(session: &Session, command: &str) -> Result<()> {
    debug!("Running remote command: {}", command);
    let mut channel = session.channel_session()?;
    channel.exec(command)?;

    // stderr is redirected into stdout, so a single stream drains everything
    let mut output = String::new();
    channel.read_to_string(&mut output)?;
    channel.wait_close()?;

    let status = channel.exit_status()?;
    if status != 0 {
        return Err(EngineError::RemoteCommand {
            status,
            output: output.trim().to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_remote() {
        assert_eq!(join_remote("/srv/backup/", "a/b.txt"), "/srv/backup/a/b.txt");
        assert_eq!(join_remote("/srv/backup", ""), "/srv/backup");
        assert_eq!(join_remote("", "a.txt"), "a.txt");
        assert_eq!(join_remote("", ""), ".");
        assert_eq!(join_remote("backups", "./x//y"), "backups/x/y");
    }

    #[test]
    fn test_parent_of() {
        assert_eq!(parent_of("/srv/a.txt"), Some("/srv"));
        assert_eq!(parent_of("/a.txt"), Some("/"));
        assert_eq!(parent_of("a.txt"), None);
    }

    #[test]
    fn test_unpack_command_quotes_paths() {
        let cmd = unpack_command("/srv/my backup/.mirror-incoming-1.tar.zst", "/srv/my backup", ArchiveFormat::TarZstd);
        assert_eq!(
            cmd,
            "tar -x --zstd -f '/srv/my backup/.mirror-incoming-1.tar.zst' -C '/srv/my backup' 2>&1"
        );

        let plain = unpack_command("a.tar", ".", ArchiveFormat::Tar);
        assert_eq!(plain, "tar -x -f a.tar -C . 2>&1");
    }

    fn remote_config(root: &str) -> RemoteConfig {
        RemoteConfig {
            host: "nas".to_string(),
            port: 22,
            user: "u".to_string(),
            credentials: Credentials::Agent,
            root: root.to_string(),
            max_sessions: 1,
        }
    }

    #[test]
    fn test_identity_keeps_relative_and_absolute_roots_apart() {
        let relative = remote_identity(&remote_config("backups"));
        let absolute = remote_identity(&remote_config("/backups"));
        assert_ne!(relative, absolute);
        assert_eq!(absolute, "ssh://u@nas:22/backups");
        assert_eq!(relative, "ssh://u@nas:22/~/backups");
        assert_eq!(remote_identity(&remote_config("/backups/")), absolute);
        assert_eq!(remote_identity(&remote_config("/")), "ssh://u@nas:22/");
    }

    #[test]
    fn test_session_failure_classification() {
        let io_err = EngineError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(is_session_failure(&io_err));
        assert!(!is_session_failure(&EngineError::Timeout(5)));
    }
}
