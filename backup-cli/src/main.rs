//! Mirror Backup - command line entry point
//!
//! Mirrors a source tree to a local directory or an SSH host, transferring
//! only what changed since the previous run.

mod logger;
mod progress_bar;
mod shutdown;

use anyhow::{Context, Result};
use backup_engine::compress::ArchiveGranularity;
use backup_engine::config::TransportConfig;
use backup_engine::progress::ProgressReporter;
use backup_engine::{BackupConfig, BackupEngine, ConfigFile, LogReporter, RunOutcome};
use clap::Parser;
use progress_bar::BarReporter;
use shutdown::ShutdownCoordinator;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

const EXIT_SUCCESS: u8 = 0;
const EXIT_ENTRY_FAILURES: u8 = 1;
const EXIT_START_FAILED: u8 = 2;
const EXIT_CANCELLED: u8 = shutdown::EXIT_INTERRUPTED as u8;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Source directory (or file) to back up
    #[arg(short, long, value_name = "PATH")]
    origin: Option<PathBuf>,

    /// Destination root, local or on the remote host
    #[arg(short, long, value_name = "PATH")]
    target: Option<String>,

    /// Remote host; the destination is local when omitted
    #[arg(long)]
    host: Option<String>,

    /// Remote user
    #[arg(short, long)]
    user: Option<String>,

    /// Remote password
    #[arg(long)]
    pwd: Option<String>,

    /// Private key file for the remote host
    #[arg(short, long, value_name = "FILE")]
    key: Option<PathBuf>,

    /// Remote SSH port
    #[arg(short, long)]
    port: Option<u16>,

    /// Compress transfers into archives
    #[arg(short = 'c', long = "compress")]
    compress: bool,

    /// Archive format (tar, tar.zst, tar.gz)
    #[arg(long, value_name = "FORMAT")]
    compression_format: Option<String>,

    /// Codec level for the archive format
    #[arg(long, value_name = "LEVEL")]
    compression_level: Option<i32>,

    /// One archive per file instead of one per run
    #[arg(long)]
    per_file_archives: bool,

    /// Delete destination entries missing from the source
    #[arg(short = 'a', long = "clean-artifacts")]
    clean_artifacts: bool,

    /// Transfer every file regardless of change detection
    #[arg(short = 'f', long = "force")]
    force: bool,

    /// Compare content hashes even when metadata is unchanged
    #[arg(long)]
    checksum: bool,

    /// Also write logs to this file
    #[arg(short, long, value_name = "FILE")]
    log: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Path to configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory holding fingerprint indexes
    #[arg(long, value_name = "DIR")]
    state_dir: Option<PathBuf>,

    /// Concurrent transfer workers
    #[arg(long)]
    workers: Option<usize>,

    /// Skip entries whose name contains this text (repeatable)
    #[arg(long, value_name = "TEXT")]
    exclude: Vec<String>,

    /// Log progress lines instead of drawing a bar
    #[arg(long)]
    no_progress: bool,
}

/// Override file values with the flags given on the command line.
fn apply_args(file: &mut ConfigFile, args: &Args) {
    if let Some(origin) = &args.origin {
        file.backup.source = Some(origin.clone());
    }
    if let Some(target) = &args.target {
        file.backup.destination = Some(target.clone());
    }
    file.backup.force_copy |= args.force;
    file.backup.clean_artifacts |= args.clean_artifacts;
    file.backup.always_checksum |= args.checksum;
    file.backup.exclude.extend(args.exclude.iter().cloned());

    let remote_given =
        args.host.is_some() || args.user.is_some() || args.pwd.is_some() || args.key.is_some() || args.port.is_some();
    if remote_given {
        let remote = file.remote_mut();
        if let Some(host) = &args.host {
            remote.host = Some(host.clone());
        }
        if let Some(user) = &args.user {
            remote.user = Some(user.clone());
        }
        if let Some(port) = args.port {
            remote.port = port;
        }
        // A credential on the command line replaces the one from the file
        if let Some(pwd) = &args.pwd {
            remote.password = Some(pwd.clone());
            remote.key_file = None;
            remote.key_passphrase = None;
        }
        if let Some(key) = &args.key {
            remote.key_file = Some(key.clone());
            remote.password = None;
        }
    }

    file.compression.enabled |= args.compress;
    if let Some(format) = &args.compression_format {
        file.compression.format = format.clone();
    }
    if let Some(level) = args.compression_level {
        file.compression.level = level;
    }
    if args.per_file_archives {
        file.compression.granularity = ArchiveGranularity::PerFile;
    }

    if let Some(workers) = args.workers {
        file.performance.workers = workers;
    }
    if let Some(level) = &args.log_level {
        file.log.level = level.clone();
    }
    if let Some(log) = &args.log {
        file.log.file = Some(log.clone());
    }
    if let Some(dir) = &args.state_dir {
        file.state.dir = Some(dir.clone());
    }
}

fn load_config(args: &Args) -> Result<ConfigFile> {
    let mut file = match &args.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => ConfigFile::default(),
    };
    apply_args(&mut file, args);
    Ok(file)
}

fn exit_code(outcome: RunOutcome) -> u8 {
    match outcome {
        RunOutcome::Success => EXIT_SUCCESS,
        RunOutcome::PartialFailure => EXIT_ENTRY_FAILURES,
        RunOutcome::Cancelled => EXIT_CANCELLED,
    }
}

fn reporter(args: &Args) -> Arc<dyn ProgressReporter> {
    if !args.no_progress && std::io::stderr().is_terminal() {
        Arc::new(BarReporter::new())
    } else {
        Arc::new(LogReporter::default())
    }
}

fn describe(config: &BackupConfig) -> String {
    let destination = match &config.transport {
        TransportConfig::Local { root } => root.display().to_string(),
        TransportConfig::Remote(remote) => format!("{}@{}:{}", remote.user, remote.host, remote.root),
    };
    format!("{} -> {}", config.source.display(), destination)
}

async fn run(args: Args) -> Result<u8> {
    let file = load_config(&args)?;
    let _log_guard = logger::init(&file.log.level, file.log.file.as_deref())?;

    let config = BackupConfig::try_from(file).context("invalid configuration")?;
    let shutdown = ShutdownCoordinator::new();
    let engine = BackupEngine::new(config).with_cancel(shutdown.token());
    info!(
        "Starting mirror-backup v{}: {}",
        env!("CARGO_PKG_VERSION"),
        describe(engine.config())
    );

    let signals = shutdown.spawn();

    let result = engine.run(reporter(&args)).await;
    signals.abort();

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            error!("Backup failed to start: {}", e);
            return Ok(EXIT_START_FAILED);
        }
    };

    for failure in &report.failures {
        warn!("Failed: {}", failure);
    }
    for warning in &report.warnings {
        warn!("Warning: {}", warning);
    }
    Ok(exit_code(report.outcome()))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(EXIT_START_FAILED)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backup_engine::config::Credentials;
    use tempfile::TempDir;

    fn parse(argv: &[&str]) -> Args {
        let mut full = vec!["mirror-backup"];
        full.extend_from_slice(argv);
        Args::try_parse_from(full).unwrap()
    }

    #[test]
    fn test_flags_build_local_config() {
        let args = parse(&["-o", "/data", "-t", "/mnt/backup", "-a", "-f", "--workers", "8", "--exclude", ".cache"]);
        let config = BackupConfig::try_from(load_config(&args).unwrap()).unwrap();

        assert_eq!(config.source, PathBuf::from("/data"));
        assert_eq!(config.transport, TransportConfig::Local { root: PathBuf::from("/mnt/backup") });
        assert!(config.clean_artifacts);
        assert!(config.force_copy);
        assert!(!config.always_checksum);
        assert_eq!(config.workers, 8);
        assert_eq!(config.exclude, vec![".cache".to_string()]);
    }

    #[test]
    fn test_remote_flags() {
        let args = parse(&["-o", "/data", "-t", "/srv/backup", "--host", "nas", "-u", "root", "--pwd", "secret", "-p", "2222"]);
        let config = BackupConfig::try_from(load_config(&args).unwrap()).unwrap();

        match config.transport {
            TransportConfig::Remote(remote) => {
                assert_eq!(remote.host, "nas");
                assert_eq!(remote.port, 2222);
                assert_eq!(remote.credentials, Credentials::Password("secret".into()));
            }
            other => panic!("expected remote transport, got {:?}", other),
        }
    }

    #[test]
    fn test_flags_override_config_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("mirror.toml");
        std::fs::write(
            &path,
            r#"
[backup]
source = "/from/file"
destination = "/dest/file"

[remote]
host = "nas"
user = "backup"
key_file = "/keys/id_ed25519"

[compression]
format = "tar.gz"
level = 6
"#,
        )
        .unwrap();

        let config_arg = path.to_string_lossy().to_string();
        let args = parse(&["--config", &config_arg, "-o", "/from/flag", "--pwd", "pw", "-c", "--per-file-archives"]);
        let config = BackupConfig::try_from(load_config(&args).unwrap()).unwrap();

        assert_eq!(config.source, PathBuf::from("/from/flag"));
        match &config.transport {
            TransportConfig::Remote(remote) => {
                assert_eq!(remote.root, "/dest/file");
                assert_eq!(remote.credentials, Credentials::Password("pw".into()));
            }
            other => panic!("expected remote transport, got {:?}", other),
        }
        let compression = config.compression.unwrap();
        assert_eq!(compression.level, 6);
        assert_eq!(compression.granularity, ArchiveGranularity::PerFile);
    }

    #[test]
    fn test_unsupported_format_flag_rejected() {
        let args = parse(&["-o", "/data", "-t", "/backup", "-c", "--compression-format", "zip"]);
        assert!(BackupConfig::try_from(load_config(&args).unwrap()).is_err());
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let args = parse(&["--config", "/nonexistent/mirror.toml"]);
        assert!(load_config(&args).is_err());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(RunOutcome::Success), 0);
        assert_eq!(exit_code(RunOutcome::PartialFailure), 1);
        assert_eq!(exit_code(RunOutcome::Cancelled), 130);
    }

    #[test]
    fn test_describe_names_both_ends() {
        let local = BackupConfig::try_from(load_config(&parse(&["-o", "/a", "-t", "/b"])).unwrap()).unwrap();
        assert_eq!(describe(&local), "/a -> /b");

        let args = parse(&["-o", "/a", "-t", "/srv", "--host", "nas", "-u", "root", "--pwd", "pw"]);
        let remote = BackupConfig::try_from(load_config(&args).unwrap()).unwrap();
        assert_eq!(describe(&remote), "/a -> root@nas:/srv");
    }

    #[test]
    fn test_args_definition() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
