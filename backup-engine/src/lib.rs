//! Backup Engine Library
//!
//! Differential mirror backups: a source tree is compared against the
//! fingerprint index of the previous run and the destination listing, and
//! only changed files are transferred, optionally compressed, to a local or
//! SSH destination.

pub mod compress;
pub mod config;
pub mod executor;
pub mod fs;
pub mod index;
pub mod progress;
pub mod reconcile;
pub mod session;
pub mod transport;
pub mod utils;

// Re-export commonly used types
pub use config::{BackupConfig, ConfigFile};
pub use executor::{BackupReport, EntryFailure, RunOutcome, SessionState};
pub use progress::{LogReporter, NullReporter, ProgressReporter, ProgressSnapshot};
pub use session::BackupEngine;
pub use utils::errors::EngineError;
pub type Result<T> = std::result::Result<T, EngineError>;
