//! Result of a run.

use crate::progress::{format_bytes, format_duration};
use std::fmt;
use std::time::Duration;

/// Lifecycle of a backup session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Scanning,
    Planning,
    Executing,
    Flushing,
    Done,
    Aborted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Scanning => "scanning",
            SessionState::Planning => "planning",
            SessionState::Executing => "executing",
            SessionState::Flushing => "flushing",
            SessionState::Done => "done",
            SessionState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// What the executor was doing when an entry failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryAction {
    RemoveObstruction,
    Transfer,
    Delete,
}

impl fmt::Display for EntryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryAction::RemoveObstruction => "remove obstruction",
            EntryAction::Transfer => "transfer",
            EntryAction::Delete => "delete",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFailure {
    pub path: String,
    pub action: EntryAction,
    pub error: String,
}

impl fmt::Display for EntryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.action, self.path, self.error)
    }
}

/// Overall outcome, used by callers to pick an exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    PartialFailure,
    Cancelled,
}

#[derive(Debug, Clone, Default)]
pub struct BackupReport {
    pub state: SessionState,
    pub scanned_files: usize,
    pub transferred_files: usize,
    pub transferred_bytes: u64,
    pub skipped_files: usize,
    pub skipped_bytes: u64,
    pub deleted_files: usize,
    pub pruned_dirs: usize,
    /// Destination entries removed because the path changed type
    pub replaced_entries: usize,
    pub failures: Vec<EntryFailure>,
    /// Source entries the scan did not record
    pub scan_warnings: Vec<String>,
    /// Degraded conditions that did not fail any entry
    pub warnings: Vec<String>,
    pub cancelled: bool,
    pub duration: Duration,
}

impl BackupReport {
    pub fn outcome(&self) -> RunOutcome {
        if self.cancelled {
            RunOutcome::Cancelled
        } else if !self.failures.is_empty() {
            RunOutcome::PartialFailure
        } else {
            RunOutcome::Success
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome() == RunOutcome::Success
    }

    pub(crate) fn record_failure(&mut self, path: impl Into<String>, action: EntryAction, error: impl fmt::Display) {
        self.failures.push(EntryFailure {
            path: path.into(),
            action,
            error: error.to_string(),
        });
    }

    pub fn summary(&self) -> String {
        let mut summary = format!(
            "Backup {}: {} transferred ({}), {} unchanged, {} deleted, {} failed in {}",
            match self.outcome() {
                RunOutcome::Success => "completed",
                RunOutcome::PartialFailure => "completed with failures",
                RunOutcome::Cancelled => "cancelled",
            },
            self.transferred_files,
            format_bytes(self.transferred_bytes),
            self.skipped_files,
            self.deleted_files,
            self.failures.len(),
            format_duration(self.duration)
        );
        if !self.warnings.is_empty() {
            summary.push_str(&format!(" ({} warning(s))", self.warnings.len()));
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_precedence() {
        let mut report = BackupReport::default();
        assert_eq!(report.outcome(), RunOutcome::Success);

        report.record_failure("a.txt", EntryAction::Transfer, "boom");
        assert_eq!(report.outcome(), RunOutcome::PartialFailure);
        assert_eq!(report.failures[0].to_string(), "transfer a.txt: boom");

        report.cancelled = true;
        assert_eq!(report.outcome(), RunOutcome::Cancelled);
    }

    #[test]
    fn test_summary_mentions_counts() {
        let report = BackupReport {
            transferred_files: 3,
            transferred_bytes: 2048,
            skipped_files: 7,
            ..Default::default()
        };
        let summary = report.summary();
        assert!(summary.starts_with("Backup completed"));
        assert!(summary.contains("3 transferred (2.00 KB)"));
        assert!(summary.contains("7 unchanged"));
    }
}
