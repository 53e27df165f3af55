//! Progress accounting for a run.
//!
//! The executor advances a [`ProgressTracker`] once per finished entry; the
//! tracker turns its counters into snapshots and hands them to a
//! [`ProgressReporter`]. Snapshots are delivered in order, so the reported
//! percentage never goes backwards even with concurrent workers.

pub mod format;

pub use format::{format_bytes, format_duration, format_speed};

use crate::executor::BackupReport;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::info;

/// Point-in-time view of run progress.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub total_entries: usize,
    pub processed_entries: usize,
    pub failed_entries: usize,
    pub total_bytes: u64,
    pub processed_bytes: u64,
    /// Entry that just finished, or the step in progress
    pub current: Option<String>,
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    /// Completion in percent.
    ///
    /// Byte-weighted when the plan moves bytes, entry-weighted otherwise.
    /// An empty plan is complete.
    pub fn percent(&self) -> f64 {
        let ratio = if self.total_bytes > 0 {
            self.processed_bytes as f64 / self.total_bytes as f64
        } else if self.total_entries > 0 {
            self.processed_entries as f64 / self.total_entries as f64
        } else {
            1.0
        };
        (ratio * 100.0).clamp(0.0, 100.0)
    }

    /// Average throughput since the start of execution.
    pub fn bytes_per_second(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.processed_bytes as f64 / secs) as u64
        } else {
            0
        }
    }

    pub fn is_complete(&self) -> bool {
        self.processed_entries >= self.total_entries
    }
}

/// Observer of run progress.
pub trait ProgressReporter: Send + Sync {
    fn on_start(&self, snapshot: &ProgressSnapshot);
    fn on_progress(&self, snapshot: &ProgressSnapshot);
    fn on_finish(&self, report: &BackupReport);
}

/// Reporter that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl ProgressReporter for NullReporter {
    fn on_start(&self, _snapshot: &ProgressSnapshot) {}
    fn on_progress(&self, _snapshot: &ProgressSnapshot) {}
    fn on_finish(&self, _report: &BackupReport) {}
}

/// Reporter writing progress lines through `tracing`, at most once per interval.
pub struct LogReporter {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl LogReporter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }
}

impl Default for LogReporter {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl ProgressReporter for LogReporter {
    fn on_start(&self, snapshot: &ProgressSnapshot) {
        info!(
            "Executing {} entries ({})",
            snapshot.total_entries,
            format_bytes(snapshot.total_bytes)
        );
    }

    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let due = last.map_or(true, |at| at.elapsed() >= self.interval);
        if !due && !snapshot.is_complete() {
            return;
        }
        *last = Some(Instant::now());

        info!(
            "Progress: {:.1}% ({}/{} entries, {} of {}, {})",
            snapshot.percent(),
            snapshot.processed_entries,
            snapshot.total_entries,
            format_bytes(snapshot.processed_bytes),
            format_bytes(snapshot.total_bytes),
            format_speed(snapshot.bytes_per_second())
        );
    }

    fn on_finish(&self, report: &BackupReport) {
        info!("{}", report.summary());
    }
}

/// Shared counters for one execution.
pub struct ProgressTracker {
    reporter: Arc<dyn ProgressReporter>,
    total_entries: usize,
    total_bytes: u64,
    processed_entries: AtomicUsize,
    processed_bytes: AtomicU64,
    failed_entries: AtomicUsize,
    started: Instant,
    // Serializes delivery so snapshots reach the reporter in counter order.
    emit: Mutex<()>,
}

impl ProgressTracker {
    pub fn new(reporter: Arc<dyn ProgressReporter>, total_entries: usize, total_bytes: u64) -> Self {
        Self {
            reporter,
            total_entries,
            total_bytes,
            processed_entries: AtomicUsize::new(0),
            processed_bytes: AtomicU64::new(0),
            failed_entries: AtomicUsize::new(0),
            started: Instant::now(),
            emit: Mutex::new(()),
        }
    }

    pub fn start(&self) {
        self.reporter.on_start(&self.snapshot(None));
    }

    /// Count one finished entry. Failed entries still count as processed.
    pub fn advance(&self, path: &str, bytes: u64, failed: bool) {
        let _guard = self.emit.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.processed_bytes.fetch_add(bytes, Ordering::Relaxed);
        if failed {
            self.failed_entries.fetch_add(1, Ordering::Relaxed);
        }
        self.processed_entries.fetch_add(1, Ordering::Relaxed);
        self.reporter.on_progress(&self.snapshot(Some(path)));
    }

    /// Report what a long-running step is doing without counting an entry.
    pub fn note(&self, activity: &str) {
        let _guard = self.emit.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.reporter.on_progress(&self.snapshot(Some(activity)));
    }

    pub fn finish(&self, report: &BackupReport) {
        self.reporter.on_finish(report);
    }

    pub fn snapshot(&self, current: Option<&str>) -> ProgressSnapshot {
        ProgressSnapshot {
            total_entries: self.total_entries,
            processed_entries: self.processed_entries.load(Ordering::Relaxed),
            failed_entries: self.failed_entries.load(Ordering::Relaxed),
            total_bytes: self.total_bytes,
            processed_bytes: self.processed_bytes.load(Ordering::Relaxed),
            current: current.map(str::to_string),
            elapsed: self.started.elapsed(),
        }
    }
}
