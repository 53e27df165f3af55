//! Terminal progress bar.

use backup_engine::progress::{ProgressReporter, ProgressSnapshot};
use backup_engine::BackupReport;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::atomic::{AtomicBool, Ordering};

const BYTES_TEMPLATE: &str =
    "{spinner} [{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes} ({binary_bytes_per_sec}) {wide_msg}";
const ENTRIES_TEMPLATE: &str = "{spinner} [{elapsed_precise}] [{bar:40}] {pos}/{len} entries {wide_msg}";

/// Reporter drawing an `indicatif` bar on stderr.
///
/// The bar counts bytes when the plan transfers any, entries otherwise.
pub struct BarReporter {
    bar: ProgressBar,
    by_bytes: AtomicBool,
}

impl BarReporter {
    pub fn new() -> Self {
        Self {
            bar: ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::hidden()),
            by_bytes: AtomicBool::new(false),
        }
    }

    fn position(&self, snapshot: &ProgressSnapshot) -> u64 {
        if self.by_bytes.load(Ordering::Relaxed) {
            snapshot.processed_bytes
        } else {
            snapshot.processed_entries as u64
        }
    }
}

impl Default for BarReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

fn short_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

impl ProgressReporter for BarReporter {
    fn on_start(&self, snapshot: &ProgressSnapshot) {
        let by_bytes = snapshot.total_bytes > 0;
        self.by_bytes.store(by_bytes, Ordering::Relaxed);
        if by_bytes {
            self.bar.set_style(style(BYTES_TEMPLATE));
            self.bar.set_length(snapshot.total_bytes);
        } else {
            self.bar.set_style(style(ENTRIES_TEMPLATE));
            self.bar.set_length(snapshot.total_entries as u64);
        }
        self.bar.set_draw_target(ProgressDrawTarget::stderr());
    }

    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        self.bar.set_position(self.position(snapshot));
        if let Some(current) = &snapshot.current {
            self.bar.set_message(short_name(current).to_string());
        }
    }

    fn on_finish(&self, report: &BackupReport) {
        self.bar.finish_and_clear();
        eprintln!("{}", report.summary());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn snapshot(processed_entries: usize, processed_bytes: u64, total_bytes: u64) -> ProgressSnapshot {
        ProgressSnapshot {
            total_entries: 4,
            processed_entries,
            failed_entries: 0,
            total_bytes,
            processed_bytes,
            current: Some("dir/sub/file.txt".to_string()),
            elapsed: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_counts_bytes_when_plan_moves_bytes() {
        let reporter = BarReporter::new();
        reporter.on_start(&snapshot(0, 0, 1000));
        reporter.on_progress(&snapshot(1, 250, 1000));
        assert_eq!(reporter.bar.length(), Some(1000));
        assert_eq!(reporter.bar.position(), 250);
        assert_eq!(reporter.bar.message(), "file.txt");
    }

    #[test]
    fn test_counts_entries_for_delete_only_plan() {
        let reporter = BarReporter::new();
        reporter.on_start(&snapshot(0, 0, 0));
        reporter.on_progress(&snapshot(3, 0, 0));
        assert_eq!(reporter.bar.length(), Some(4));
        assert_eq!(reporter.bar.position(), 3);
    }

    #[test]
    fn test_short_name() {
        assert_eq!(short_name("a/b/c.txt"), "c.txt");
        assert_eq!(short_name("top"), "top");
    }
}
