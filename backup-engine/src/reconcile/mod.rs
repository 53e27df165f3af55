//! Change detection.
//!
//! The reconciler compares a source scan against the fingerprint index and
//! the destination listing and decides, per file, whether it must be
//! transferred or can be skipped. Cheap checks run first; content is only
//! hashed when metadata cannot prove the file unchanged.

pub mod plan;

pub use plan::{ChangePlan, PlannedTransfer, ReconcileOptions, TransferReason};

use crate::fs::metadata::{ancestors, is_within, to_relative};
use crate::fs::{FileRecord, ScanItem, TreeScanner};
use crate::index::FingerprintStore;
use crate::transport::{DestinationEntry, EntryKind};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

/// A file modified this close to its last backup may have changed again
/// within the timestamp granularity, so its metadata proves nothing.
const RACY_WINDOW_SECS: i64 = 2;

pub struct Reconciler<'a> {
    store: &'a mut FingerprintStore,
    options: ReconcileOptions,
    now: DateTime<Utc>,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a mut FingerprintStore, options: ReconcileOptions) -> Self {
        Self {
            store,
            options,
            now: Utc::now(),
        }
    }

    /// Build the plan for one run.
    pub fn plan(&mut self, scanner: &TreeScanner, destination: &[DestinationEntry]) -> ChangePlan {
        let dest: HashMap<&str, &DestinationEntry> = destination.iter().map(|e| (e.path.as_str(), e)).collect();

        let mut plan = ChangePlan::default();
        let mut source_paths: HashSet<String> = HashSet::new();
        let mut source_dirs: HashSet<String> = HashSet::new();
        let mut unscanned: Vec<String> = Vec::new();
        let mut obstructions: BTreeSet<String> = BTreeSet::new();

        for item in scanner.scan() {
            let record = match item {
                ScanItem::File(record) => record,
                ScanItem::Skipped { path, reason } => {
                    plan.scan_warnings.push(format!("{}: {}", path.display(), reason));
                    if let Some(relative) = to_relative(&path, scanner.root()) {
                        unscanned.push(relative);
                    }
                    continue;
                }
            };

            plan.scanned_files += 1;
            plan.scanned_bytes += record.size;
            source_paths.insert(record.relative_path.clone());
            for ancestor in ancestors(&record.relative_path) {
                source_dirs.insert(ancestor.to_string());
            }

            if let Some(obstruction) = find_obstruction(&record.relative_path, &dest) {
                debug!("{} is obstructed by {} at destination", record.relative_path, obstruction);
                obstructions.insert(obstruction);
                plan.to_transfer.push(PlannedTransfer {
                    record,
                    reason: TransferReason::TypeChanged,
                });
                continue;
            }

            match self.classify(&record, dest.get(record.relative_path.as_str()).copied(), &mut plan) {
                Some(reason) => {
                    debug!("Transfer {} ({})", record.relative_path, reason);
                    plan.to_transfer.push(PlannedTransfer { record, reason });
                }
                None => {
                    plan.skipped_bytes += record.size;
                    plan.to_skip.push(record.relative_path);
                }
            }
        }

        plan.obstructions = obstructions.into_iter().collect();

        if self.options.clean_artifacts {
            self.plan_cleanup(&mut plan, destination, &source_paths, &source_dirs, &unscanned);
        }

        info!("Planned: {}", plan);
        plan
    }

    /// `None` means the file is unchanged.
    fn classify(
        &mut self,
        record: &FileRecord,
        at_destination: Option<&DestinationEntry>,
        plan: &mut ChangePlan,
    ) -> Option<TransferReason> {
        if self.options.force_copy {
            return Some(TransferReason::Forced);
        }

        let entry = match self.store.lookup(&record.relative_path) {
            Some(entry) => entry,
            None => return Some(TransferReason::New),
        };

        if entry.size != record.size || entry.modified != record.modified {
            return Some(TransferReason::MetadataChanged);
        }

        match at_destination {
            None => return Some(TransferReason::MissingAtDestination),
            Some(dest) if dest.size != entry.size => return Some(TransferReason::DestinationDrift),
            Some(_) => {}
        }

        let settled = entry.confirmed_at() - record.modified > Duration::seconds(RACY_WINDOW_SECS);
        if settled && !self.options.always_checksum {
            return None;
        }

        let expected = entry.fingerprint;
        plan.hashed_files += 1;
        match record.fingerprint() {
            Ok(actual) if actual == expected => {
                self.store.mark_verified(&record.relative_path, self.now);
                None
            }
            Ok(_) => Some(TransferReason::ContentChanged),
            Err(e) => {
                warn!("Cannot hash {}: {}", record.absolute_path.display(), e);
                Some(TransferReason::Unverifiable)
            }
        }
    }

    fn plan_cleanup(
        &self,
        plan: &mut ChangePlan,
        destination: &[DestinationEntry],
        source_paths: &HashSet<String>,
        source_dirs: &HashSet<String>,
        unscanned: &[String],
    ) {
        // Entries under something the scan could not read are left alone.
        let protected = |path: &str| {
            plan.obstructions.iter().any(|o| is_within(path, o)) || unscanned.iter().any(|u| is_within(path, u))
        };

        let mut to_delete = Vec::new();
        let mut prune_dirs = Vec::new();
        let mut dest_files: HashSet<&str> = HashSet::new();

        for entry in destination {
            match entry.kind {
                EntryKind::Dir => {
                    if !source_dirs.contains(&entry.path) && !protected(&entry.path) {
                        prune_dirs.push(entry.path.clone());
                    }
                }
                EntryKind::File | EntryKind::Other => {
                    dest_files.insert(entry.path.as_str());
                    if !source_paths.contains(&entry.path) && !protected(&entry.path) {
                        to_delete.push(entry.path.clone());
                    }
                }
            }
        }

        to_delete.sort();
        prune_dirs.sort_by(|a, b| depth(b).cmp(&depth(a)).then_with(|| a.cmp(b)));

        plan.forget = self
            .store
            .paths()
            .filter(|p| !source_paths.contains(*p) && !dest_files.contains(p))
            .map(str::to_string)
            .collect();
        plan.to_delete = to_delete;
        plan.prune_dirs = prune_dirs;
    }
}

/// Destination path that must be removed before `relative` can be written:
/// a non-file at the path itself, or a non-directory at one of its ancestors.
fn find_obstruction(relative: &str, dest: &HashMap<&str, &DestinationEntry>) -> Option<String> {
    if let Some(entry) = dest.get(relative) {
        if entry.kind != EntryKind::File {
            return Some(relative.to_string());
        }
    }
    ancestors(relative)
        .find(|a| dest.get(a).is_some_and(|e| e.kind != EntryKind::Dir))
        .map(str::to_string)
}

fn depth(path: &str) -> usize {
    path.matches('/').count()
}
