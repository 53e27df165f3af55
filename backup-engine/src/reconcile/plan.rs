//! Change plan produced by the reconciler.

use crate::fs::FileRecord;
use std::fmt;

/// Options steering change detection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Retransfer every source file
    pub force_copy: bool,
    /// Delete destination entries that no longer exist at the source
    pub clean_artifacts: bool,
    /// Never trust metadata alone, always compare fingerprints
    pub always_checksum: bool,
}

/// Why a file is scheduled for transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferReason {
    Forced,
    New,
    MetadataChanged,
    ContentChanged,
    MissingAtDestination,
    DestinationDrift,
    TypeChanged,
    /// The content could not be hashed; the transfer attempt surfaces the error.
    Unverifiable,
}

impl fmt::Display for TransferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferReason::Forced => "forced",
            TransferReason::New => "new",
            TransferReason::MetadataChanged => "metadata changed",
            TransferReason::ContentChanged => "content changed",
            TransferReason::MissingAtDestination => "missing at destination",
            TransferReason::DestinationDrift => "destination drift",
            TransferReason::TypeChanged => "type changed",
            TransferReason::Unverifiable => "unverifiable",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct PlannedTransfer {
    pub record: FileRecord,
    pub reason: TransferReason,
}

/// Decisions for one run.
///
/// A path appears in at most one of `to_transfer`, `to_skip` and
/// `to_delete`. The cleaning lists stay empty unless cleaning was requested.
#[derive(Debug, Default)]
pub struct ChangePlan {
    pub to_transfer: Vec<PlannedTransfer>,
    pub to_skip: Vec<String>,
    /// Destination files without a source counterpart
    pub to_delete: Vec<String>,
    /// Destination entries removed before transfers because the path changed type
    pub obstructions: Vec<String>,
    /// Destination directories anchoring no source file, deepest first
    pub prune_dirs: Vec<String>,
    /// Index entries gone from both ends
    pub forget: Vec<String>,

    pub scanned_files: usize,
    pub scanned_bytes: u64,
    pub skipped_bytes: u64,
    /// Files whose content was hashed during planning
    pub hashed_files: usize,
    /// Source entries that were not recorded
    pub scan_warnings: Vec<String>,
}

impl ChangePlan {
    pub fn transfer_bytes(&self) -> u64 {
        self.to_transfer.iter().map(|t| t.record.size).sum()
    }

    /// Entries the executor will work on.
    pub fn work_items(&self) -> usize {
        self.obstructions.len() + self.to_transfer.len() + self.to_delete.len() + self.prune_dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.work_items() == 0 && self.forget.is_empty()
    }

    pub fn transfer_paths(&self) -> impl Iterator<Item = &str> {
        self.to_transfer.iter().map(|t| t.record.relative_path.as_str())
    }

    pub fn reason_for(&self, relative_path: &str) -> Option<TransferReason> {
        self.to_transfer
            .iter()
            .find(|t| t.record.relative_path == relative_path)
            .map(|t| t.reason)
    }
}

impl fmt::Display for ChangePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to transfer, {} unchanged, {} to delete",
            self.to_transfer.len(),
            self.to_skip.len(),
            self.to_delete.len()
        )?;
        if !self.obstructions.is_empty() {
            write!(f, ", {} type change(s)", self.obstructions.len())?;
        }
        if !self.prune_dirs.is_empty() {
            write!(f, ", {} dir(s) to prune", self.prune_dirs.len())?;
        }
        Ok(())
    }
}
