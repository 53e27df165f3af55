//! On-disk format of the fingerprint index.
//!
//! One index file exists per (source root, destination) pair. It records
//! every backed up file with the size, modification time and fingerprint it
//! had when it was last transferred, so the next run can skip it.

use crate::fs::Fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current index format version
pub const INDEX_VERSION: u32 = 1;

/// Fingerprint index, serialized as `<digest>.json` in the state directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexFile {
    pub version: u32,
    pub source: String,
    pub destination: String,
    pub updated_at: DateTime<Utc>,
    pub entries: BTreeMap<String, FingerprintEntry>,
}

/// Last known state of one backed up file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintEntry {
    pub fingerprint: Fingerprint,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub last_backed_up_at: DateTime<Utc>,
    /// Last time the content was re-hashed and found unchanged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
}

impl FingerprintEntry {
    pub fn new(fingerprint: Fingerprint, size: u64, modified: DateTime<Utc>) -> Self {
        Self {
            fingerprint,
            size,
            modified,
            last_backed_up_at: Utc::now(),
            verified_at: None,
        }
    }

    /// Most recent moment the recorded content was known to match the source.
    pub fn confirmed_at(&self) -> DateTime<Utc> {
        match self.verified_at {
            Some(at) if at > self.last_backed_up_at => at,
            _ => self.last_backed_up_at,
        }
    }
}
