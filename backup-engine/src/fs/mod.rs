//! Source-side filesystem access: traversal, metadata, fingerprints.

pub mod fingerprint;
pub mod metadata;
pub mod walker;

pub use fingerprint::{hash_file, Fingerprint, HashingReader};
pub use walker::{FileRecord, ScanItem, ScanOptions, TreeScanner};
