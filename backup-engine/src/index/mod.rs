//! Fingerprint index: what was backed up last time, and what it looked like.

pub mod manifest;
pub mod store;

pub use manifest::FingerprintEntry;
pub use store::{FingerprintStore, StoreIdentity};
