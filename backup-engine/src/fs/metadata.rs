//! Metadata helpers shared by the scanner and the transports.

use chrono::{DateTime, TimeZone, Utc};
use std::fs::Metadata;
use std::io;
use std::path::{Component, Path};

/// Modification time of a file as UTC, keeping sub-second precision.
pub fn modified_utc(metadata: &Metadata) -> io::Result<DateTime<Utc>> {
    Ok(DateTime::<Utc>::from(metadata.modified()?))
}

/// Convert seconds since the Unix epoch (as reported by SFTP) to UTC.
pub fn from_unix_secs(secs: u64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(i64::try_from(secs).ok()?, 0).single()
}

/// Express `path` relative to `base` as a `/`-separated string.
///
/// Returns `None` when `path` is not under `base`, is `base` itself, or
/// contains non UTF-8 components.
pub fn to_relative(path: &Path, base: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Normalize a relative path to `/` separators without empty segments.
pub fn normalize_relative(path: &str) -> String {
    path.split(['/', '\\'])
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Strict ancestors of a relative path, nearest first: `a/b/c` → `a/b`, `a`.
pub fn ancestors(relative: &str) -> impl Iterator<Item = &str> {
    let mut end = relative.len();
    std::iter::from_fn(move || {
        let idx = relative[..end].rfind('/')?;
        end = idx;
        Some(&relative[..idx])
    })
}

/// Whether `path` equals `prefix` or lies below it.
pub fn is_within(path: &str, prefix: &str) -> bool {
    path == prefix
        || (path.len() > prefix.len()
            && path.starts_with(prefix)
            && path.as_bytes()[prefix.len()] == b'/')
}
