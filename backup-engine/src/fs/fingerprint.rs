//! Content fingerprints.
//!
//! Fingerprints are BLAKE3 digests (256 bit). They are persisted as lowercase
//! hex in the fingerprint index.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

/// Read buffer used while hashing (64KB)
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Fixed-length digest of a file's content.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint of an in-memory buffer.
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        blake3::Hash::from_hex(s)
            .map(|h| Self(*h.as_bytes()))
            .map_err(|e| format!("invalid fingerprint {:?}: {}", s, e))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Hash the full content of a file.
pub fn hash_file(path: &Path) -> io::Result<Fingerprint> {
    let mut reader = HashingReader::new(File::open(path)?);
    io::copy(&mut reader, &mut io::sink())?;
    Ok(reader.finish().0)
}

/// Reader wrapper that hashes every byte passing through it.
///
/// Transfers read the source through this wrapper so the fingerprint that
/// gets committed is the digest of exactly the bytes that were sent.
pub struct HashingReader<R> {
    inner: R,
    hasher: blake3::Hasher,
    bytes_read: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: blake3::Hasher::new(),
            bytes_read: 0,
        }
    }

    /// Consume the reader, returning the fingerprint and the byte count.
    pub fn finish(self) -> (Fingerprint, u64) {
        (Fingerprint(*self.hasher.finalize().as_bytes()), self.bytes_read)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes_read += n as u64;
        Ok(n)
    }
}

/// Copy `reader` into `writer` with a fixed-size buffer, returning bytes copied.
pub(crate) fn copy_buffered<R: Read, W: io::Write>(reader: &mut R, writer: &mut W) -> io::Result<u64> {
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_hash_file_matches_buffer_hash() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("data.bin");
        fs::write(&path, b"hello mirror")?;

        assert_eq!(hash_file(&path)?, Fingerprint::of(b"hello mirror"));
        Ok(())
    }

    #[test]
    fn test_different_content_different_fingerprint() {
        assert_ne!(Fingerprint::of(b"a"), Fingerprint::of(b"b"));
    }

    #[test]
    fn test_hex_round_trip() {
        let fp = Fingerprint::of(b"content");
        let parsed: Fingerprint = fp.to_hex().parse().unwrap();
        assert_eq!(parsed, fp);
        assert_eq!(fp.to_hex().len(), 64);
    }

    #[test]
    fn test_rejects_malformed_hex() {
        assert!("not-a-digest".parse::<Fingerprint>().is_err());
    }

    #[test]
    fn test_hashing_reader_counts_and_hashes() -> io::Result<()> {
        let data = vec![7u8; 200_000];
        let mut reader = HashingReader::new(&data[..]);
        let mut out = Vec::new();
        let copied = copy_buffered(&mut reader, &mut out)?;

        assert_eq!(copied, 200_000);
        assert_eq!(out, data);
        let (fp, n) = reader.finish();
        assert_eq!(n, 200_000);
        assert_eq!(fp, Fingerprint::of(&data));
        Ok(())
    }
}
