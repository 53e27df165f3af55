//! Archive creation and extraction for compressed transfers.
//!
//! Files selected for transfer can be bundled into a tar archive, optionally
//! compressed with zstd or gzip, shipped as a single upload and unpacked at
//! the destination.

use crate::fs::fingerprint::copy_buffered;
use crate::fs::{Fingerprint, HashingReader};
use crate::utils::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Supported archive formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarZstd,
    TarGzip,
}

impl ArchiveFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::TarZstd => "tar.zst",
            ArchiveFormat::TarGzip => "tar.gz",
        }
    }

    /// Extra flags `tar -x` needs to read this format.
    pub fn tar_flags(&self) -> &'static [&'static str] {
        match self {
            ArchiveFormat::Tar => &[],
            ArchiveFormat::TarZstd => &["--zstd"],
            ArchiveFormat::TarGzip => &["-z"],
        }
    }

    pub fn validate_level(&self, level: i32) -> Result<()> {
        let range = match self {
            ArchiveFormat::Tar => return Ok(()),
            ArchiveFormat::TarZstd => 1..=22,
            ArchiveFormat::TarGzip => 0..=9,
        };
        if range.contains(&level) {
            Ok(())
        } else {
            Err(EngineError::Config(format!(
                "compression level {} out of range {:?} for {}",
                level, range, self
            )))
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ArchiveFormat {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tar" => Ok(ArchiveFormat::Tar),
            "tar.zst" | "tzst" | "zst" | "zstd" => Ok(ArchiveFormat::TarZstd),
            "tar.gz" | "tgz" | "gz" | "gzip" => Ok(ArchiveFormat::TarGzip),
            _ => Err(EngineError::UnsupportedFormat(s.to_string())),
        }
    }
}

/// How transfers are grouped into archives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveGranularity {
    /// One archive holding every file of the run
    #[default]
    Batch,
    /// One archive per file
    PerFile,
}

/// Extensions of files that are already archives or compressed streams.
const PRECOMPRESSED_EXTENSIONS: &[&str] = &["zip", "rar", "tar", "7z", "gz", "tgz", "zst", "xz", "bz2"];

/// Whether `path` names a file that recompressing would not shrink.
pub fn is_precompressed(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| {
            PRECOMPRESSED_EXTENSIONS.iter().any(|known| known.eq_ignore_ascii_case(ext))
        })
}

/// A file to put into an archive.
#[derive(Debug, Clone)]
pub struct ArchiveMember {
    pub source: PathBuf,
    pub relative_path: String,
}

/// A file that made it into the archive intact.
#[derive(Debug, Clone)]
pub struct PackedMember {
    pub relative_path: String,
    pub size: u64,
    pub fingerprint: Fingerprint,
}

/// An archive staged in a temporary file; deleted on drop.
pub struct Archive {
    file: tempfile::NamedTempFile,
    pub format: ArchiveFormat,
    pub packed: Vec<PackedMember>,
    /// Members that could not be archived, with the reason
    pub failed: Vec<(String, String)>,
}

impl Archive {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn size(&self) -> u64 {
        self.file.as_file().metadata().map(|m| m.len()).unwrap_or(0)
    }
}

impl fmt::Debug for Archive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archive")
            .field("path", &self.path())
            .field("format", &self.format)
            .field("packed", &self.packed.len())
            .field("failed", &self.failed.len())
            .finish()
    }
}

/// Bundle `members` into an archive staged under `staging_dir`.
///
/// A member that cannot be read, or that changes size while it is read, is
/// recorded in `failed` and left out of the archive; an error writing the
/// archive itself fails the whole call.
pub fn compress(
    members: &[ArchiveMember],
    format: ArchiveFormat,
    level: i32,
    staging_dir: &Path,
) -> Result<Archive> {
    let file = tempfile::Builder::new()
        .prefix(".mirror-archive-")
        .suffix(&format!(".{}", format.extension()))
        .tempfile_in(staging_dir)?;
    let out = BufWriter::new(file.reopen()?);

    let (packed, failed) = match format {
        ArchiveFormat::Tar => {
            let (writer, packed, failed) = write_tar(out, members, staging_dir)?;
            finish_writer(writer)?;
            (packed, failed)
        }
        ArchiveFormat::TarZstd => {
            let encoder = zstd::stream::write::Encoder::new(out, level)?;
            let (encoder, packed, failed) = write_tar(encoder, members, staging_dir)?;
            finish_writer(encoder.finish()?)?;
            (packed, failed)
        }
        ArchiveFormat::TarGzip => {
            let encoder = flate2::write::GzEncoder::new(out, flate2::Compression::new(level as u32));
            let (encoder, packed, failed) = write_tar(encoder, members, staging_dir)?;
            finish_writer(encoder.finish()?)?;
            (packed, failed)
        }
    };

    let archive = Archive {
        file,
        format,
        packed,
        failed,
    };
    info!(
        "Created {} archive: {} files packed, {} failed, {} bytes",
        format,
        archive.packed.len(),
        archive.failed.len(),
        archive.size()
    );
    Ok(archive)
}

fn finish_writer(mut writer: BufWriter<File>) -> Result<()> {
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}

type TarOutcome<W> = (W, Vec<PackedMember>, Vec<(String, String)>);

fn write_tar<W: Write>(writer: W, members: &[ArchiveMember], staging_dir: &Path) -> Result<TarOutcome<W>> {
    let mut builder = tar::Builder::new(writer);
    let mut packed = Vec::with_capacity(members.len());
    let mut failed = Vec::new();

    for member in members {
        let file = match File::open(&member.source) {
            Ok(f) => f,
            Err(e) => {
                warn!("Cannot archive {}: {}", member.source.display(), e);
                failed.push((member.relative_path.clone(), e.to_string()));
                continue;
            }
        };
        let metadata = file.metadata()?;
        let size = metadata.len();

        // Nothing reaches the tar stream until the member has read back intact.
        let (mut spool, fingerprint) = match spool_member(file, size, staging_dir) {
            Ok(Spooled::Intact { spool, fingerprint }) => (spool, fingerprint),
            Ok(Spooled::Changed { read }) => {
                warn!(
                    "{} changed while being archived ({} bytes expected, {} read)",
                    member.relative_path, size, read
                );
                failed.push((member.relative_path.clone(), "file changed while being archived".into()));
                continue;
            }
            Err(e) => {
                warn!("Cannot archive {}: {}", member.source.display(), e);
                failed.push((member.relative_path.clone(), e.to_string()));
                continue;
            }
        };

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(size);
        header.set_mode(file_mode(&metadata));
        if let Ok(modified) = metadata.modified() {
            let secs = modified
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            header.set_mtime(secs);
        }
        builder.append_data(&mut header, &member.relative_path, spool.as_file_mut())?;

        debug!("Archived {} ({} bytes)", member.relative_path, size);
        packed.push(PackedMember {
            relative_path: member.relative_path.clone(),
            size,
            fingerprint,
        });
    }

    let writer = builder.into_inner()?;
    Ok((writer, packed, failed))
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}

enum Spooled {
    /// Exactly the expected bytes, rewound and ready to append
    Intact {
        spool: tempfile::NamedTempFile,
        fingerprint: Fingerprint,
    },
    /// The source read back shorter or longer than its recorded size
    Changed { read: u64 },
}

/// Copy at most `size + 1` bytes of `reader` into a spool file under `staging_dir`.
fn spool_member<R: Read>(reader: R, size: u64, staging_dir: &Path) -> io::Result<Spooled> {
    let mut spool = tempfile::Builder::new()
        .prefix(".mirror-spool-")
        .tempfile_in(staging_dir)?;

    let mut limited = HashingReader::new(reader).take(size + 1);
    let read = copy_buffered(&mut limited, spool.as_file_mut())?;
    if read != size {
        return Ok(Spooled::Changed { read });
    }

    let (fingerprint, _) = limited.into_inner().finish();
    spool.as_file_mut().seek(SeekFrom::Start(0))?;
    Ok(Spooled::Intact { spool, fingerprint })
}

/// Extract `archive` into `into`, returning the relative paths written.
pub fn decompress(archive: &Path, format: ArchiveFormat, into: &Path) -> Result<Vec<String>> {
    let file = BufReader::new(File::open(archive)?);
    let extracted = match format {
        ArchiveFormat::Tar => unpack_entries(file, into)?,
        ArchiveFormat::TarZstd => unpack_entries(zstd::stream::read::Decoder::new(file)?, into)?,
        ArchiveFormat::TarGzip => unpack_entries(flate2::read::GzDecoder::new(file), into)?,
    };
    info!("Extracted {} files from {} into {}", extracted.len(), archive.display(), into.display());
    Ok(extracted)
}

fn unpack_entries<R: Read>(reader: R, into: &Path) -> Result<Vec<String>> {
    let mut archive = tar::Archive::new(reader);
    archive.set_overwrite(true);
    archive.set_preserve_mtime(true);

    let mut extracted = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type() != tar::EntryType::Regular {
            warn!("Skipping non-regular archive entry");
            continue;
        }
        let relative = entry.path()?.to_string_lossy().replace('\\', "/");
        if entry.unpack_in(into)? {
            extracted.push(relative);
        } else {
            warn!("Refusing to extract {} outside of {}", relative, into.display());
        }
    }

    if extracted.is_empty() {
        debug!("Archive contained no regular files");
    }
    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn members(root: &Path, names: &[&str]) -> Vec<ArchiveMember> {
        names
            .iter()
            .map(|n| ArchiveMember {
                source: root.join(n),
                relative_path: n.to_string(),
            })
            .collect()
    }

    #[test]
    fn test_parse_formats() {
        assert_eq!("tar".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::Tar);
        assert_eq!("zstd".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::TarZstd);
        assert_eq!("TAR.GZ".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::TarGzip);
        assert!(matches!(
            "zip".parse::<ArchiveFormat>(),
            Err(EngineError::UnsupportedFormat(_))
        ));
        assert!("rar".parse::<ArchiveFormat>().is_err());
    }

    #[test]
    fn test_precompressed_detection() {
        assert!(is_precompressed("photos/2023.zip"));
        assert!(is_precompressed("dump.TAR"));
        assert!(is_precompressed("logs/app.log.gz"));
        assert!(!is_precompressed("notes.txt"));
        assert!(!is_precompressed("zip"));
        assert!(!is_precompressed("dir.zip/readme"));
    }

    #[test]
    fn test_level_validation() {
        assert!(ArchiveFormat::TarZstd.validate_level(3).is_ok());
        assert!(ArchiveFormat::TarZstd.validate_level(30).is_err());
        assert!(ArchiveFormat::TarGzip.validate_level(10).is_err());
        assert!(ArchiveFormat::Tar.validate_level(99).is_ok());
    }

    #[test]
    fn test_round_trip_all_formats() -> Result<()> {
        for format in [ArchiveFormat::Tar, ArchiveFormat::TarZstd, ArchiveFormat::TarGzip] {
            let src = TempDir::new()?;
            let staging = TempDir::new()?;
            let dest = TempDir::new()?;
            fs::create_dir(src.path().join("nested"))?;
            fs::write(src.path().join("a.txt"), b"alpha")?;
            fs::write(src.path().join("nested/b.txt"), vec![42u8; 10_000])?;

            let archive = compress(
                &members(src.path(), &["a.txt", "nested/b.txt"]),
                format,
                3,
                staging.path(),
            )?;
            assert_eq!(archive.packed.len(), 2);
            assert!(archive.failed.is_empty());
            assert_eq!(archive.packed[0].fingerprint, Fingerprint::of(b"alpha"));

            let mut extracted = decompress(archive.path(), format, dest.path())?;
            extracted.sort();
            assert_eq!(extracted, vec!["a.txt", "nested/b.txt"]);
            assert_eq!(fs::read(dest.path().join("a.txt"))?, b"alpha");
            assert_eq!(fs::read(dest.path().join("nested/b.txt"))?, vec![42u8; 10_000]);
        }
        Ok(())
    }

    #[test]
    fn test_unreadable_member_is_isolated() -> Result<()> {
        let src = TempDir::new()?;
        let staging = TempDir::new()?;
        fs::write(src.path().join("ok.txt"), b"fine")?;

        let archive = compress(
            &members(src.path(), &["ok.txt", "missing.txt"]),
            ArchiveFormat::TarZstd,
            3,
            staging.path(),
        )?;
        assert_eq!(archive.packed.len(), 1);
        assert_eq!(archive.failed.len(), 1);
        assert_eq!(archive.failed[0].0, "missing.txt");
        Ok(())
    }

    #[test]
    fn test_staged_archive_removed_on_drop() -> Result<()> {
        let src = TempDir::new()?;
        let staging = TempDir::new()?;
        fs::write(src.path().join("a.txt"), b"a")?;

        let archive = compress(&members(src.path(), &["a.txt"]), ArchiveFormat::Tar, 0, staging.path())?;
        let path = archive.path().to_path_buf();
        assert!(path.exists());
        drop(archive);
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_shrunk_member_is_not_spooled() -> Result<()> {
        let staging = TempDir::new()?;
        match spool_member(&b"ten bytes!"[..], 64, staging.path())? {
            Spooled::Changed { read } => assert_eq!(read, 10),
            Spooled::Intact { .. } => panic!("short read accepted"),
        }
        match spool_member(&b"grown past its size"[..], 5, staging.path())? {
            Spooled::Changed { read } => assert_eq!(read, 6),
            Spooled::Intact { .. } => panic!("long read accepted"),
        }
        match spool_member(&b"exact"[..], 5, staging.path())? {
            Spooled::Intact { fingerprint, .. } => assert_eq!(fingerprint, Fingerprint::of(b"exact")),
            Spooled::Changed { .. } => panic!("intact read rejected"),
        }
        Ok(())
    }

    /// procfs reports a zero size but yields content, like a file that
    /// changes between stat and read.
    #[cfg(target_os = "linux")]
    #[test]
    fn test_changed_member_leaves_destination_copy_untouched() -> Result<()> {
        let src = TempDir::new()?;
        let staging = TempDir::new()?;
        let dest = TempDir::new()?;
        fs::write(src.path().join("ok.txt"), b"fine")?;
        fs::write(dest.path().join("status"), b"previous good copy")?;

        let members = vec![
            ArchiveMember {
                source: src.path().join("ok.txt"),
                relative_path: "ok.txt".to_string(),
            },
            ArchiveMember {
                source: PathBuf::from("/proc/self/status"),
                relative_path: "status".to_string(),
            },
        ];
        let archive = compress(&members, ArchiveFormat::TarZstd, 3, staging.path())?;
        assert_eq!(archive.packed.len(), 1);
        assert_eq!(archive.failed.len(), 1);
        assert_eq!(archive.failed[0].0, "status");

        let extracted = decompress(archive.path(), ArchiveFormat::TarZstd, dest.path())?;
        assert_eq!(extracted, vec!["ok.txt"]);
        assert_eq!(fs::read(dest.path().join("status"))?, b"previous good copy");
        Ok(())
    }
}
