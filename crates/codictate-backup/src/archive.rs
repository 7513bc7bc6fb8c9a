//! Read side of the archive container.
//!
//! Entry metadata is listed through the raw (undecompressed) view, so names,
//! types and sizes can be checked before a single content byte is inflated.
//! Content reads are always bounded by the declared entry size.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use codictate_model::normalize_name;
use zip::ZipArchive;

use crate::checksum::{BUFFER_SIZE, HashingReader};
use crate::error::{BackupError, Result};
use crate::progress::{CancellationToken, ProgressTracker, Stage};

/// Open archive handle.
pub(crate) type Archive = ZipArchive<BufReader<File>>;

/// Unix file type bits.
const S_IFMT: u32 = 0o170_000;
const S_IFREG: u32 = 0o100_000;
const S_IFDIR: u32 = 0o040_000;
const S_IFLNK: u32 = 0o120_000;

/// Metadata of one archive entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EntryMeta {
    pub(crate) index: usize,
    /// Name as stored in the archive.
    pub(crate) raw_name: String,
    /// NFC form of the name, used for every lookup.
    pub(crate) name: String,
    pub(crate) size: u64,
    pub(crate) compressed_size: u64,
    pub(crate) unix_mode: Option<u32>,
    pub(crate) is_dir: bool,
}

impl EntryMeta {
    /// Reason the entry type is unsafe, if any.
    pub(crate) fn unsafe_type(&self) -> Option<&'static str> {
        let kind = self.unix_mode? & S_IFMT;
        match kind {
            0 | S_IFREG | S_IFDIR => None,
            S_IFLNK => Some("symbolic link"),
            _ => Some("special file"),
        }
    }

    /// Declared size over compressed size; `None` means unbounded.
    pub(crate) fn compression_ratio(&self) -> Option<u64> {
        (self.compressed_size > 0).then(|| self.size / self.compressed_size)
    }
}

/// Open an archive for reading.
pub(crate) fn open(path: &Path) -> Result<Archive> {
    let file = File::open(path).map_err(BackupError::io("open", path))?;
    ZipArchive::new(BufReader::new(file)).map_err(|e| BackupError::InvalidArchive {
        reason: e.to_string(),
    })
}

/// List entry metadata without decompressing anything.
pub(crate) fn list(archive: &mut Archive, path: &Path) -> Result<Vec<EntryMeta>> {
    let mut entries = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let file = archive.by_index_raw(index).map_err(BackupError::zip(path))?;
        let raw_name = file.name().to_string();
        entries.push(EntryMeta {
            index,
            name: normalize_name(&raw_name),
            size: file.size(),
            compressed_size: file.compressed_size(),
            unix_mode: file.unix_mode(),
            is_dir: file.is_dir(),
            raw_name,
        });
    }
    Ok(entries)
}

/// Read a whole (small) entry into memory.
pub(crate) fn read_to_vec(archive: &mut Archive, entry: &EntryMeta, path: &Path) -> Result<Vec<u8>> {
    let file = archive.by_index(entry.index).map_err(BackupError::zip(path))?;
    let mut bytes = Vec::with_capacity(usize::try_from(entry.size).unwrap_or(0).min(BUFFER_SIZE));
    file.take(entry.size.saturating_add(1))
        .read_to_end(&mut bytes)
        .map_err(|e| corrupt(entry, &e))?;
    if bytes.len() as u64 != entry.size {
        return Err(size_mismatch(entry));
    }
    Ok(bytes)
}

/// Stream an entry into `out`, hashing it on the way. Returns the hex hash.
pub(crate) fn stream_entry<W: Write>(
    archive: &mut Archive,
    entry: &EntryMeta,
    path: &Path,
    out: &mut W,
    cancel: &CancellationToken,
    stage: Stage,
    tracker: &mut ProgressTracker<'_>,
) -> Result<String> {
    let file = archive.by_index(entry.index).map_err(BackupError::zip(path))?;
    let mut reader = HashingReader::new(file.take(entry.size.saturating_add(1)));
    let mut buffer = vec![0_u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer).map_err(|e| corrupt(entry, &e))?;
        if n == 0 {
            break;
        }
        out.write_all(&buffer[..n])
            .map_err(|e| BackupError::io("write extracted", &entry.name)(e))?;
        tracker.advance(n as u64);
        cancel.check(stage)?;
    }
    let (hash, bytes) = reader.finish();
    if bytes != entry.size {
        return Err(size_mismatch(entry));
    }
    Ok(hash)
}

/// Hash an entry without keeping its content.
pub(crate) fn hash_entry(
    archive: &mut Archive,
    entry: &EntryMeta,
    path: &Path,
    cancel: &CancellationToken,
    stage: Stage,
    tracker: &mut ProgressTracker<'_>,
) -> Result<String> {
    stream_entry(archive, entry, path, &mut io::sink(), cancel, stage, tracker)
}

fn corrupt(entry: &EntryMeta, err: &io::Error) -> BackupError {
    BackupError::InvalidArchive {
        reason: format!("{}: {err}", entry.name),
    }
}

fn size_mismatch(entry: &EntryMeta) -> BackupError {
    BackupError::InvalidArchive {
        reason: format!("{}: content does not match its declared size", entry.name),
    }
}
