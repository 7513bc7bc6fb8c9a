//! File system helpers shared by the engine.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use crate::error::{BackupError, Result};

/// Suffix for files that are still being written.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Append a suffix to a path without touching its extension.
#[must_use]
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = OsString::from(path.as_os_str());
    s.push(suffix);
    PathBuf::from(s)
}

/// Write a file atomically (temp file + fsync + rename).
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(BackupError::io("create directory", parent))?;
    }

    let temp_path = with_suffix(path, ".tmp");
    let mut file = File::create(&temp_path).map_err(BackupError::io("create", &temp_path))?;
    file.write_all(bytes)
        .map_err(BackupError::io("write", &temp_path))?;
    file.sync_all()
        .map_err(BackupError::io("sync", &temp_path))?;
    drop(file);

    fs::rename(&temp_path, path).map_err(BackupError::io("rename", path))?;
    sync_parent(path);
    Ok(())
}

/// Flush the directory entry of `path` so a rename survives power loss.
///
/// Best effort: some platforms cannot open directories for syncing.
#[cfg(unix)]
pub fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }
}

#[cfg(not(unix))]
pub fn sync_parent(_path: &Path) {}

/// Rename with a durable directory entry.
pub fn rename_durable(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to).map_err(BackupError::io("rename", from))?;
    sync_parent(to);
    Ok(())
}

/// Remove a directory tree; missing is fine.
pub fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BackupError::io("remove", path)(e)),
    }
}

/// Remove a file; missing is fine.
pub fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BackupError::io("remove", path)(e)),
    }
}

/// Total size of all regular files below `path` (0 when missing).
pub fn dir_size(path: &Path) -> Result<u64> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(BackupError::io("read directory", path)(e)),
    };
    let mut total = 0_u64;
    for entry in entries {
        let entry = entry.map_err(BackupError::io("read directory", path))?;
        let meta = entry
            .metadata()
            .map_err(BackupError::io("read metadata", entry.path()))?;
        if meta.is_dir() {
            total = total.saturating_add(dir_size(&entry.path())?);
        } else {
            total = total.saturating_add(meta.len());
        }
    }
    Ok(total)
}

/// Outcome of reading one bounded line.
#[derive(Debug, PartialEq, Eq)]
pub enum Line {
    /// A complete line (without the newline) is in the buffer.
    Complete,
    /// The line exceeded the bound; its remaining bytes were discarded.
    TooLong { length: u64 },
    /// End of input.
    Eof,
}

/// Read one `\n`-terminated line into `buf`, keeping at most `max` bytes.
///
/// Oversized lines are consumed and skipped without buffering them whole, so
/// a hostile history file cannot force an unbounded allocation.
pub fn read_bounded_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>, max: u64) -> io::Result<Line> {
    buf.clear();
    let mut length = 0_u64;
    let mut overflow = false;
    let mut seen_any = false;

    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            break;
        }
        seen_any = true;
        let (chunk, consumed, done) = match available.iter().position(|&b| b == b'\n') {
            Some(pos) => (&available[..pos], pos + 1, true),
            None => (available, available.len(), false),
        };
        length += chunk.len() as u64;
        if !overflow {
            if length > max {
                overflow = true;
                buf.clear();
            } else {
                buf.extend_from_slice(chunk);
            }
        }
        reader.consume(consumed);
        if done {
            break;
        }
    }

    if !seen_any {
        return Ok(Line::Eof);
    }
    if overflow {
        return Ok(Line::TooLong { length });
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(Line::Complete)
}
