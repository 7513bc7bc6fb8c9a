//! Archive writer.
//!
//! Writes the payload, recordings, checksum set and manifest into one ZIP.
//! The archive is assembled at `<destination>.partial` and renamed into place
//! only after it is complete and synced, so a failed or cancelled export never
//! leaves a partial file at the destination.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use codictate_model::{ComponentKind, Manifest, paths};
use tracing::{debug, info, warn};
use zip::CompressionMethod;
use zip::write::SimpleFileOptions;

use crate::checksum::{BUFFER_SIZE, HashingReader, sha256_bytes};
use crate::error::{BackupError, Result};
use crate::export::manifest::ManifestBuilder;
use crate::export::snapshot::Snapshot;
use crate::io::{PARTIAL_SUFFIX, remove_file_if_exists, rename_durable, with_suffix};
use crate::progress::{CancellationToken, ProgressTracker, Stage, StatusBoard};
use crate::volume::VolumeProbe;

/// Per-entry allowance for ZIP headers and the central directory.
const ENTRY_OVERHEAD_BYTES: u64 = 512;

/// Archive extension.
pub const ARCHIVE_EXTENSION: &str = "zip";

/// Export options.
#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Replace an existing destination file.
    pub overwrite: bool,
}

/// Result of writing one archive.
#[derive(Debug, Clone)]
pub struct ArchiveSummary {
    /// Final archive path.
    pub path: PathBuf,
    /// Archive size on disk.
    pub size_bytes: u64,
    /// Number of entries written.
    pub entries: usize,
    /// Manifest embedded in the archive.
    pub manifest: Manifest,
}

/// Default archive file name: `codictate-backup-YYYY-MM-DD_HH-mm.zip`.
#[must_use]
pub fn default_file_name(now: DateTime<Local>) -> String {
    format!(
        "codictate-backup-{}.{ARCHIVE_EXTENSION}",
        now.format("%Y-%m-%d_%H-%M")
    )
}

/// Resolve a user-chosen destination.
///
/// A directory gets the default file name; a missing `.zip` extension is
/// appended.
#[must_use]
pub fn resolve_destination(destination: &Path, now: DateTime<Local>) -> PathBuf {
    if destination.is_dir() {
        return destination.join(default_file_name(now));
    }
    let has_extension = destination
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(ARCHIVE_EXTENSION));
    if has_extension {
        destination.to_path_buf()
    } else {
        with_suffix(destination, &format!(".{ARCHIVE_EXTENSION}"))
    }
}

/// Serialized payload documents.
pub(crate) struct EncodedPayload {
    history: Vec<u8>,
    dictionary: Vec<u8>,
    settings: Vec<u8>,
    stats: Vec<u8>,
}

impl EncodedPayload {
    pub(crate) fn encode(snapshot: &Snapshot) -> Result<Self> {
        let mut history = Vec::with_capacity(snapshot.history.len() * 256);
        for row in &snapshot.history {
            serde_json::to_writer(&mut history, row)
                .map_err(BackupError::json("encode", "history row"))?;
            history.push(b'\n');
        }
        Ok(Self {
            history,
            dictionary: serde_json::to_vec_pretty(&snapshot.dictionary)
                .map_err(BackupError::json("encode", "dictionary"))?,
            settings: serde_json::to_vec_pretty(&snapshot.settings)
                .map_err(BackupError::json("encode", "settings"))?,
            stats: serde_json::to_vec_pretty(&snapshot.stats)
                .map_err(BackupError::json("encode", "stats snapshot"))?,
        })
    }

    fn documents(&self) -> [(&'static str, &[u8]); 4] {
        [
            (paths::HISTORY, self.history.as_slice()),
            (paths::DICTIONARY, self.dictionary.as_slice()),
            (paths::SETTINGS, self.settings.as_slice()),
            (paths::STATS_SNAPSHOT, self.stats.as_slice()),
        ]
    }

    fn len(&self) -> u64 {
        self.documents().iter().map(|(_, b)| b.len() as u64).sum()
    }
}

/// Upper estimate of the archive size (payload stored uncompressed).
pub(crate) fn estimate_size(snapshot: &Snapshot, encoded: &EncodedPayload) -> u64 {
    let entries = 6 + snapshot.recordings.len() as u64;
    encoded.len() + snapshot.recordings_bytes() + entries * ENTRY_OVERHEAD_BYTES + 64 * 1024
}

/// Resource guards that run before anything is written.
pub(crate) fn check_destination(
    destination: &Path,
    estimated: u64,
    overwrite: bool,
    probe: &dyn VolumeProbe,
) -> Result<()> {
    if destination.exists() && !overwrite {
        return Err(BackupError::DestinationExists {
            path: destination.to_path_buf(),
        });
    }
    if let Some(ceiling) = probe.max_file_size(destination)
        && estimated > ceiling
    {
        return Err(BackupError::FileSizeCeiling {
            path: destination.to_path_buf(),
            estimated,
            ceiling,
        });
    }
    let available = probe
        .available_space(destination)
        .map_err(BackupError::io("query free space at", destination))?;
    if available < estimated {
        return Err(BackupError::InsufficientSpace {
            path: destination.to_path_buf(),
            required: estimated,
            available,
        });
    }
    Ok(())
}

/// Write `snapshot` as an archive at `destination`.
pub(crate) fn write_archive(
    snapshot: &Snapshot,
    destination: &Path,
    app_version: &str,
    options: &ExportOptions,
    probe: &dyn VolumeProbe,
    cancel: &CancellationToken,
    board: &StatusBoard,
) -> Result<ArchiveSummary> {
    let encoded = EncodedPayload::encode(snapshot)?;
    let estimated = estimate_size(snapshot, &encoded);
    check_destination(destination, estimated, options.overwrite, probe)?;

    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(BackupError::io("create directory", parent))?;
    }

    let partial = with_suffix(destination, PARTIAL_SUFFIX);
    let written = write_entries(snapshot, &encoded, &partial, app_version, estimated, cancel, board);
    let (manifest, entries) = match written {
        Ok(done) => done,
        Err(e) => {
            if let Err(cleanup) = remove_file_if_exists(&partial) {
                warn!(error = %cleanup, "failed to remove partial archive");
            }
            return Err(e);
        }
    };

    // rename does not replace an existing file on Windows
    if cfg!(windows) && options.overwrite {
        remove_file_if_exists(destination)?;
    }
    rename_durable(&partial, destination)?;

    let size_bytes = fs::metadata(destination)
        .map_err(BackupError::io("read metadata", destination))?
        .len();
    info!(
        path = %destination.display(),
        size_bytes,
        entries,
        warnings = manifest.warnings.len(),
        "archive written"
    );
    Ok(ArchiveSummary {
        path: destination.to_path_buf(),
        size_bytes,
        entries,
        manifest,
    })
}

fn write_entries(
    snapshot: &Snapshot,
    encoded: &EncodedPayload,
    partial: &Path,
    app_version: &str,
    estimated: u64,
    cancel: &CancellationToken,
    board: &StatusBoard,
) -> Result<(Manifest, usize)> {
    let file = File::create(partial).map_err(BackupError::io("create", partial))?;
    let mut zip = zip::ZipWriter::new(BufWriter::new(file));
    let documents = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);
    let stored = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .unix_permissions(0o644);

    let mut builder = ManifestBuilder::new(app_version, snapshot.scope);
    let mut tracker = ProgressTracker::new(board, Stage::WriteArchive, estimated);
    let mut entries = 0_usize;

    for (path, bytes) in encoded.documents() {
        cancel.check(Stage::WriteArchive)?;
        zip.start_file(path, documents)
            .map_err(BackupError::zip(partial))?;
        zip.write_all(bytes).map_err(BackupError::io("write", partial))?;
        builder.record_entry(path, &sha256_bytes(bytes));
        tracker.advance(bytes.len() as u64);
        entries += 1;
    }

    for warning in &snapshot.warnings {
        builder.warn(warning.clone());
    }

    let mut included = 0_u64;
    if snapshot.scope.includes_recordings() {
        let mut buffer = vec![0_u8; BUFFER_SIZE];
        for recording in &snapshot.recordings {
            cancel.check(Stage::WriteArchive)?;
            let source = match File::open(&recording.path) {
                Ok(file) => file,
                Err(_) => {
                    let warning = BackupError::MissingRecording {
                        name: recording.name.clone(),
                    };
                    debug!("{warning}");
                    builder.warn(warning.to_string());
                    continue;
                }
            };
            let entry = paths::recording(&recording.name);
            let options = stored.large_file(recording.size >= u64::from(u32::MAX));
            zip.start_file(entry.as_str(), options)
                .map_err(BackupError::zip(partial))?;

            let mut reader = HashingReader::new(BufReader::with_capacity(BUFFER_SIZE, source));
            loop {
                let n = reader
                    .read(&mut buffer)
                    .map_err(BackupError::io("read", &recording.path))?;
                if n == 0 {
                    break;
                }
                zip.write_all(&buffer[..n])
                    .map_err(BackupError::io("write", partial))?;
                tracker.advance(n as u64);
                cancel.check(Stage::WriteArchive)?;
            }
            let (hash, _) = reader.finish();
            builder.record_entry(&entry, &hash);
            included += 1;
            entries += 1;
        }
    }

    builder.record_component(ComponentKind::History, snapshot.history.len() as u64);
    builder.record_component(ComponentKind::Dictionary, snapshot.dictionary.len() as u64);
    builder.record_component(ComponentKind::Settings, snapshot.settings.len() as u64);
    builder.record_component(ComponentKind::Recordings, included);

    let (manifest, checksums) = builder.finish();

    zip.start_file(paths::CHECKSUMS, documents)
        .map_err(BackupError::zip(partial))?;
    zip.write_all(checksums.render().as_bytes())
        .map_err(BackupError::io("write", partial))?;

    let manifest_bytes =
        serde_json::to_vec_pretty(&manifest).map_err(BackupError::json("encode", "manifest"))?;
    zip.start_file(paths::MANIFEST, documents)
        .map_err(BackupError::zip(partial))?;
    zip.write_all(&manifest_bytes)
        .map_err(BackupError::io("write", partial))?;
    entries += 2;

    let writer = zip.finish().map_err(BackupError::zip(partial))?;
    let file = writer
        .into_inner()
        .map_err(|e| BackupError::io("flush", partial)(e.into_error()))?;
    file.sync_all().map_err(BackupError::io("sync", partial))?;
    tracker.finish();

    Ok((manifest, entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_default_file_name() {
        let now = Local.with_ymd_and_hms(2025, 3, 7, 9, 5, 0).unwrap();
        assert_eq!(default_file_name(now), "codictate-backup-2025-03-07_09-05.zip");
    }

    #[test]
    fn test_resolve_destination_appends_extension() {
        let dir = tempfile::tempdir().unwrap();
        let now = Local.with_ymd_and_hms(2025, 3, 7, 9, 5, 0).unwrap();

        assert_eq!(
            resolve_destination(&dir.path().join("mine"), now),
            dir.path().join("mine.zip")
        );
        assert_eq!(
            resolve_destination(&dir.path().join("mine.ZIP"), now),
            dir.path().join("mine.ZIP")
        );
        assert_eq!(
            resolve_destination(dir.path(), now),
            dir.path().join("codictate-backup-2025-03-07_09-05.zip")
        );
    }
}
