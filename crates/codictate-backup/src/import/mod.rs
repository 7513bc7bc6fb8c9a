//! Staged import.
//!
//! Three restore phases live here. Each writes only below `.restore/`:
//!
//! - `StagingImport` extracts the verified entries into `work/` and re-hashes
//!   them, so an archive swapped after preflight is still caught.
//! - `Migrate` decodes every payload at the version its manifest records,
//!   migrates it to the current schema and resolves conflicts.
//! - `Validate` assembles `staging/` in the active layout, verifies it and
//!   writes the `staging.complete` sentinel.
//!
//! Active data is only read: the current dictionary and settings for merging,
//! files the stores do not own, and recordings the archive does not carry.

pub mod conflict;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use codictate_model::{
    ComponentKind, DictionaryEntry, DictionaryRow, HistoryRecord, Manifest, SettingsPayload,
    StatsSnapshot, collision_key, normalize_name, paths,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

pub use conflict::{Rekey, rekey_history, resolve_recording_names};

use crate::archive::{self, EntryMeta};
use crate::checksum::BUFFER_SIZE;
use crate::config::SoftLimits;
use crate::error::{BackupError, Result};
use crate::export::snapshot::is_plain_file_name;
use crate::io::{remove_dir_if_exists, remove_file_if_exists, write_atomic};
use crate::layout::DataDir;
use crate::preflight::{PreflightReport, scan_history};
use crate::progress::{CancellationToken, ProgressTracker, Stage, StatusBoard};
use crate::session::Phase;
use crate::store::{
    DictionaryStore, HistoryStore, LocalStores, RecordingStore, SettingsStore, StatsEngine,
};

/// What a restore imported, skipped and changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportCounts {
    pub history_restored: u64,
    pub history_skipped: u64,
    pub dictionary_added: u64,
    pub dictionary_duplicates: u64,
    pub dictionary_skipped: u64,
    pub recordings_restored: u64,
    /// Referenced recordings kept from the current data.
    pub recordings_carried_over: u64,
    pub recordings_missing: u64,
    pub ids_rekeyed: u64,
    pub recordings_renamed: u64,
    pub settings_applied: u64,
    pub settings_dropped: u64,
}

/// Payload extracted into the work directory.
#[derive(Debug)]
pub(crate) struct Extracted {
    manifest: Manifest,
    history: PathBuf,
    dictionary: PathBuf,
    settings: PathBuf,
    /// NFC archive name and extracted file, in archive order.
    recordings: Vec<(String, PathBuf)>,
}

/// Payload decoded and migrated to the current schema.
#[derive(Debug)]
pub(crate) struct Migrated {
    history: Vec<HistoryRecord>,
    dictionary: Vec<DictionaryEntry>,
    settings: SettingsPayload,
    /// Final name and extracted file.
    recordings: Vec<(String, PathBuf)>,
    /// Referenced recordings the archive does not carry.
    absent: BTreeSet<String>,
    counts: ImportCounts,
    warnings: Vec<String>,
    details: Vec<String>,
}

/// Staging area ready for commit.
#[derive(Debug)]
pub(crate) struct Staged {
    pub(crate) counts: ImportCounts,
    pub(crate) stats: StatsSnapshot,
    pub(crate) warnings: Vec<String>,
    pub(crate) details: Vec<String>,
}

/// Shared inputs of the import phases.
pub(crate) struct StagedImport<'a> {
    pub(crate) data: &'a DataDir,
    pub(crate) limits: &'a SoftLimits,
    pub(crate) stats: &'a dyn StatsEngine,
    pub(crate) cancel: &'a CancellationToken,
    pub(crate) board: &'a StatusBoard,
}

impl StagedImport<'_> {
    /// `StagingImport`: extract verified entries into `.restore/work/`.
    pub(crate) fn extract(&self, preflight: &PreflightReport) -> Result<Extracted> {
        const STAGE: Stage = Stage::Restore(Phase::StagingImport);

        let manifest = preflight
            .manifest
            .clone()
            .ok_or_else(|| BackupError::MissingEntry {
                path: paths::MANIFEST.to_string(),
            })?;
        let work = self.data.work();
        remove_dir_if_exists(&work)?;
        fs::create_dir_all(&work).map_err(BackupError::io("create directory", &work))?;

        let archive_path = &preflight.archive;
        let mut zip = archive::open(archive_path)?;
        let wanted: Vec<&EntryMeta> = preflight
            .entries
            .iter()
            .filter(|e| !e.is_dir && preflight.checksums.contains(&e.name))
            .filter(|e| is_imported(&e.name, manifest.includes_recordings))
            .collect();
        let total = wanted.iter().map(|e| e.size).sum();
        let mut tracker = ProgressTracker::new(self.board, STAGE, total);

        let mut recordings = Vec::new();
        for entry in wanted {
            self.cancel.check(STAGE)?;
            let target = match entry.name.strip_prefix(paths::RECORDINGS_PREFIX) {
                Some(name) => {
                    let target = work
                        .join("recordings")
                        .join(format!("{:06}.bin", recordings.len()));
                    recordings.push((name.to_string(), target.clone()));
                    target
                }
                None => work.join(&entry.name),
            };
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(BackupError::io("create directory", parent))?;
            }

            let file = File::create(&target).map_err(BackupError::io("create", &target))?;
            let mut out = BufWriter::new(file);
            let actual = archive::stream_entry(
                &mut zip,
                entry,
                archive_path,
                &mut out,
                self.cancel,
                STAGE,
                &mut tracker,
            )?;
            let file = out
                .into_inner()
                .map_err(|e| BackupError::io("flush", &target)(e.into_error()))?;
            file.sync_all().map_err(BackupError::io("sync", &target))?;

            let expected = preflight.checksums.get(&entry.name).unwrap_or_default();
            if actual != expected {
                return Err(BackupError::ChecksumMismatch {
                    path: entry.name.clone(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        tracker.finish();
        debug!(recordings = recordings.len(), "entries extracted");

        Ok(Extracted {
            manifest,
            history: work.join(paths::HISTORY),
            dictionary: work.join(paths::DICTIONARY),
            settings: work.join(paths::SETTINGS),
            recordings,
        })
    }

    /// `Migrate`: decode, migrate and resolve conflicts.
    pub(crate) fn migrate(&self, extracted: Extracted) -> Result<Migrated> {
        const STAGE: Stage = Stage::Restore(Phase::Migrate);

        let manifest = &extracted.manifest;
        let mut counts = ImportCounts::default();
        let mut warnings = Vec::new();
        let mut details = Vec::new();
        let expected_rows = manifest.count(ComponentKind::History);
        let mut tracker = ProgressTracker::new(self.board, STAGE, expected_rows);

        let file = File::open(&extracted.history).map_err(BackupError::io("open", &extracted.history))?;
        let mut reader = BufReader::with_capacity(BUFFER_SIZE, file);
        let mut history = Vec::with_capacity(usize::try_from(expected_rows.min(1 << 20)).unwrap_or(0));
        let scan = scan_history(
            &mut reader,
            manifest.payload_version(ComponentKind::History),
            self.limits.max_history_line_bytes,
            self.cancel,
            STAGE,
            |row| {
                history.push(row);
                tracker.advance(1);
            },
        )?;
        counts.history_skipped = scan.skipped();
        if let Some(skipped) = scan.skipped_error() {
            warnings.push(skipped.to_string());
        }
        details.extend(scan.details);

        let dictionary = decode_dictionary(
            &extracted.dictionary,
            manifest.payload_version(ComponentKind::Dictionary),
            &mut counts,
            &mut details,
        )?;
        if counts.dictionary_skipped > 0 {
            warnings.push(format!(
                "{} dictionary entr{} could not be read and were skipped",
                counts.dictionary_skipped,
                if counts.dictionary_skipped == 1 { "y" } else { "ies" }
            ));
        }
        let settings = decode_settings(&extracted.settings)?;
        self.cancel.check(STAGE)?;

        let rekeys = rekey_history(&mut history);
        counts.ids_rekeyed = rekeys.len() as u64;
        for rekey in &rekeys {
            details.push(format!(
                "history row {} had duplicate id {} and was given id {}",
                rekey.position + 1,
                rekey.from,
                rekey.to
            ));
        }
        if !rekeys.is_empty() {
            warnings.push(format!("{} duplicate history id(s) were given new ids", rekeys.len()));
        }

        let names: Vec<String> = extracted.recordings.iter().map(|(n, _)| n.clone()).collect();
        let resolved = resolve_recording_names(&names);
        let mut renamed: HashMap<&str, &str> = HashMap::new();
        for (original, final_name) in names.iter().zip(&resolved) {
            if original != final_name {
                details.push(format!("recording {original} was renamed to {final_name}"));
                renamed.insert(original.as_str(), final_name.as_str());
            }
        }
        counts.recordings_renamed = renamed.len() as u64;
        if !renamed.is_empty() {
            warnings.push(format!(
                "{} recording(s) with clashing names were renamed",
                renamed.len()
            ));
        }

        let available: HashSet<&str> = names.iter().map(String::as_str).collect();
        let mut absent = BTreeSet::new();
        for row in &mut history {
            let Some(name) = row.recording_filename.as_mut() else {
                continue;
            };
            let key = normalize_name(name);
            if let Some(final_name) = renamed.get(key.as_str()) {
                *name = (*final_name).to_string();
            } else if available.contains(key.as_str()) {
                *name = key;
            } else {
                absent.insert(name.clone());
            }
        }

        let recordings = resolved
            .into_iter()
            .zip(extracted.recordings.into_iter().map(|(_, path)| path))
            .collect();
        tracker.finish();

        Ok(Migrated {
            history,
            dictionary,
            settings,
            recordings,
            absent,
            counts,
            warnings,
            details,
        })
    }

    /// `Validate`: assemble and verify `.restore/staging/`.
    pub(crate) fn validate(
        &self,
        migrated: Migrated,
        current: &LocalStores,
        session: &str,
    ) -> Result<Staged> {
        const STAGE: Stage = Stage::Restore(Phase::Validate);

        let Migrated {
            history,
            dictionary,
            settings,
            recordings,
            absent,
            mut counts,
            mut warnings,
            mut details,
        } = migrated;

        let staging_dir = self.data.staging();
        remove_file_if_exists(&self.data.staging_complete())?;
        remove_dir_if_exists(&staging_dir)?;
        fs::create_dir_all(&staging_dir).map_err(BackupError::io("create directory", &staging_dir))?;
        let staging = LocalStores::at(&staging_dir);
        let steps = 5 + recordings.len() as u64 + absent.len() as u64;
        let mut tracker = ProgressTracker::new(self.board, STAGE, steps);

        let left_behind = carry_over_unmanaged(current.dir(), &staging_dir)?;
        if !left_behind.is_empty() {
            warnings.push(format!(
                "{} file(s) in the data folder could not be carried over",
                left_behind.len()
            ));
            details.extend(
                left_behind
                    .iter()
                    .map(|path| format!("{} was not carried over", path.display())),
            );
        }
        tracker.advance(1);
        self.cancel.check(STAGE)?;

        staging.import_history(&history)?;
        counts.history_restored = history.len() as u64;
        tracker.advance(1);

        let mut merged = current.read_dictionary()?;
        let mut keys: HashSet<String> = merged.iter().map(DictionaryEntry::dedup_key).collect();
        for entry in dictionary {
            if keys.insert(entry.dedup_key()) {
                merged.push(entry);
                counts.dictionary_added += 1;
            } else {
                counts.dictionary_duplicates += 1;
            }
        }
        staging.import_dictionary(&merged)?;
        tracker.advance(1);

        let merge = settings.merge_into(&current.read_settings()?);
        counts.settings_applied = merge.applied.len() as u64;
        counts.settings_dropped = merge.dropped.len() as u64;
        for field in &merge.dropped {
            details.push(format!("setting {field} is not used by this version and was dropped"));
        }
        staging.write_settings(&merge.merged)?;
        tracker.advance(1);

        let mut imported_keys = HashSet::with_capacity(recordings.len());
        for (name, source) in &recordings {
            self.cancel.check(STAGE)?;
            staging.import_recording(name, source)?;
            imported_keys.insert(collision_key(name));
            counts.recordings_restored += 1;
            tracker.advance(1);
        }
        for name in &absent {
            let source = current.recording_path(name);
            let usable = is_plain_file_name(name)
                && !imported_keys.contains(&collision_key(name))
                && source.is_file();
            if usable {
                let target = staging.recording_path(name);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(BackupError::io("create directory", parent))?;
                }
                link_or_copy(&source, &target)?;
                counts.recordings_carried_over += 1;
            } else {
                counts.recordings_missing += 1;
                details.push(BackupError::MissingRecording { name: name.clone() }.to_string());
            }
            tracker.advance(1);
        }
        if counts.recordings_missing > 0 {
            warnings.push(format!(
                "{} recording(s) referenced by history are missing",
                counts.recordings_missing
            ));
        }

        let stats = self.stats.recompute_from_history(&history);
        staging.write_stats(&stats)?;

        verify_staging(&staging, &history, merged.len(), &recordings)?;
        write_atomic(&self.data.staging_complete(), session.as_bytes())?;
        remove_dir_if_exists(&self.data.work())?;
        tracker.finish();

        info!(
            history_restored = counts.history_restored,
            history_skipped = counts.history_skipped,
            dictionary_added = counts.dictionary_added,
            recordings_restored = counts.recordings_restored,
            recordings_missing = counts.recordings_missing,
            ids_rekeyed = counts.ids_rekeyed,
            recordings_renamed = counts.recordings_renamed,
            "staging ready"
        );
        Ok(Staged {
            counts,
            stats,
            warnings,
            details,
        })
    }
}

fn is_imported(name: &str, includes_recordings: bool) -> bool {
    matches!(name, paths::HISTORY | paths::DICTIONARY | paths::SETTINGS)
        || (includes_recordings && name.starts_with(paths::RECORDINGS_PREFIX))
}

fn decode_dictionary(
    path: &Path,
    version: u32,
    counts: &mut ImportCounts,
    details: &mut Vec<String>,
) -> Result<Vec<DictionaryEntry>> {
    let bytes = fs::read(path).map_err(BackupError::io("read", path))?;
    let invalid = |reason: String| BackupError::InvalidManifest {
        entry: "dictionary payload",
        reason,
    };
    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|e| invalid(format!("{:?} error at line {}", e.classify(), e.line())))?;
    let Value::Array(items) = value else {
        return Err(invalid("expected a list of entries".into()));
    };

    let mut entries = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        match DictionaryRow::decode(version, item) {
            Ok(row) => entries.push(row.into_current()),
            Err(e) => {
                counts.dictionary_skipped += 1;
                details.push(format!("dictionary entry {}: {e}", index + 1));
            }
        }
    }
    Ok(entries)
}

fn decode_settings(path: &Path) -> Result<SettingsPayload> {
    let bytes = fs::read(path).map_err(BackupError::io("read", path))?;
    let invalid = |reason: String| BackupError::InvalidManifest {
        entry: "settings payload",
        reason,
    };
    match serde_json::from_slice(&bytes) {
        Ok(Value::Object(fields)) => Ok(SettingsPayload::from_fields(fields)),
        Ok(_) => Err(invalid("expected an object".into())),
        Err(e) => Err(invalid(format!("{:?} error at line {}", e.classify(), e.line()))),
    }
}

/// Copy entries of `active` the stores do not own into `staging`.
///
/// Returns the entries that could not be carried over.
fn carry_over_unmanaged(active: &Path, staging: &Path) -> Result<Vec<PathBuf>> {
    let mut left_behind = Vec::new();
    let entries = match fs::read_dir(active) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(left_behind),
        Err(e) => return Err(BackupError::io("read directory", active)(e)),
    };
    for entry in entries {
        let entry = entry.map_err(BackupError::io("read directory", active))?;
        let name = entry.file_name();
        if name.to_str().is_some_and(LocalStores::is_managed) {
            continue;
        }
        copy_tree(&entry.path(), &staging.join(&name), &mut left_behind)?;
    }
    Ok(left_behind)
}

fn copy_tree(source: &Path, target: &Path, left_behind: &mut Vec<PathBuf>) -> Result<()> {
    let meta = fs::symlink_metadata(source).map_err(BackupError::io("read metadata", source))?;
    let file_type = meta.file_type();
    if file_type.is_dir() {
        fs::create_dir_all(target).map_err(BackupError::io("create directory", target))?;
        for entry in fs::read_dir(source).map_err(BackupError::io("read directory", source))? {
            let entry = entry.map_err(BackupError::io("read directory", source))?;
            copy_tree(&entry.path(), &target.join(entry.file_name()), left_behind)?;
        }
        Ok(())
    } else if file_type.is_file() {
        link_or_copy(source, target)
    } else if file_type.is_symlink() {
        if let Err(e) = copy_symlink(source, target) {
            warn!(path = %source.display(), error = %e, "could not recreate symlink");
            left_behind.push(source.to_path_buf());
        }
        Ok(())
    } else {
        debug!(path = %source.display(), "not carrying over special file");
        left_behind.push(source.to_path_buf());
        Ok(())
    }
}

/// Recreate the link itself; its target is not followed.
#[cfg(unix)]
fn copy_symlink(source: &Path, target: &Path) -> std::io::Result<()> {
    let link = fs::read_link(source)?;
    std::os::unix::fs::symlink(link, target)
}

#[cfg(windows)]
fn copy_symlink(source: &Path, target: &Path) -> std::io::Result<()> {
    let link = fs::read_link(source)?;
    if fs::metadata(source).is_ok_and(|meta| meta.is_dir()) {
        std::os::windows::fs::symlink_dir(link, target)
    } else {
        std::os::windows::fs::symlink_file(link, target)
    }
}

#[cfg(not(any(unix, windows)))]
fn copy_symlink(_source: &Path, _target: &Path) -> std::io::Result<()> {
    Err(std::io::ErrorKind::Unsupported.into())
}

/// Hard-link `source` to `target`, copying when linking is not possible.
fn link_or_copy(source: &Path, target: &Path) -> Result<()> {
    if fs::hard_link(source, target).is_ok() {
        return Ok(());
    }
    fs::copy(source, target).map_err(BackupError::io("copy", source))?;
    Ok(())
}

fn verify_staging(
    staging: &LocalStores,
    history: &[HistoryRecord],
    dictionary_len: usize,
    recordings: &[(String, PathBuf)],
) -> Result<()> {
    let invalid = |reason: String| BackupError::StagingInvalid { reason };

    let staged_history = staging.read_history()?;
    if staged_history.len() != history.len() {
        return Err(invalid(format!(
            "{} history rows staged, {} expected",
            staged_history.len(),
            history.len()
        )));
    }
    let ids: HashSet<i64> = staged_history.iter().map(|row| row.id).collect();
    if ids.len() != staged_history.len() {
        return Err(invalid("history ids are not unique".into()));
    }
    let staged_dictionary = staging.read_dictionary()?.len();
    if staged_dictionary != dictionary_len {
        return Err(invalid(format!(
            "{staged_dictionary} dictionary entries staged, {dictionary_len} expected"
        )));
    }
    if let Some((name, _)) = recordings
        .iter()
        .find(|(name, _)| !staging.recording_path(name).is_file())
    {
        return Err(invalid(format!("recording {name} was not staged")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_decode_dictionary_skips_bad_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dictionary.json");
        fs::write(
            &path,
            json!([
                {"input": "Kubernetes", "replacement": "Kubernetes"},
                {"input": 3},
                {"input": "gRPC", "replacement": "gRPC", "is_replacement": true}
            ])
            .to_string(),
        )
        .unwrap();

        let mut counts = ImportCounts::default();
        let mut details = Vec::new();
        let entries = decode_dictionary(&path, 1, &mut counts, &mut details).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.aliases.is_empty()));
        assert_eq!(counts.dictionary_skipped, 1);
        assert_eq!(details.len(), 1);
    }

    #[test]
    fn test_decode_settings_requires_object() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "[1, 2]").unwrap();
        assert!(matches!(
            decode_settings(&path),
            Err(BackupError::InvalidManifest { .. })
        ));

        fs::write(&path, r#"{"push_to_talk": true}"#).unwrap();
        assert_eq!(decode_settings(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_unmanaged_files_carried_over() {
        let dir = tempdir().unwrap();
        let active = dir.path().join("active");
        let staging = dir.path().join("staging");
        fs::create_dir_all(active.join("models")).unwrap();
        fs::create_dir_all(active.join("recordings")).unwrap();
        fs::create_dir_all(&staging).unwrap();
        fs::write(active.join("models").join("base.bin"), b"model").unwrap();
        fs::write(active.join("history.jsonl"), b"old").unwrap();
        fs::write(active.join("recordings").join("a.wav"), b"a").unwrap();

        assert!(carry_over_unmanaged(&active, &staging).unwrap().is_empty());
        assert_eq!(fs::read(staging.join("models").join("base.bin")).unwrap(), b"model");
        assert!(!staging.join("history.jsonl").exists());
        assert!(!staging.join("recordings").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_unmanaged_symlinks_recreated() {
        let dir = tempdir().unwrap();
        let active = dir.path().join("active");
        let staging = dir.path().join("staging");
        let models = dir.path().join("shared-models");
        fs::create_dir_all(&active).unwrap();
        fs::create_dir_all(&staging).unwrap();
        fs::create_dir_all(&models).unwrap();
        fs::write(models.join("base.bin"), b"model").unwrap();
        std::os::unix::fs::symlink(&models, active.join("models")).unwrap();
        std::os::unix::fs::symlink("missing-target", active.join("dangling")).unwrap();

        assert!(carry_over_unmanaged(&active, &staging).unwrap().is_empty());
        assert_eq!(fs::read_link(staging.join("models")).unwrap(), models);
        assert_eq!(fs::read(staging.join("models").join("base.bin")).unwrap(), b"model");
        assert_eq!(
            fs::read_link(staging.join("dangling")).unwrap(),
            PathBuf::from("missing-target")
        );
    }

    #[test]
    fn test_is_imported() {
        assert!(is_imported(paths::HISTORY, false));
        assert!(!is_imported(paths::STATS_SNAPSHOT, true));
        assert!(is_imported("recordings/a.wav", true));
        assert!(!is_imported("recordings/a.wav", false));
    }
}
