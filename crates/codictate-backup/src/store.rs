//! Collaborator interfaces for the application's data stores.
//!
//! The engine never copies store files behind the stores' backs: export reads
//! through these traits and staged import writes through them into the
//! staging directory. [`LocalStores`] is the file-backed implementation over
//! one data directory (`active/` or `.restore/staging/`).

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use codictate_model::{DictionaryEntry, HistoryRecord, StatsSnapshot};
use serde_json::{Map, Value};
use tracing::warn;
use unicode_segmentation::UnicodeSegmentation;

use crate::error::{BackupError, Result};
use crate::io::write_atomic;
use crate::quiesce::WriteGuard;

/// Transcript history rows.
pub trait HistoryStore {
    /// Read every row in id order.
    fn read_history(&self) -> Result<Vec<HistoryRecord>>;
    /// Replace the full history with `rows`.
    fn import_history(&self, rows: &[HistoryRecord]) -> Result<()>;
}

/// Learned-word dictionary.
pub trait DictionaryStore {
    /// Read all entries.
    fn read_dictionary(&self) -> Result<Vec<DictionaryEntry>>;
    /// Replace the dictionary with `entries`.
    fn import_dictionary(&self, entries: &[DictionaryEntry]) -> Result<()>;
}

/// Application settings.
pub trait SettingsStore {
    /// Read the full settings object, including non-portable fields.
    fn read_settings(&self) -> Result<Map<String, Value>>;
    /// Write a merged settings object.
    fn write_settings(&self, settings: &Map<String, Value>) -> Result<()>;
}

/// Audio recordings referenced by history rows.
pub trait RecordingStore {
    /// Resolve a recording file name to its path.
    fn recording_path(&self, file_name: &str) -> PathBuf;
    /// Move or copy an extracted recording into the store under `file_name`.
    fn import_recording(&self, file_name: &str, source: &Path) -> Result<()>;
}

/// Stats engine entry point. Stats are always recomputed, never imported.
pub trait StatsEngine: Send + Sync {
    /// Recompute aggregate stats from history rows.
    fn recompute_from_history(&self, rows: &[HistoryRecord]) -> StatsSnapshot;
}

/// Default stats engine: Unicode word count and summed durations.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordCountStats;

impl StatsEngine for WordCountStats {
    fn recompute_from_history(&self, rows: &[HistoryRecord]) -> StatsSnapshot {
        rows.iter().fold(StatsSnapshot::default(), |mut acc, row| {
            acc.total_words += row.effective_text().unicode_words().count() as u64;
            acc.total_duration_ms += row.duration_ms.max(0) as u64;
            acc.total_transcriptions += 1;
            acc
        })
    }
}

/// File-backed stores over one data directory.
#[derive(Debug, Clone)]
pub struct LocalStores {
    dir: PathBuf,
}

impl LocalStores {
    const HISTORY: &'static str = "history.jsonl";
    const DICTIONARY: &'static str = "dictionary.json";
    const SETTINGS: &'static str = "settings_store.json";
    const STATS: &'static str = "stats.json";
    const RECORDINGS: &'static str = "recordings";

    /// Open the stores rooted at `dir`.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Whether an entry of the data directory belongs to these stores.
    pub(crate) fn is_managed(name: &str) -> bool {
        [
            Self::HISTORY,
            Self::DICTIONARY,
            Self::SETTINGS,
            Self::STATS,
            Self::RECORDINGS,
        ]
        .contains(&name)
    }

    /// Directory the stores live in.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory holding recordings.
    #[must_use]
    pub fn recordings_dir(&self) -> PathBuf {
        self.dir.join(Self::RECORDINGS)
    }

    /// Append one history row through the application write path.
    ///
    /// Requires a [`WriteGuard`], so writes are rejected while a restore has
    /// quiesced the active data.
    pub fn append_history(&self, _guard: &WriteGuard, row: &HistoryRecord) -> Result<()> {
        let path = self.dir.join(Self::HISTORY);
        fs::create_dir_all(&self.dir).map_err(BackupError::io("create directory", &self.dir))?;
        let line = serde_json::to_string(row).map_err(BackupError::json("encode", "history row"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(BackupError::io("open", &path))?;
        writeln!(file, "{line}").map_err(BackupError::io("write", &path))?;
        file.sync_data().map_err(BackupError::io("sync", &path))
    }

    /// Read the persisted stats snapshot (defaults when absent).
    pub fn read_stats(&self) -> Result<StatsSnapshot> {
        read_json_or_default(&self.dir.join(Self::STATS), "stats")
    }

    /// Persist a stats snapshot.
    pub fn write_stats(&self, stats: &StatsSnapshot) -> Result<()> {
        write_json(&self.dir.join(Self::STATS), stats, "stats")
    }
}

impl HistoryStore for LocalStores {
    fn read_history(&self) -> Result<Vec<HistoryRecord>> {
        let path = self.dir.join(Self::HISTORY);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BackupError::io("open", &path)(e)),
        };

        let mut rows = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(BackupError::io("read", &path))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryRecord>(&line) {
                Ok(row) => rows.push(row),
                Err(e) => warn!(line = index + 1, column = e.column(), "skipping unreadable history row"),
            }
        }
        rows.sort_by_key(|row| row.id);
        Ok(rows)
    }

    fn import_history(&self, rows: &[HistoryRecord]) -> Result<()> {
        let mut buf = Vec::with_capacity(rows.len() * 256);
        for row in rows {
            serde_json::to_writer(&mut buf, row).map_err(BackupError::json("encode", "history row"))?;
            buf.push(b'\n');
        }
        write_atomic(&self.dir.join(Self::HISTORY), &buf)
    }
}

impl DictionaryStore for LocalStores {
    fn read_dictionary(&self) -> Result<Vec<DictionaryEntry>> {
        read_json_or_default(&self.dir.join(Self::DICTIONARY), "dictionary")
    }

    fn import_dictionary(&self, entries: &[DictionaryEntry]) -> Result<()> {
        write_json(&self.dir.join(Self::DICTIONARY), &entries, "dictionary")
    }
}

impl SettingsStore for LocalStores {
    fn read_settings(&self) -> Result<Map<String, Value>> {
        read_json_or_default(&self.dir.join(Self::SETTINGS), "settings")
    }

    fn write_settings(&self, settings: &Map<String, Value>) -> Result<()> {
        write_json(&self.dir.join(Self::SETTINGS), settings, "settings")
    }
}

impl RecordingStore for LocalStores {
    fn recording_path(&self, file_name: &str) -> PathBuf {
        self.recordings_dir().join(file_name)
    }

    fn import_recording(&self, file_name: &str, source: &Path) -> Result<()> {
        let dir = self.recordings_dir();
        fs::create_dir_all(&dir).map_err(BackupError::io("create directory", &dir))?;
        let target = dir.join(file_name);
        if fs::rename(source, &target).is_err() {
            fs::copy(source, &target).map_err(BackupError::io("copy", source))?;
            fs::remove_file(source).map_err(BackupError::io("remove", source))?;
        }
        Ok(())
    }
}

fn read_json_or_default<T>(path: &Path, what: &str) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(BackupError::json("decode", what)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(BackupError::io("read", path)(e)),
    }
}

fn write_json<T: serde::Serialize + ?Sized>(path: &Path, value: &T, what: &str) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(BackupError::json("encode", what))?;
    write_atomic(path, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quiesce::WriteGate;
    use serde_json::json;
    use tempfile::tempdir;

    fn row(id: i64, text: &str) -> HistoryRecord {
        HistoryRecord {
            id,
            title: format!("row {id}"),
            transcription_text: text.into(),
            post_processed_text: None,
            post_process_prompt: None,
            timestamp: 1_700_000_000 + id,
            duration_ms: 1_500,
            saved: false,
            recording_filename: None,
        }
    }

    #[test]
    fn test_empty_store_reads_defaults() {
        let dir = tempdir().unwrap();
        let stores = LocalStores::at(dir.path());
        assert!(stores.read_history().unwrap().is_empty());
        assert!(stores.read_dictionary().unwrap().is_empty());
        assert!(stores.read_settings().unwrap().is_empty());
        assert_eq!(stores.read_stats().unwrap(), StatsSnapshot::default());
    }

    #[test]
    fn test_history_import_and_append() {
        let dir = tempdir().unwrap();
        let stores = LocalStores::at(dir.path());
        stores.import_history(&[row(2, "b"), row(1, "a")]).unwrap();

        let gate = WriteGate::new();
        let guard = gate.begin_write().unwrap();
        stores.append_history(&guard, &row(3, "c")).unwrap();

        let ids: Vec<i64> = stores.read_history().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_settings_round_trip() {
        let dir = tempdir().unwrap();
        let stores = LocalStores::at(dir.path());
        let Value::Object(settings) = json!({"selected_language": "en"}) else {
            unreachable!()
        };
        stores.write_settings(&settings).unwrap();
        assert_eq!(stores.read_settings().unwrap(), settings);
    }

    #[test]
    fn test_word_count_stats() {
        let mut rows = vec![row(1, "hello there world"), row(2, "ignored raw")];
        rows[1].post_processed_text = Some("one two".into());
        let stats = WordCountStats.recompute_from_history(&rows);
        assert_eq!(stats.total_words, 5);
        assert_eq!(stats.total_duration_ms, 3_000);
        assert_eq!(stats.total_transcriptions, 2);
    }
}
