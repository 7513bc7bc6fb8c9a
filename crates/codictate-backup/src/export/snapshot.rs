//! Snapshot of the live stores for export.
//!
//! Reads go through the store traits only. `full` scope resolves every
//! recording referenced by history; missing files become manifest warnings
//! and are left out of the archive.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;

use codictate_model::{
    DictionaryEntry, HistoryRecord, Scope, SettingsPayload, StatsSnapshot, normalize_name,
};
use tracing::{debug, warn};

use crate::error::{BackupError, Result};
use crate::import::conflict::suffixed;
use crate::store::{DictionaryStore, HistoryStore, RecordingStore, SettingsStore, StatsEngine};

/// A recording to be copied into the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSource {
    /// NFC file name used inside the archive.
    pub name: String,
    /// Location on disk.
    pub path: PathBuf,
    /// Size at snapshot time.
    pub size: u64,
}

/// Logical payload captured from the stores.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Export scope.
    pub scope: Scope,
    /// History rows.
    pub history: Vec<HistoryRecord>,
    /// Dictionary entries.
    pub dictionary: Vec<DictionaryEntry>,
    /// Allow-listed settings.
    pub settings: SettingsPayload,
    /// Stats at export time (informational only).
    pub stats: StatsSnapshot,
    /// Recordings to include.
    pub recordings: Vec<RecordingSource>,
    /// Non-fatal findings, e.g. missing recordings.
    pub warnings: Vec<String>,
}

impl Snapshot {
    /// Uncompressed size of the recordings.
    #[must_use]
    pub fn recordings_bytes(&self) -> u64 {
        self.recordings.iter().map(|r| r.size).sum()
    }
}

/// Whether a stored recording name is a plain file name.
pub(crate) fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
        && !name.contains(':')
}

/// NFC archive names handed out so far.
///
/// Distinct files whose names only differ in Unicode normalization would
/// share one entry; the later one gets `stem-N.ext`.
#[derive(Debug, Default)]
struct ArchiveNames {
    used: HashSet<String>,
}

impl ArchiveNames {
    fn assign(&mut self, name: &str) -> String {
        let normalized = normalize_name(name);
        if self.used.insert(normalized.clone()) {
            return normalized;
        }
        let mut n = 1_u32;
        loop {
            let candidate = suffixed(&normalized, n);
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// Capture a snapshot from the stores.
pub fn take_snapshot<S>(stores: &S, stats: &dyn StatsEngine, scope: Scope) -> Result<Snapshot>
where
    S: HistoryStore + DictionaryStore + SettingsStore + RecordingStore,
{
    let mut history = stores.read_history()?;
    let dictionary = stores.read_dictionary()?;
    let settings = SettingsPayload::from_store(&stores.read_settings()?);
    let stats = stats.recompute_from_history(&history);

    let mut warnings = Vec::new();
    let mut recordings = Vec::new();

    if scope.includes_recordings() {
        let mut archived = ArchiveNames::default();
        let mut renamed: HashMap<String, String> = HashMap::new();
        let mut seen = BTreeSet::new();
        for name in history.iter().filter_map(|row| row.recording_filename.as_deref()) {
            if !seen.insert(name) {
                continue;
            }
            if !is_plain_file_name(name) {
                warn!("skipping recording with unsafe file name");
                warnings.push(format!("recording skipped (unsafe name): {name}"));
                continue;
            }
            let path = stores.recording_path(name);
            match std::fs::metadata(&path) {
                Ok(meta) if meta.is_file() => {
                    let entry = archived.assign(name);
                    if entry != normalize_name(name) {
                        warnings.push(format!(
                            "recording {name} is archived as {entry} (name clashed after Unicode normalization)"
                        ));
                        renamed.insert(name.to_string(), entry.clone());
                    }
                    recordings.push(RecordingSource {
                        name: entry,
                        path,
                        size: meta.len(),
                    });
                }
                Ok(_) | Err(_) => {
                    let warning = BackupError::MissingRecording {
                        name: name.to_string(),
                    };
                    debug!("{warning}");
                    warnings.push(warning.to_string());
                }
            }
        }
        for row in &mut history {
            if let Some(entry) = row
                .recording_filename
                .as_ref()
                .and_then(|name| renamed.get(name))
            {
                row.recording_filename = Some(entry.clone());
            }
        }
    }

    debug!(
        scope = %scope,
        history = history.len(),
        dictionary = dictionary.len(),
        settings = settings.len(),
        recordings = recordings.len(),
        missing = warnings.len(),
        "snapshot taken"
    );

    Ok(Snapshot {
        scope,
        history,
        dictionary,
        settings,
        stats,
        recordings,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LocalStores, WordCountStats};
    use serde_json::json;
    use tempfile::tempdir;

    fn row(id: i64, recording: Option<&str>) -> HistoryRecord {
        HistoryRecord {
            id,
            title: "t".into(),
            transcription_text: "a b".into(),
            post_processed_text: None,
            post_process_prompt: None,
            timestamp: 0,
            duration_ms: 100,
            saved: false,
            recording_filename: recording.map(str::to_string),
        }
    }

    #[test]
    fn test_missing_recording_becomes_warning() {
        let dir = tempdir().unwrap();
        let stores = LocalStores::at(dir.path());
        stores
            .import_history(&[row(1, Some("kept.wav")), row(2, Some("gone.wav")), row(3, None)])
            .unwrap();
        std::fs::create_dir_all(stores.recordings_dir()).unwrap();
        std::fs::write(stores.recording_path("kept.wav"), b"RIFF").unwrap();

        let snapshot = take_snapshot(&stores, &WordCountStats, Scope::Full).unwrap();
        assert_eq!(snapshot.recordings.len(), 1);
        assert_eq!(snapshot.recordings[0].name, "kept.wav");
        assert_eq!(snapshot.warnings, vec!["recording missing: gone.wav".to_string()]);
        assert_eq!(snapshot.stats.total_words, 6);
    }

    #[test]
    fn test_normalization_clash_gets_suffix() {
        let dir = tempdir().unwrap();
        let stores = LocalStores::at(dir.path());
        let composed = "caf\u{e9}.wav";
        let decomposed = "cafe\u{301}.wav";
        stores
            .import_history(&[row(1, Some(composed)), row(2, Some(decomposed)), row(3, Some(composed))])
            .unwrap();
        std::fs::create_dir_all(stores.recordings_dir()).unwrap();
        std::fs::write(stores.recording_path(composed), b"a").unwrap();
        std::fs::write(stores.recording_path(decomposed), b"b").unwrap();

        let snapshot = take_snapshot(&stores, &WordCountStats, Scope::Full).unwrap();
        let names: Vec<&str> = snapshot.recordings.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec![composed, "caf\u{e9}-1.wav"]);
        let referenced: Vec<Option<&str>> = snapshot
            .history
            .iter()
            .map(|r| r.recording_filename.as_deref())
            .collect();
        assert_eq!(referenced, vec![Some(composed), Some("caf\u{e9}-1.wav"), Some(composed)]);
        assert_eq!(snapshot.warnings.len(), 1);
        // the live history is not rewritten
        assert_eq!(
            stores.read_history().unwrap()[1].recording_filename.as_deref(),
            Some(decomposed)
        );
    }

    #[test]
    fn test_lightweight_skips_recordings() {
        let dir = tempdir().unwrap();
        let stores = LocalStores::at(dir.path());
        stores.import_history(&[row(1, Some("gone.wav"))]).unwrap();

        let snapshot = take_snapshot(&stores, &WordCountStats, Scope::Lightweight).unwrap();
        assert!(snapshot.recordings.is_empty());
        assert!(snapshot.warnings.is_empty());
    }

    #[test]
    fn test_secrets_not_captured() {
        let dir = tempdir().unwrap();
        let stores = LocalStores::at(dir.path());
        let serde_json::Value::Object(settings) =
            json!({"push_to_talk": true, "post_process_api_keys": {"x": "sk"}})
        else {
            unreachable!()
        };
        stores.write_settings(&settings).unwrap();

        let snapshot = take_snapshot(&stores, &WordCountStats, Scope::Full).unwrap();
        assert_eq!(snapshot.settings.len(), 1);
        assert!(snapshot.settings.get("post_process_api_keys").is_none());
    }

    #[test]
    fn test_plain_file_name() {
        assert!(is_plain_file_name("rec-1.wav"));
        assert!(!is_plain_file_name("../x.wav"));
        assert!(!is_plain_file_name("a/b.wav"));
        assert!(!is_plain_file_name("C:x.wav"));
    }
}
