//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use codictate_backup::{
    BackupEngine, DictionaryStore, HistoryStore, LocalStores, OperationLock, SettingsStore,
    StatsEngine, VolumeProbe, WordCountStats,
};
use codictate_model::{DictionaryEntry, HistoryRecord};
use serde_json::{Map, Value, json};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

pub const ONE_WAV: usize = 1024;
pub const TWO_WAV: usize = 2048;

/// Probe with unlimited space, except below `limited` where `limit` applies.
#[derive(Debug, Default)]
pub struct FakeProbe {
    pub limited: Option<PathBuf>,
    pub limit: AtomicU64,
}

impl FakeProbe {
    pub fn unlimited() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn limited(dir: PathBuf, limit: u64) -> Arc<Self> {
        Arc::new(Self {
            limited: Some(dir),
            limit: AtomicU64::new(limit),
        })
    }
}

impl VolumeProbe for FakeProbe {
    fn available_space(&self, path: &Path) -> std::io::Result<u64> {
        match &self.limited {
            Some(dir) if path.starts_with(dir) => Ok(self.limit.load(Ordering::SeqCst)),
            _ => Ok(u64::MAX / 4),
        }
    }

    fn max_file_size(&self, _path: &Path) -> Option<u64> {
        None
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub engine: BackupEngine,
}

impl Fixture {
    pub fn root(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    pub fn exports(&self) -> PathBuf {
        let dir = self.dir.path().join("exports");
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// A second engine over the same data root, as after a restart.
    pub fn reopen(&self) -> BackupEngine {
        engine_at(&self.root())
    }
}

pub fn engine_at(root: &Path) -> BackupEngine {
    BackupEngine::new(root)
        .unwrap()
        .with_lock(OperationLock::new())
        .with_probe(FakeProbe::unlimited())
        .with_app_version("1.4.0")
}

pub fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_at(&dir.path().join("data"));
    Fixture { dir, engine }
}

pub fn row(id: i64, text: &str, recording: Option<&str>) -> HistoryRecord {
    HistoryRecord {
        id,
        title: format!("Entry {id}"),
        transcription_text: text.to_string(),
        post_processed_text: None,
        post_process_prompt: None,
        timestamp: 1_750_000_000 + id,
        duration_ms: 1_000 * id,
        saved: id % 2 == 0,
        recording_filename: recording.map(str::to_string),
    }
}

pub fn original_history() -> Vec<HistoryRecord> {
    vec![
        row(1, "hello world", Some("one.wav")),
        row(2, "second entry here", Some("two.wav")),
        row(3, "no audio", None),
    ]
}

pub fn settings(push_to_talk: bool) -> Map<String, Value> {
    let Value::Object(map) = json!({
        "push_to_talk": push_to_talk,
        "selected_language": "de",
        "post_process_api_keys": {"openai": "sk-local-only"},
        "selected_microphone": "USB Mic",
    }) else {
        unreachable!()
    };
    map
}

/// Seed the active stores with the original data set.
pub fn seed(engine: &BackupEngine) {
    let stores = engine.active_stores();
    let history = original_history();
    stores.import_history(&history).unwrap();
    stores
        .import_dictionary(&[DictionaryEntry {
            input: "Codictate".into(),
            aliases: vec!["co dictate".into()],
            replacement: "Codictate".into(),
            is_replacement: false,
        }])
        .unwrap();
    stores.write_settings(&settings(true)).unwrap();
    fs::create_dir_all(stores.recordings_dir()).unwrap();
    fs::write(stores.recordings_dir().join("one.wav"), vec![1_u8; ONE_WAV]).unwrap();
    fs::write(stores.recordings_dir().join("two.wav"), vec![2_u8; TWO_WAV]).unwrap();
    stores
        .write_stats(&WordCountStats.recompute_from_history(&history))
        .unwrap();
}

/// Change the active data so a restore has something to undo.
pub fn mutate(engine: &BackupEngine) {
    let stores = engine.active_stores();
    let rows = vec![row(9, "changed after export", None)];
    stores.import_history(&rows).unwrap();
    stores.write_settings(&settings(false)).unwrap();
    fs::remove_file(stores.recordings_dir().join("two.wav")).unwrap();
    stores
        .write_stats(&WordCountStats.recompute_from_history(&rows))
        .unwrap();
}

/// Every file below `dir`, keyed by relative path.
pub fn tree(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    fn walk(base: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(base, &path, out);
            } else {
                let key = path.strip_prefix(base).unwrap().to_string_lossy().replace('\\', "/");
                out.insert(key, fs::read(&path).unwrap());
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(dir, dir, &mut out);
    out
}

pub fn active_tree(engine: &BackupEngine) -> BTreeMap<String, Vec<u8>> {
    tree(&engine.data_dir().active())
}

pub fn history_ids(stores: &LocalStores) -> Vec<i64> {
    stores.read_history().unwrap().iter().map(|r| r.id).collect()
}

/// Copy an archive entry by entry, letting `edit` replace or drop entries
/// and appending `extra` entries at the end.
pub fn rewrite_archive(
    source: &Path,
    target: &Path,
    mut edit: impl FnMut(&str, Vec<u8>) -> Option<Vec<u8>>,
    extra: &[(&str, &[u8])],
) {
    let mut archive = zip::ZipArchive::new(fs::File::open(source).unwrap()).unwrap();
    let mut writer = zip::ZipWriter::new(fs::File::create(target).unwrap());
    let options = SimpleFileOptions::default();
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).unwrap();
        let name = entry.name().to_string();
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes).unwrap();
        if let Some(bytes) = edit(&name, bytes) {
            writer.start_file(name.as_str(), options).unwrap();
            writer.write_all(&bytes).unwrap();
        }
    }
    for (name, bytes) in extra {
        writer.start_file(*name, options).unwrap();
        writer.write_all(bytes).unwrap();
    }
    writer.finish().unwrap();
}

/// Entry names of an archive.
pub fn entry_names(path: &Path) -> Vec<String> {
    let archive = zip::ZipArchive::new(fs::File::open(path).unwrap()).unwrap();
    archive.file_names().map(str::to_string).collect()
}

/// Stats engine that reports fixed numbers, to tell recomputed stats apart.
#[derive(Debug, Clone, Copy)]
pub struct FixedStats;

impl StatsEngine for FixedStats {
    fn recompute_from_history(&self, _rows: &[HistoryRecord]) -> codictate_model::StatsSnapshot {
        codictate_model::StatsSnapshot {
            total_words: 999_999,
            total_duration_ms: 888_888,
            total_transcriptions: 7,
        }
    }
}
