//! End-to-end scenarios for export, preflight and safety backups.

mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::{Duration, Utc};
use codictate_backup::{
    BackupError, ErrorCategory, ExportOptions, HistoryStore, Policy, RecordingStore,
    RestoreDecider, SafetyBackup, SafetyFallback, Scope, StatsEngine, VolumeProbe,
    WordCountStats,
};
use codictate_model::{ComponentKind, paths};
use common::{
    FakeProbe, FixedStats, active_tree, engine_at, entry_names, fixture, mutate,
    original_history, rewrite_archive, row, seed,
};
use parking_lot::Mutex;

const MIB: usize = 1024 * 1024;

#[test]
fn scenario_a_missing_recording_becomes_warning() {
    let fx = fixture();
    seed(&fx.engine);
    fs::remove_file(fx.engine.active_stores().recordings_dir().join("one.wav")).unwrap();

    let report = fx
        .engine
        .start_export(Scope::Full, &fx.exports(), &ExportOptions::default())
        .unwrap();
    assert_eq!(report.warnings, vec!["recording missing: one.wav".to_string()]);
    assert_eq!(report.manifest.warnings, report.warnings);
    assert_eq!(report.manifest.count(ComponentKind::Recordings), 1);

    let names = entry_names(&report.path);
    assert!(!names.contains(&"recordings/one.wav".to_string()));
    assert!(names.contains(&"recordings/two.wav".to_string()));
    assert!(names.contains(&paths::MANIFEST.to_string()));
}

#[test]
fn scenario_c_traversal_entry_rejected_before_extraction() {
    let fx = fixture();
    seed(&fx.engine);
    let exported = fx
        .engine
        .start_export(Scope::Full, &fx.exports(), &ExportOptions::default())
        .unwrap()
        .path;
    let evil = fx.exports().join("evil.zip");
    rewrite_archive(
        &exported,
        &evil,
        |_, bytes| Some(bytes),
        &[("../settings_store.json", b"{\"push_to_talk\": false}")],
    );
    let before = active_tree(&fx.engine);

    let preflight = fx.engine.verify_archive(&evil).unwrap();
    assert!(preflight.is_blocking());
    assert!(
        preflight
            .blocking()
            .any(|e| matches!(e, BackupError::UnsafeEntry { .. }))
    );

    let err = fx.engine.start_restore(&evil, &Policy::accept_partial()).unwrap_err();
    assert!(matches!(err, BackupError::UnsafeEntry { .. }));
    assert_eq!(err.category(), ErrorCategory::Security);
    assert_eq!(active_tree(&fx.engine), before);
    assert!(!fx.engine.data_dir().work().exists());
    assert!(!fx.root().parent().unwrap().join("settings_store.json").exists());
}

#[test]
fn scenario_d_stats_recomputed_not_imported() {
    let fx = fixture();
    seed(&fx.engine);
    let exporter = engine_at(&fx.root()).with_stats(Arc::new(FixedStats));
    let archive = exporter
        .start_export(Scope::Full, &fx.exports(), &ExportOptions::default())
        .unwrap()
        .path;
    drop(exporter);
    mutate(&fx.engine);

    let report = fx.engine.start_restore(&archive, &Policy::default()).unwrap();
    let expected = WordCountStats.recompute_from_history(&original_history());
    assert_eq!(report.stats, expected);
    assert_eq!(fx.engine.active_stores().read_stats().unwrap(), expected);
    assert_ne!(expected.total_words, 999_999);
    assert_eq!(expected.total_duration_ms, 6_000);
}

fn seed_large_recording(root: &Path) {
    let engine = engine_at(root);
    let stores = engine.active_stores();
    let mut rows = original_history();
    rows.push(row(4, "long recording", Some("big.wav")));
    stores.import_history(&rows).unwrap();
    fs::write(stores.recordings_dir().join("big.wav"), vec![7_u8; MIB]).unwrap();
}

fn seed_old_safety_backups(dir: &Path, count: i64) {
    fs::create_dir_all(dir).unwrap();
    let backups: Vec<serde_json::Value> = (1..=count)
        .map(|age| {
            let name = format!("old-{age}.zip");
            fs::write(dir.join(&name), b"old").unwrap();
            serde_json::json!({
                "file_name": name,
                "created_at": (Utc::now() - Duration::days(age)).to_rfc3339(),
                "scope": "full",
                "size_bytes": 3,
                "user_saved": false,
            })
        })
        .collect();
    fs::write(
        dir.join("index.json"),
        serde_json::to_vec(&serde_json::json!({ "backups": backups })).unwrap(),
    )
    .unwrap();
}

fn names(backups: &[SafetyBackup]) -> Vec<&str> {
    backups.iter().map(|b| b.file_name.as_str()).collect()
}

#[test]
fn scenario_e_low_space_prunes_then_falls_back_to_lightweight() {
    let fx = fixture();
    seed(&fx.engine);
    seed_large_recording(&fx.root());
    let archive = fx
        .engine
        .start_export(Scope::Full, &fx.exports(), &ExportOptions::default())
        .unwrap()
        .path;
    let safety_dir = fx.engine.data_dir().safety_backups();
    seed_old_safety_backups(&safety_dir, 5);

    let probe = FakeProbe::limited(safety_dir, 512 * 1024);
    let engine = engine_at(&fx.root()).with_probe(probe);
    let policy = Policy {
        on_safety_failure: SafetyFallback::Lightweight,
        ..Policy::default()
    };
    let report = engine.start_restore(&archive, &policy).unwrap();
    assert!(report.safety_backup_lightweight);
    assert!(report.warnings.iter().any(|w| w.contains("recordings")));

    let listed = engine.list_safety_backups().unwrap();
    assert_eq!(listed.len(), 4);
    assert!(listed[0].is_lightweight());
    assert_eq!(&names(&listed)[1..], ["old-1.zip", "old-2.zip", "old-3.zip"]);
}

#[test]
fn scenario_e_cancel_keeps_active_data() {
    let fx = fixture();
    seed(&fx.engine);
    seed_large_recording(&fx.root());
    let archive = fx
        .engine
        .start_export(Scope::Full, &fx.exports(), &ExportOptions::default())
        .unwrap()
        .path;
    mutate(&fx.engine);
    let before = active_tree(&fx.engine);

    let safety_dir = fx.engine.data_dir().safety_backups();
    let engine = engine_at(&fx.root()).with_probe(FakeProbe::limited(safety_dir, 1024));
    let err = engine.start_restore(&archive, &Policy::default()).unwrap_err();
    match &err {
        BackupError::SafetyBackupFailed { attempts, .. } => assert_eq!(*attempts, 2),
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_low_space());
    assert_eq!(active_tree(&engine), before);
    assert!(engine.pending_session().unwrap().is_none());
}

/// Frees space when asked to retry, recording the attempts it saw.
struct FreeSpaceOnRetry {
    probe: Arc<FakeProbe>,
    seen: Mutex<Vec<u32>>,
}

impl RestoreDecider for FreeSpaceOnRetry {
    fn on_safety_backup_failed(&self, error: &BackupError, attempt: u32) -> SafetyFallback {
        assert!(error.is_low_space());
        self.seen.lock().push(attempt);
        self.probe.limit.store(u64::MAX / 4, Ordering::SeqCst);
        SafetyFallback::RetryFull
    }
}

#[test]
fn scenario_e_retry_full_after_explicit_choice() {
    let fx = fixture();
    seed(&fx.engine);
    let archive = fx
        .engine
        .start_export(Scope::Full, &fx.exports(), &ExportOptions::default())
        .unwrap()
        .path;

    let probe = FakeProbe::limited(fx.engine.data_dir().safety_backups(), 16);
    let engine = engine_at(&fx.root()).with_probe(Arc::clone(&probe) as Arc<dyn VolumeProbe>);
    let decider = FreeSpaceOnRetry {
        probe,
        seen: Mutex::new(Vec::new()),
    };
    let report = engine.start_restore(&archive, &decider).unwrap();
    assert!(!report.safety_backup_lightweight);
    assert_eq!(*decider.seen.lock(), vec![2]);
}

#[test]
fn test_export_refuses_existing_destination() {
    let fx = fixture();
    seed(&fx.engine);
    let target = fx.exports().join("mine.zip");
    fs::write(&target, b"keep me").unwrap();

    let err = fx
        .engine
        .start_export(Scope::Lightweight, &target, &ExportOptions::default())
        .unwrap_err();
    assert!(matches!(err, BackupError::DestinationExists { .. }));
    assert_eq!(fs::read(&target).unwrap(), b"keep me");

    let report = fx
        .engine
        .start_export(Scope::Lightweight, &target, &ExportOptions { overwrite: true })
        .unwrap();
    assert!(entry_names(&report.path).iter().all(|n| !n.starts_with("recordings/")));
}

struct FatProbe;

impl VolumeProbe for FatProbe {
    fn available_space(&self, _path: &Path) -> std::io::Result<u64> {
        Ok(u64::MAX / 4)
    }

    fn max_file_size(&self, _path: &Path) -> Option<u64> {
        Some(4 * 1024)
    }
}

#[test]
fn test_export_over_file_size_ceiling_suggests_lightweight() {
    let fx = fixture();
    seed(&fx.engine);
    let engine = engine_at(&fx.root()).with_probe(Arc::new(FatProbe));

    let err = engine
        .start_export(Scope::Full, &fx.exports(), &ExportOptions::default())
        .unwrap_err();
    assert!(matches!(err, BackupError::FileSizeCeiling { .. }));
    assert!(err.suggestion().unwrap().contains("lightweight"));
    assert!(fs::read_dir(fx.exports()).unwrap().next().is_none());
}

#[test]
fn test_names_differing_only_in_normalization_survive_round_trip() {
    let fx = fixture();
    let stores = fx.engine.active_stores();
    let composed = "caf\u{e9}.wav";
    let decomposed = "cafe\u{301}.wav";
    stores
        .import_history(&[row(1, "first take", Some(composed)), row(2, "second take", Some(decomposed))])
        .unwrap();
    fs::create_dir_all(stores.recordings_dir()).unwrap();
    fs::write(stores.recording_path(composed), b"composed").unwrap();
    fs::write(stores.recording_path(decomposed), b"decomposed").unwrap();

    let report = fx
        .engine
        .start_export(Scope::Full, &fx.exports(), &ExportOptions::default())
        .unwrap();
    assert_eq!(report.manifest.count(ComponentKind::Recordings), 2);
    let names = entry_names(&report.path);
    assert!(names.contains(&"recordings/caf\u{e9}.wav".to_string()));
    assert!(names.contains(&"recordings/caf\u{e9}-1.wav".to_string()));
    assert_eq!(report.warnings.len(), 1);

    stores.import_history(&[row(9, "later", None)]).unwrap();
    // the full safety backup snapshots the same names
    let restored = fx.engine.start_restore(&report.path, &Policy::default()).unwrap();
    assert_eq!(restored.counts.recordings_restored, 2);
    assert_eq!(fx.engine.list_safety_backups().unwrap()[0].scope, Scope::Full);

    let contents: Vec<Vec<u8>> = stores
        .read_history()
        .unwrap()
        .iter()
        .map(|r| fs::read(stores.recording_path(r.recording_filename.as_deref().unwrap())).unwrap())
        .collect();
    assert_eq!(contents, vec![b"composed".to_vec(), b"decomposed".to_vec()]);
}
