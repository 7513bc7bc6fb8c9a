//! Crash injection at every restore boundary, followed by reconciliation.

mod common;

use std::fs;
use std::sync::Arc;

use codictate_backup::{
    BackupError, CrashHook, CrashPoint, ExportOptions, OperationKind, Outcome, Phase, Policy,
    Scope,
};
use common::{active_tree, engine_at, fixture, mutate, seed};

const POINTS: [(CrashPoint, Outcome); 10] = [
    (CrashPoint::Entered(Phase::Preflight), Outcome::RolledBack),
    (CrashPoint::Entered(Phase::SafetyBackup), Outcome::RolledBack),
    (CrashPoint::Entered(Phase::Quiesce), Outcome::RolledBack),
    (CrashPoint::Entered(Phase::StagingImport), Outcome::RolledBack),
    (CrashPoint::Entered(Phase::Migrate), Outcome::RolledBack),
    (CrashPoint::Entered(Phase::Validate), Outcome::RolledBack),
    (CrashPoint::Entered(Phase::Commit), Outcome::Restored),
    (CrashPoint::ActiveMovedAside, Outcome::Restored),
    (CrashPoint::StagingPromoted, Outcome::Restored),
    (CrashPoint::Entered(Phase::Complete), Outcome::Restored),
];

#[test]
fn test_crash_at_every_boundary_resolves_to_one_state() {
    for (point, expected) in POINTS {
        let fx = fixture();
        seed(&fx.engine);
        let restored = active_tree(&fx.engine);
        let archive = fx
            .engine
            .start_export(Scope::Full, &fx.exports(), &ExportOptions::default())
            .unwrap()
            .path;
        mutate(&fx.engine);
        let before = active_tree(&fx.engine);

        let hook: CrashHook = Arc::new(move |at: CrashPoint| at == point);
        let crashing = engine_at(&fx.root()).with_crash_hook(hook);
        let err = crashing
            .start_restore(&archive, &Policy::default())
            .unwrap_err();
        assert!(matches!(err, BackupError::SimulatedCrash { .. }), "{point}: {err}");
        assert!(crashing.pending_session().unwrap().is_some(), "{point}");
        drop(crashing);

        let restarted = fx.reopen();
        let report = restarted.reconcile().unwrap().expect("interrupted session");
        assert_eq!(report.outcome, expected, "{point}");

        let active = active_tree(&restarted);
        match expected {
            Outcome::RolledBack => assert_eq!(active, before, "{point}"),
            Outcome::Restored => assert_eq!(active, restored, "{point}"),
        }
        let data = restarted.data_dir();
        assert!(!data.staging().exists(), "{point}");
        assert!(!data.rollback().exists(), "{point}");
        assert!(!data.work().exists(), "{point}");
        assert!(!data.staging_complete().exists(), "{point}");
        assert!(restarted.pending_session().unwrap().is_none(), "{point}");

        let last = restarted.last_operation().unwrap().unwrap();
        assert_eq!(last.kind, OperationKind::Recovery);
        assert_eq!(restarted.last_recovery().unwrap(), Some(report.clone()));

        // idempotent: nothing left to resolve
        assert!(restarted.reconcile().unwrap().is_none());
        assert_eq!(active_tree(&restarted), active, "{point}");
    }
}

#[test]
fn test_next_restore_reconciles_first() {
    let fx = fixture();
    seed(&fx.engine);
    let archive = fx
        .engine
        .start_export(Scope::Full, &fx.exports(), &ExportOptions::default())
        .unwrap()
        .path;
    let restored = active_tree(&fx.engine);
    mutate(&fx.engine);

    let hook: CrashHook = Arc::new(|at: CrashPoint| at == CrashPoint::ActiveMovedAside);
    let crashing = engine_at(&fx.root()).with_crash_hook(hook);
    crashing
        .start_restore(&archive, &Policy::default())
        .unwrap_err();
    assert!(!crashing.data_dir().active().exists());

    let report = fx.reopen().start_restore(&archive, &Policy::default()).unwrap();
    assert_eq!(report.counts.history_restored, 3);
    assert_eq!(active_tree(&fx.engine), restored);
    let recovered = report.recovered.expect("interrupted restore resolved first");
    assert_eq!(recovered.interrupted_phase, Phase::Commit);
    assert_eq!(recovered.outcome, Outcome::Restored);
}

#[test]
fn test_export_after_crash_reports_recovery() {
    let fx = fixture();
    seed(&fx.engine);
    let archive = fx
        .engine
        .start_export(Scope::Full, &fx.exports(), &ExportOptions::default())
        .unwrap()
        .path;
    mutate(&fx.engine);
    let before = active_tree(&fx.engine);

    let hook: CrashHook = Arc::new(|at: CrashPoint| at == CrashPoint::Entered(Phase::Migrate));
    let crashing = engine_at(&fx.root()).with_crash_hook(hook);
    crashing
        .start_restore(&archive, &Policy::default())
        .unwrap_err();
    drop(crashing);

    let restarted = fx.reopen();
    let export = restarted
        .start_export(Scope::Lightweight, &fx.exports(), &ExportOptions::default())
        .unwrap();
    assert_eq!(active_tree(&restarted), before);

    let recovered = export.recovered.expect("interrupted restore resolved first");
    assert_eq!(recovered.interrupted_phase, Phase::Migrate);
    assert_eq!(recovered.outcome, Outcome::RolledBack);
    assert!(recovered.guidance.contains("start the restore again"));

    // the export is the last operation; the recovery stays on record
    assert_eq!(
        restarted.last_operation().unwrap().unwrap().kind,
        OperationKind::Export
    );
    assert_eq!(restarted.last_recovery().unwrap(), Some(recovered));
    assert!(restarted.pending_session().unwrap().is_none());
}

#[test]
fn test_reconcile_sweeps_partial_safety_backups() {
    let fx = fixture();
    seed(&fx.engine);
    let archive = fx
        .engine
        .start_export(Scope::Full, &fx.exports(), &ExportOptions::default())
        .unwrap()
        .path;

    let hook: CrashHook = Arc::new(|at: CrashPoint| at == CrashPoint::Entered(Phase::Quiesce));
    let crashing = engine_at(&fx.root()).with_crash_hook(hook);
    crashing
        .start_restore(&archive, &Policy::default())
        .unwrap_err();
    let safety_dir = crashing.data_dir().safety_backups();
    drop(crashing);
    // a second backup attempt died while writing
    let partial = safety_dir.join("safety-backup-2025-01-01_00-00-00-deadbeef.zip.partial");
    fs::write(&partial, b"PK half written").unwrap();

    let restarted = fx.reopen();
    restarted.reconcile().unwrap().expect("interrupted session");
    assert!(!partial.exists());
    assert_eq!(restarted.list_safety_backups().unwrap().len(), 1);
}

#[test]
fn test_reconcile_without_session_is_noop() {
    let fx = fixture();
    seed(&fx.engine);
    let before = active_tree(&fx.engine);
    assert!(fx.engine.reconcile().unwrap().is_none());
    assert_eq!(active_tree(&fx.engine), before);
    assert!(fx.engine.last_operation().unwrap().is_none());
}
