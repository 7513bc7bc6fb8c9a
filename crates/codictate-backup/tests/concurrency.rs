//! Operation lock, write quiesce and the async wrappers.

mod common;

use std::sync::Arc;

use codictate_backup::{
    BackupError, ErrorCategory, ExportOptions, OperationKind, OperationLock, Policy,
    RestoreDecider, Scope,
};
use common::{active_tree, engine_at, fixture, mutate, seed};

#[test]
fn test_second_operation_fails_fast_with_busy() {
    let fx = fixture();
    seed(&fx.engine);
    let lock = OperationLock::new();
    let engine = engine_at(&fx.root()).with_lock(Arc::clone(&lock));

    let held = lock.try_acquire(OperationKind::Restore).unwrap();
    let err = engine
        .start_export(Scope::Lightweight, &fx.exports(), &ExportOptions::default())
        .unwrap_err();
    match &err {
        BackupError::Busy { running } => assert_eq!(*running, OperationKind::Restore),
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_retryable());
    assert_eq!(err.category(), ErrorCategory::Concurrency);
    assert!(matches!(engine.reconcile(), Err(BackupError::Busy { .. })));

    drop(held);
    engine
        .start_export(Scope::Lightweight, &fx.exports(), &ExportOptions::default())
        .unwrap();
    assert!(lock.current().is_none());
}

#[test]
fn test_quiesce_timeout_rolls_back() {
    let fx = fixture();
    seed(&fx.engine);
    let archive = fx
        .engine
        .start_export(Scope::Full, &fx.exports(), &ExportOptions::default())
        .unwrap()
        .path;
    mutate(&fx.engine);
    let before = active_tree(&fx.engine);

    let mut config = fx.engine.config();
    config.quiesce.timeout_ms = 50;
    fx.engine.save_config(config).unwrap();

    let gate = fx.engine.write_gate();
    let writer = gate.begin_write().unwrap();
    let err = fx.engine.start_restore(&archive, &Policy::default()).unwrap_err();
    assert!(matches!(err, BackupError::QuiesceTimeout { timeout_ms: 50 }));
    assert!(err.is_retryable());
    assert!(!gate.is_quiesced());
    assert_eq!(active_tree(&fx.engine), before);
    assert!(fx.engine.pending_session().unwrap().is_none());

    // the writer that blocked the restore still completes normally
    drop(writer);
    assert_eq!(gate.in_flight(), 0);
    fx.engine.start_restore(&archive, &Policy::default()).unwrap();
}

#[test]
fn test_writes_rejected_while_quiesced() {
    let fx = fixture();
    let gate = fx.engine.write_gate();
    let guard = gate.quiesce(std::time::Duration::from_millis(10)).unwrap();
    assert!(matches!(gate.begin_write(), Err(BackupError::RestoreInProgress)));
    drop(guard);
    assert!(gate.begin_write().is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_async_export_then_restore() {
    let fx = fixture();
    seed(&fx.engine);
    let restored = active_tree(&fx.engine);
    let engine = Arc::new(fx.reopen());

    let export = engine
        .start_export_async(Scope::Full, fx.exports(), ExportOptions::default())
        .await
        .unwrap();
    mutate(&engine);

    let decider: Arc<dyn RestoreDecider> = Arc::new(Policy::default());
    let report = engine
        .start_restore_async(export.path.clone(), decider)
        .await
        .unwrap();
    assert_eq!(report.counts.history_restored, 3);
    assert_eq!(active_tree(&engine), restored);
    assert!(engine.reconcile_async().await.unwrap().is_none());
}
