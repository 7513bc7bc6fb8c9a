//! Operation surface of the backup engine.
//!
//! [`BackupEngine`] owns the data root, the configuration and the shared
//! coordination state (operation lock, write gate, status board). Every
//! operation acquires the operation lock first and records its outcome in
//! `last_operation.json` when it ends.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, Utc};
use codictate_model::Scope;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::commit::{CrashHook, CrashPoint, commit, crash_check, roll_back};
use crate::config::{BackupConfig, SoftLimits};
use crate::decider::{KeepChoice, RecoverableChoice, RestoreDecider, SafetyFallback};
use crate::error::{BackupError, Result};
use crate::export::writer::write_archive;
use crate::export::{ExportOptions, resolve_destination, take_snapshot};
use crate::import::{Staged, StagedImport};
use crate::layout::DataDir;
use crate::lock::{OperationGuard, OperationKind, OperationLock};
use crate::preflight::{Preflight, PreflightReport};
use crate::progress::{
    CancellationToken, OperationStatus, ProgressSink, ProgressTracker, Stage, StatusBoard,
};
use crate::quiesce::{QuiesceGuard, WriteGate};
use crate::recovery::{self, ReconcileReport};
use crate::report::{ExportReport, LastOperation, RestoreReport};
use crate::safety::{CreateContext, SafetyBackup, SafetyBackups};
use crate::session::{Phase, RestoreSession, SessionMarker};
use crate::store::{LocalStores, StatsEngine, WordCountStats};
use crate::volume::{SystemVolumeProbe, VolumeProbe};

/// Backup, restore and recovery over one data root.
pub struct BackupEngine {
    data: DataDir,
    config: Mutex<BackupConfig>,
    app_version: String,
    lock: Arc<OperationLock>,
    gate: Arc<WriteGate>,
    stats: Arc<dyn StatsEngine>,
    probe: Arc<dyn VolumeProbe>,
    board: StatusBoard,
    cancel: CancellationToken,
    crash_hook: Option<CrashHook>,
}

impl std::fmt::Debug for BackupEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupEngine")
            .field("data", &self.data)
            .field("app_version", &self.app_version)
            .finish_non_exhaustive()
    }
}

/// Safety backup taken for the restore in progress.
struct TakenBackup {
    backup: SafetyBackup,
    path: PathBuf,
}

impl BackupEngine {
    /// Open the engine over `root` and load `backup.toml`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let data = DataDir::new(root);
        // active/ is created after reconciliation; an interrupted swap may
        // have moved it aside
        std::fs::create_dir_all(data.root()).map_err(BackupError::io("create directory", data.root()))?;
        let config = BackupConfig::load_from(&data.config())?;
        Ok(Self {
            data,
            config: Mutex::new(config),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            lock: OperationLock::global(),
            gate: WriteGate::new(),
            stats: Arc::new(WordCountStats),
            probe: Arc::new(SystemVolumeProbe),
            board: StatusBoard::new(None),
            cancel: CancellationToken::new(),
            crash_hook: None,
        })
    }

    /// Use a private operation lock instead of the process-wide one.
    #[must_use]
    pub fn with_lock(mut self, lock: Arc<OperationLock>) -> Self {
        self.lock = lock;
        self
    }

    /// Share the application's write gate.
    #[must_use]
    pub fn with_write_gate(mut self, gate: Arc<WriteGate>) -> Self {
        self.gate = gate;
        self
    }

    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn VolumeProbe>) -> Self {
        self.probe = probe;
        self
    }

    #[must_use]
    pub fn with_stats(mut self, stats: Arc<dyn StatsEngine>) -> Self {
        self.stats = stats;
        self
    }

    /// Receive progress events on the worker thread.
    #[must_use]
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.board = StatusBoard::new(Some(sink));
        self
    }

    /// Application version written into manifests.
    #[must_use]
    pub fn with_app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = version.into();
        self
    }

    #[doc(hidden)]
    #[must_use]
    pub fn with_crash_hook(mut self, hook: CrashHook) -> Self {
        self.crash_hook = Some(hook);
        self
    }

    /// The data layout.
    #[must_use]
    pub fn data_dir(&self) -> &DataDir {
        &self.data
    }

    /// Gate application writers must pass through.
    #[must_use]
    pub fn write_gate(&self) -> Arc<WriteGate> {
        Arc::clone(&self.gate)
    }

    /// Stores over the live data.
    #[must_use]
    pub fn active_stores(&self) -> LocalStores {
        LocalStores::at(self.data.active())
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> BackupConfig {
        self.config.lock().clone()
    }

    /// Persist and apply a new configuration.
    pub fn save_config(&self, config: BackupConfig) -> Result<()> {
        config.save_to(&self.data.config())?;
        *self.config.lock() = config;
        Ok(())
    }

    /// Safety backup directory with the configured retention.
    #[must_use]
    pub fn safety_backups(&self) -> SafetyBackups {
        SafetyBackups::new(self.data.safety_backups(), self.config.lock().safety.retention)
    }

    /// Live status of the running operation.
    #[must_use]
    pub fn get_operation_status(&self) -> OperationStatus {
        self.board.snapshot()
    }

    /// Request cancellation of the running operation.
    ///
    /// Returns `false` when nothing is running. During commit or rollback the
    /// request is deferred until that phase has finished.
    pub fn cancel_operation(&self) -> bool {
        if !self.board.request_cancel() {
            return false;
        }
        self.cancel.cancel();
        info!("cancellation requested");
        true
    }

    /// Outcome of the most recent operation.
    pub fn last_operation(&self) -> Result<Option<LastOperation>> {
        LastOperation::read(&self.data)
    }

    /// Marker of an unfinished restore, if one is on disk.
    pub fn pending_session(&self) -> Result<Option<SessionMarker>> {
        SessionMarker::load(&self.data)
    }

    // ---------------------------------------------------------------- export

    /// Export the active data to an archive.
    pub fn start_export(
        &self,
        scope: Scope,
        destination: &Path,
        options: &ExportOptions,
    ) -> Result<ExportReport> {
        let guard = self.lock.try_acquire(OperationKind::Export)?;
        self.begin(&guard);
        let result = self.run_export(&guard, scope, destination, options);
        self.end(&guard, &result, ExportReport::summary);
        result
    }

    fn run_export(
        &self,
        guard: &OperationGuard,
        scope: Scope,
        destination: &Path,
        options: &ExportOptions,
    ) -> Result<ExportReport> {
        let started = Instant::now();
        let recovered = self.reconcile_locked(guard)?;
        self.data.ensure()?;
        let destination = resolve_destination(destination, Local::now());

        self.cancel.check(Stage::Snapshot)?;
        ProgressTracker::new(&self.board, Stage::Snapshot, 0);
        let snapshot = take_snapshot(&self.active_stores(), self.stats.as_ref(), scope)?;
        let summary = write_archive(
            &snapshot,
            &destination,
            &self.app_version,
            options,
            self.probe.as_ref(),
            &self.cancel,
            &self.board,
        )?;

        let duration_ms = elapsed_ms(started);
        info!(
            scope = %scope,
            size_bytes = summary.size_bytes,
            entries = summary.entries,
            duration_ms,
            "export finished"
        );
        Ok(ExportReport {
            path: summary.path,
            scope,
            size_bytes: summary.size_bytes,
            entries: summary.entries,
            warnings: summary.manifest.warnings.clone(),
            manifest: summary.manifest,
            duration_ms,
            created_at: Utc::now(),
            recovered,
        })
    }

    // --------------------------------------------------------------- restore

    /// Validate an archive without restoring it.
    ///
    /// Read-only; does not take the operation lock.
    pub fn verify_archive(&self, archive: &Path) -> Result<PreflightReport> {
        let limits = self.config.lock().limits.clone();
        let board = StatusBoard::new(None);
        let cancel = CancellationToken::new();
        self.preflight(&limits, &cancel, &board).run(archive)
    }

    /// Restore an archive over the active data.
    ///
    /// Blocking preflight findings fail before anything is written. Any
    /// failure after that rolls back to the pre-restore data.
    pub fn start_restore(
        &self,
        archive: &Path,
        decider: &dyn RestoreDecider,
    ) -> Result<RestoreReport> {
        let guard = self.lock.try_acquire(OperationKind::Restore)?;
        self.begin(&guard);
        let result = self.run_restore(&guard, archive, decider);
        self.end(&guard, &result, RestoreReport::summary);
        result
    }

    fn run_restore(
        &self,
        guard: &OperationGuard,
        archive: &Path,
        decider: &dyn RestoreDecider,
    ) -> Result<RestoreReport> {
        let started = Instant::now();
        let recovered = self.reconcile_locked(guard)?;
        self.data.ensure()?;

        let mut session = RestoreSession::begin(&self.data, archive)?;
        self.crash(CrashPoint::Entered(Phase::Preflight))?;

        let mut quiesce = None;
        let outcome = self.restore_phases(guard, &mut session, archive, decider, &mut quiesce);
        let (taken, staged) = match outcome {
            Ok(done) => done,
            Err(e @ BackupError::SimulatedCrash { .. }) => return Err(e),
            Err(e) => {
                self.abort(session, &e);
                drop(quiesce);
                return Err(e);
            }
        };
        drop(quiesce);
        let session_id = session.id();
        let mut warnings = staged.warnings;
        match self.close_session(session) {
            Ok(()) => {}
            Err(e @ BackupError::SimulatedCrash { .. }) => return Err(e),
            Err(e) => {
                // new data is already active; the next start clears the marker
                warn!(session = %session_id, error = %e, "could not close committed restore session");
                warnings.push(
                    "The restore finished, but its session record could not be cleared. It is cleaned up the next time the app starts.".to_string(),
                );
            }
        }

        let mut kept = true;
        if decider.keep_safety_backup(&taken.backup) == KeepChoice::Discard {
            if decider.confirm_discard(&taken.backup) {
                match self.safety_backups().discard(guard, &taken.backup.file_name) {
                    Ok(_) => kept = false,
                    Err(e) => warn!(error = %e, "could not discard safety backup"),
                }
            } else {
                info!("safety backup discard not confirmed; keeping it");
            }
        }

        if taken.backup.is_lightweight() {
            warnings.push("The safety backup does not include recordings.".to_string());
        }
        let duration_ms = elapsed_ms(started);
        info!(session = %session_id, duration_ms, "restore finished");
        Ok(RestoreReport {
            session_id,
            archive: archive.to_path_buf(),
            safety_backup: kept.then_some(taken.path),
            safety_backup_kept: kept,
            safety_backup_lightweight: taken.backup.is_lightweight(),
            counts: staged.counts,
            stats: staged.stats,
            warnings,
            details: staged.details,
            completed_at: Utc::now(),
            duration_ms,
            recovered,
        })
    }

    /// `Commit -> Complete`, then remove the marker.
    fn close_session(&self, mut session: RestoreSession) -> Result<()> {
        self.enter(&mut session, Phase::Complete)?;
        session.finish()
    }

    fn restore_phases(
        &self,
        guard: &OperationGuard,
        session: &mut RestoreSession,
        archive: &Path,
        decider: &dyn RestoreDecider,
        quiesce: &mut Option<QuiesceGuard>,
    ) -> Result<(TakenBackup, Staged)> {
        let config = self.config();
        let (report, limits) = self.confirmed_preflight(archive, decider, config.limits.clone())?;

        self.enter(session, Phase::SafetyBackup)?;
        let taken = self.take_safety_backup(guard, session, decider, config.safety.max_attempts)?;
        session.set_safety_backup(taken.path.clone())?;

        self.enter(session, Phase::Quiesce)?;
        *quiesce = Some(
            self.gate
                .quiesce(Duration::from_millis(config.quiesce.timeout_ms))?,
        );

        let importer = StagedImport {
            data: &self.data,
            limits: &limits,
            stats: self.stats.as_ref(),
            cancel: &self.cancel,
            board: &self.board,
        };
        self.enter(session, Phase::StagingImport)?;
        let extracted = importer.extract(&report)?;
        self.enter(session, Phase::Migrate)?;
        let migrated = importer.migrate(extracted)?;
        self.enter(session, Phase::Validate)?;
        let staged = importer.validate(migrated, &self.active_stores(), &session.id().to_string())?;

        self.enter(session, Phase::Commit)?;
        commit(
            &self.data,
            Duration::from_millis(config.restore.commit_deadline_ms),
            self.crash_hook.as_ref(),
        )?;
        Ok((taken, staged))
    }

    /// Run preflight until it is clean or the caller accepts its findings.
    fn confirmed_preflight(
        &self,
        archive: &Path,
        decider: &dyn RestoreDecider,
        mut limits: SoftLimits,
    ) -> Result<(PreflightReport, SoftLimits)> {
        loop {
            let report = self
                .preflight(&limits, &self.cancel, &self.board)
                .run(archive)?
                .into_result()?;
            if report.recoverable().next().is_none() {
                return Ok((report, limits));
            }
            match decider.confirm_recoverable(&report) {
                RecoverableChoice::ContinuePartial => return Ok((report, limits)),
                RecoverableChoice::RaiseLimits => {
                    let before = limits.clone();
                    limits.raise_to_fit(
                        report.total_uncompressed,
                        report.entry_count,
                        report.longest_line,
                    );
                    if limits == before {
                        // nothing left to raise; the rest is partial data
                        return Ok((report, limits));
                    }
                    let mut config = self.config();
                    config.limits = limits.clone();
                    self.save_config(config)?;
                    info!(
                        max_total_bytes = limits.max_total_bytes,
                        max_entries = limits.max_entries,
                        max_history_line_bytes = limits.max_history_line_bytes,
                        "soft limits raised"
                    );
                }
                RecoverableChoice::Cancel => {
                    return Err(BackupError::Declined {
                        reason: "the backup has problems that were not accepted".into(),
                    });
                }
            }
        }
    }

    /// Full safety backup, pruning and one retry on low space, then the
    /// caller's fallback choices.
    fn take_safety_backup(
        &self,
        guard: &OperationGuard,
        session: &RestoreSession,
        decider: &dyn RestoreDecider,
        max_attempts: u32,
    ) -> Result<TakenBackup> {
        let backups = self.safety_backups();
        let active = self.active_stores();
        let ctx = CreateContext {
            active: &active,
            stats: self.stats.as_ref(),
            app_version: &self.app_version,
            probe: self.probe.as_ref(),
            cancel: &self.cancel,
            board: &self.board,
        };
        let session_id = Some(session.id());
        let taken = |backup: SafetyBackup| TakenBackup {
            path: backups.path_of(&backup),
            backup,
        };

        let mut attempts = 1;
        let mut last = match backups.create(guard, &ctx, Scope::Full, session_id) {
            Ok(backup) => return Ok(taken(backup)),
            Err(e) => e,
        };
        if last.is_low_space() {
            let removed = backups.prune_automatic(guard)?;
            warn!(pruned = removed.len(), "low space for safety backup, retrying");
            attempts += 1;
            last = match backups.create(guard, &ctx, Scope::Full, session_id) {
                Ok(backup) => return Ok(taken(backup)),
                Err(e) => e,
            };
        }

        loop {
            if matches!(last, BackupError::Cancelled { .. }) {
                return Err(last);
            }
            warn!(attempts, error = %last, "safety backup failed");
            let scope = if attempts < max_attempts {
                match decider.on_safety_backup_failed(&last, attempts) {
                    SafetyFallback::RetryFull => Some(Scope::Full),
                    SafetyFallback::Lightweight => Some(Scope::Lightweight),
                    SafetyFallback::Cancel => None,
                }
            } else {
                None
            };
            let Some(scope) = scope else {
                return Err(BackupError::SafetyBackupFailed {
                    attempts,
                    source: Box::new(last),
                });
            };
            attempts += 1;
            last = match backups.create(guard, &ctx, scope, session_id) {
                Ok(backup) => {
                    if scope == Scope::Lightweight {
                        warn!("continuing with a lightweight safety backup");
                    }
                    return Ok(taken(backup));
                }
                Err(e) => e,
            };
        }
    }

    /// Roll back after a failure before commit completed.
    fn abort(&self, mut session: RestoreSession, error: &BackupError) {
        let phase = session.phase();
        warn!(%phase, category = %error.category(), error = %error, "restore failed, rolling back");
        if let Err(e) = session.advance(Phase::RollBack) {
            warn!(error = %e, "could not record rollback phase");
        }
        ProgressTracker::new(&self.board, Stage::Restore(Phase::RollBack), 0);
        if let Err(e) = roll_back(&self.data) {
            // marker stays behind; the next start reconciles
            warn!(error = %e, "rollback incomplete");
            return;
        }
        if let Err(e) = session.finish() {
            warn!(error = %e, "could not close restore session");
        }
    }

    // -------------------------------------------------------------- recovery

    /// Resolve a restore that was interrupted by a crash.
    pub fn reconcile(&self) -> Result<Option<ReconcileReport>> {
        let guard = self.lock.try_acquire(OperationKind::Recovery)?;
        self.reconcile_locked(&guard)
    }

    /// Most recent crash recovery, whether run explicitly or at the start of
    /// another operation.
    pub fn last_recovery(&self) -> Result<Option<ReconcileReport>> {
        ReconcileReport::read(&self.data)
    }

    fn reconcile_locked(&self, guard: &OperationGuard) -> Result<Option<ReconcileReport>> {
        let deadline = Duration::from_millis(self.config.lock().restore.commit_deadline_ms);
        let report = recovery::reconcile(&self.data, deadline)?;
        self.safety_backups().sweep_partial(guard)?;
        if let Some(report) = &report {
            info!(
                session = %report.session_id,
                phase = %report.interrupted_phase,
                outcome = ?report.outcome,
                "interrupted restore resolved"
            );
            let recorded = report
                .write(&self.data)
                .and_then(|()| LastOperation::reconciled(report).write(&self.data));
            if let Err(e) = recorded {
                warn!(error = %e, "could not record recovery outcome");
            }
        }
        Ok(report)
    }

    // ------------------------------------------------------- safety backups

    /// Safety backups, newest first.
    pub fn list_safety_backups(&self) -> Result<Vec<SafetyBackup>> {
        self.safety_backups().list()
    }

    /// Prune automatic safety backups beyond the retention count.
    pub fn prune_safety_backups(&self) -> Result<Vec<SafetyBackup>> {
        let guard = self.lock.try_acquire(OperationKind::SafetyMaintenance)?;
        self.safety_backups().prune_automatic(&guard)
    }

    /// Keep a safety backup permanently (or hand it back to pruning).
    pub fn keep_safety_backup(&self, name: &str, keep: bool) -> Result<SafetyBackup> {
        let guard = self.lock.try_acquire(OperationKind::SafetyMaintenance)?;
        self.safety_backups().mark_user_saved(&guard, name, keep)
    }

    /// Delete a safety backup.
    pub fn discard_safety_backup(&self, name: &str) -> Result<SafetyBackup> {
        let guard = self.lock.try_acquire(OperationKind::SafetyMaintenance)?;
        self.safety_backups().discard(&guard, name)
    }

    // --------------------------------------------------------------- helpers

    fn preflight<'a>(
        &'a self,
        limits: &'a SoftLimits,
        cancel: &'a CancellationToken,
        board: &'a StatusBoard,
    ) -> Preflight<'a> {
        Preflight {
            limits,
            disk_margin_bytes: self.config.lock().restore.disk_margin_bytes,
            data: &self.data,
            probe: self.probe.as_ref(),
            cancel,
            board,
        }
    }

    /// Persist `phase`, publish it and give the crash hook a chance to stop.
    fn enter(&self, session: &mut RestoreSession, phase: Phase) -> Result<()> {
        let current = session.phase();
        if current.is_cancellable() {
            self.cancel.check(Stage::Restore(current))?;
        }
        session.advance(phase)?;
        ProgressTracker::new(&self.board, Stage::Restore(phase), 0);
        self.crash(CrashPoint::Entered(phase))
    }

    fn crash(&self, point: CrashPoint) -> Result<()> {
        crash_check(self.crash_hook.as_ref(), point)
    }

    fn begin(&self, guard: &OperationGuard) {
        self.cancel.reset();
        self.board.start(guard.kind());
    }

    fn end<T>(&self, guard: &OperationGuard, result: &Result<T>, summary: impl FnOnce(&T) -> String) {
        self.board.finish();
        let record = match result {
            Ok(value) => LastOperation::succeeded(guard.kind(), summary(value)),
            Err(BackupError::SimulatedCrash { .. }) => return,
            Err(e) => LastOperation::failed(guard.kind(), e),
        };
        if let Err(e) = record.write(&self.data) {
            warn!(error = %e, "could not record operation outcome");
        }
    }
}

// ------------------------------------------------------------------- async

impl BackupEngine {
    /// [`Self::start_export`] on the blocking thread pool.
    pub async fn start_export_async(
        self: &Arc<Self>,
        scope: Scope,
        destination: PathBuf,
        options: ExportOptions,
    ) -> Result<ExportReport> {
        let engine = Arc::clone(self);
        tokio::task::spawn_blocking(move || engine.start_export(scope, &destination, &options))
            .await
            .map_err(|e| BackupError::Task(e.to_string()))?
    }

    /// [`Self::start_restore`] on the blocking thread pool.
    pub async fn start_restore_async(
        self: &Arc<Self>,
        archive: PathBuf,
        decider: Arc<dyn RestoreDecider>,
    ) -> Result<RestoreReport> {
        let engine = Arc::clone(self);
        tokio::task::spawn_blocking(move || engine.start_restore(&archive, decider.as_ref()))
            .await
            .map_err(|e| BackupError::Task(e.to_string()))?
    }

    /// [`Self::reconcile`] on the blocking thread pool.
    pub async fn reconcile_async(self: &Arc<Self>) -> Result<Option<ReconcileReport>> {
        let engine = Arc::clone(self);
        tokio::task::spawn_blocking(move || engine.reconcile())
            .await
            .map_err(|e| BackupError::Task(e.to_string()))?
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
