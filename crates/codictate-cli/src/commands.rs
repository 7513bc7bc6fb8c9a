use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{info, info_span};

use codictate_backup::{
    BackupEngine, BackupError, DataDir, ExportOptions, ExportReport, PreflightReport,
    ProgressSink, ReconcileReport, RestoreReport, SafetyBackup, Scope,
};

use crate::cli::{ExportArgs, RestoreArgs, SafetyCommand, SafetyFallbackArg, VerifyArgs};
use crate::progress::BarSink;
use crate::prompt::{CliDecider, FallbackMode, Prompter};
use crate::summary::{
    print_export, print_preflight, print_reconcile, print_restore, print_safety_list,
    print_status,
};

/// Exit status when a confirmation was required but not given.
pub const EXIT_DECLINED: i32 = 2;

/// Engine plus the terminal progress bar wired into it.
pub struct Session {
    pub engine: BackupEngine,
    bar: Arc<BarSink>,
}

impl Session {
    /// Open the engine over `data_dir`, or the platform default.
    pub fn open(data_dir: Option<PathBuf>, show_progress: bool) -> Result<Self> {
        let root = data_dir
            .or_else(DataDir::default_root)
            .context("no data directory found; pass --data-dir")?;
        let engine = BackupEngine::new(&root)
            .with_context(|| format!("open data directory {}", root.display()))?;
        Ok(Self::with_engine(engine, show_progress))
    }

    /// Wrap an already configured engine.
    pub fn with_engine(engine: BackupEngine, show_progress: bool) -> Self {
        let bar = Arc::new(BarSink::new(show_progress));
        let engine = engine.with_progress(Arc::clone(&bar) as Arc<dyn ProgressSink>);
        Self { engine, bar }
    }

    fn finish_progress(&self) {
        self.bar.finish();
    }
}

pub fn run_export(session: &Session, args: &ExportArgs) -> Result<ExportReport> {
    let destination = match &args.output {
        Some(path) => path.clone(),
        None => std::env::current_dir().context("resolve current directory")?,
    };
    let scope: Scope = args.scope.into();
    let span = info_span!("export", %scope);
    let _guard = span.enter();
    let options = ExportOptions {
        overwrite: args.overwrite,
    };
    let result = session.engine.start_export(scope, &destination, &options);
    session.finish_progress();
    let report = result?;
    print_export(&report);
    Ok(report)
}

pub fn run_restore(
    session: &Session,
    args: &RestoreArgs,
    prompter: Option<Prompter>,
    verbose: bool,
) -> Result<RestoreReport> {
    let span = info_span!("restore", archive = %args.archive.display());
    let _guard = span.enter();
    let mut decider = CliDecider::new(prompter);
    decider.accept_partial = args.accept_partial;
    decider.raise_limits = args.raise_limits;
    decider.fallback = match args.safety_fallback {
        SafetyFallbackArg::Ask => FallbackMode::Ask,
        SafetyFallbackArg::Lightweight => FallbackMode::Lightweight,
        SafetyFallbackArg::Cancel => FallbackMode::Cancel,
    };
    decider.discard_after = args.discard_safety_backup;
    decider.assume_yes = args.yes;
    let result = session.engine.start_restore(&args.archive, &decider);
    session.finish_progress();
    let report = match result {
        Ok(report) => report,
        Err(BackupError::SafetyBackupFailed { attempts, source })
            if decider.declined_fallback() =>
        {
            info!(attempts, cause = %source, "restore cancelled after safety backup failed");
            return Err(BackupError::Declined {
                reason: format!(
                    "no safety backup could be made ({}) and the restore was cancelled",
                    source.user_message()
                ),
            }
            .into());
        }
        Err(e) => return Err(e.into()),
    };
    print_restore(&report, verbose);
    Ok(report)
}

/// Validate an archive; fails when a finding blocks the restore.
pub fn run_verify(session: &Session, args: &VerifyArgs) -> Result<PreflightReport> {
    let report = session.engine.verify_archive(&args.archive)?;
    print_preflight(&report);
    if report.is_blocking() {
        bail!("{} cannot be restored", args.archive.display());
    }
    Ok(report)
}

pub fn run_status(session: &Session) -> Result<()> {
    let engine = &session.engine;
    let pending = engine.pending_session()?;
    let last = engine.last_operation()?;
    let recovery = engine.last_recovery()?;
    print_status(
        &engine.get_operation_status(),
        pending.as_ref(),
        last.as_ref(),
        recovery.as_ref(),
    );
    Ok(())
}

pub fn run_recover(session: &Session) -> Result<Option<ReconcileReport>> {
    let report = session.engine.reconcile()?;
    if let Some(report) = &report {
        info!(outcome = ?report.outcome, "recovery finished");
    }
    print_reconcile(report.as_ref());
    Ok(report)
}

pub fn run_safety(
    session: &Session,
    command: &SafetyCommand,
    prompter: Option<Prompter>,
) -> Result<()> {
    let engine = &session.engine;
    match command {
        SafetyCommand::List => print_safety_list(&engine.list_safety_backups()?),
        SafetyCommand::Prune => {
            let removed = engine.prune_safety_backups()?;
            println!("Removed {} automatic safety backup(s).", removed.len());
        }
        SafetyCommand::Keep { name, release } => {
            let backup = engine.keep_safety_backup(name, !release)?;
            if backup.user_saved {
                println!("{} will be kept until you discard it.", backup.file_name);
            } else {
                println!("{} may be removed by automatic pruning.", backup.file_name);
            }
        }
        SafetyCommand::Discard { name, yes } => {
            let backup = engine
                .list_safety_backups()?
                .into_iter()
                .find(|b| &b.file_name == name)
                .ok_or_else(|| BackupError::UnknownSafetyBackup { name: name.clone() })?;
            if !*yes && !confirm_discard(prompter.as_ref(), &backup)? {
                return Err(BackupError::Declined {
                    reason: format!("discarding {name} was not confirmed"),
                }
                .into());
            }
            engine.discard_safety_backup(name)?;
            println!("Deleted {}.", backup.file_name);
        }
    }
    Ok(())
}

fn confirm_discard(prompter: Option<&Prompter>, backup: &SafetyBackup) -> Result<bool> {
    let Some(prompter) = prompter else {
        return Err(BackupError::Declined {
            reason: "pass --yes to discard without a terminal".into(),
        }
        .into());
    };
    Ok(prompter.confirm(&format!(
        "Delete safety backup {}? It cannot be recovered.",
        backup.file_name
    )))
}

/// Exit status for a failed command.
pub fn exit_code(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<BackupError>() {
        Some(BackupError::Declined { .. }) => EXIT_DECLINED,
        _ => 1,
    }
}

/// Print a failed command: the user-facing message, the suggested next
/// step and, with `verbose`, the full cause chain.
pub fn report_error(error: &anyhow::Error, verbose: bool) {
    match error.downcast_ref::<BackupError>() {
        Some(backup) => {
            eprintln!("error: {}", backup.user_message());
            if let Some(suggestion) = backup.suggestion() {
                eprintln!("hint: {suggestion}");
            }
            if verbose {
                eprintln!("cause: {error:#}");
            }
        }
        None => eprintln!("error: {error:#}"),
    }
}
