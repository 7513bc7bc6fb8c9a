//! Backup, staged restore and crash recovery for Codictate user data.
//!
//! # Export
//!
//! [`BackupEngine::start_export`] snapshots the stores through the store
//! traits, writes one ZIP archive next to the destination as `.partial` and
//! renames it into place once it is complete.
//!
//! # Restore
//!
//! [`BackupEngine::start_restore`] drives a [`RestoreSession`]:
//!
//! ```text
//! Preflight -> SafetyBackup -> Quiesce -> StagingImport -> Migrate
//!           -> Validate -> Commit -> Complete
//! ```
//!
//! Preflight is read-only. Everything up to `Validate` writes only below
//! `<data_root>/.restore/`; `Commit` swaps the staged directory into place
//! with two renames. A failure before the swap rolls back, and a crash at any
//! point is resolved by [`BackupEngine::reconcile`] on the next start.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use codictate_backup::{BackupEngine, ExportOptions, Policy, Scope};
//!
//! # fn main() -> codictate_backup::Result<()> {
//! let engine = BackupEngine::new("/tmp/codictate")?;
//! engine.reconcile()?;
//! let export = engine.start_export(Scope::Full, Path::new("/tmp"), &ExportOptions::default())?;
//! let report = engine.start_restore(&export.path, &Policy::default())?;
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```

mod archive;
pub mod checksum;
pub mod commit;
pub mod config;
pub mod decider;
pub mod engine;
pub mod error;
pub mod export;
pub mod import;
pub mod io;
pub mod layout;
pub mod lock;
pub mod preflight;
pub mod progress;
pub mod quiesce;
pub mod recovery;
pub mod report;
pub mod safety;
pub mod session;
pub mod store;
pub mod volume;

pub use codictate_model::Scope;
pub use commit::{CrashHook, CrashPoint};
pub use config::{BackupConfig, SoftLimits};
pub use decider::{KeepChoice, Policy, RecoverableChoice, RestoreDecider, SafetyFallback};
pub use engine::BackupEngine;
pub use error::{BackupError, ErrorCategory, Result, format_bytes};
pub use export::{ExportOptions, default_file_name};
pub use import::ImportCounts;
pub use layout::DataDir;
pub use lock::{OperationKind, OperationLock};
pub use preflight::{Finding, PreflightReport, Severity};
pub use progress::{CancellationToken, OperationStatus, ProgressEvent, ProgressSink, Stage};
pub use quiesce::{WriteGate, WriteGuard};
pub use recovery::{Action, Outcome, ReconcileReport};
pub use report::{ExportReport, LastOperation, RestoreReport};
pub use safety::{SafetyBackup, SafetyBackups};
pub use session::{Phase, SessionMarker};
pub use store::{
    DictionaryStore, HistoryStore, LocalStores, RecordingStore, SettingsStore, StatsEngine,
    WordCountStats,
};
pub use volume::{SystemVolumeProbe, VolumeProbe};
