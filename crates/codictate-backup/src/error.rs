//! Backup and restore error types.
//!
//! Every error belongs to one [`ErrorCategory`]. The category decides whether
//! the error blocks an operation before active data is touched, whether a
//! retry can help, and which guidance is shown to the user.

use std::fmt;
use std::path::PathBuf;

use codictate_model::{ComponentKind, ModelError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lock::OperationKind;
use crate::session::Phase;

/// Error taxonomy shared by export, restore and recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Manifest, checksum or compatibility failures.
    Validation,
    /// Unsafe archive entries and hard resource-bound violations.
    Security,
    /// Disk space, file-size ceilings and soft-threshold overruns.
    Resource,
    /// Operation already running, quiesce timeout.
    Concurrency,
    /// Individual malformed rows or missing files.
    PartialData,
    /// No migration path from the archive schema to the current one.
    Migration,
    /// The operation was cancelled or declined.
    Cancelled,
    /// File system or archive I/O.
    Io,
}

impl ErrorCategory {
    /// Get a human-readable label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Security => "security",
            Self::Resource => "resource",
            Self::Concurrency => "concurrency",
            Self::PartialData => "partial data",
            Self::Migration => "migration",
            Self::Cancelled => "cancelled",
            Self::Io => "I/O",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Errors raised by the backup engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackupError {
    // ---------------------------------------------------------------- validation
    /// An archive entry does not match its recorded checksum.
    #[error("checksum mismatch for {path}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// A required archive entry (or a checksum-listed entry) is absent.
    #[error("required archive entry missing: {path}")]
    MissingEntry { path: String },

    /// A payload entry is present but not covered by the checksum set.
    #[error("archive entry {path} is not covered by the checksum set")]
    UnlistedEntry { path: String },

    /// The file is not a readable backup archive.
    #[error("not a readable backup archive: {reason}")]
    InvalidArchive { reason: String },

    /// The manifest or checksum set could not be interpreted.
    #[error("invalid {entry}: {reason}")]
    InvalidManifest { entry: &'static str, reason: String },

    /// The archive format major is outside the compatibility window.
    #[error("backup format {found} is not supported (supported: {supported})")]
    UnsupportedFormat { found: String, supported: String },

    /// Staged data failed its consistency check before commit.
    #[error("staged data failed verification: {reason}")]
    StagingInvalid { reason: String },

    /// No safety backup with this file name is tracked.
    #[error("unknown safety backup {name}")]
    UnknownSafetyBackup { name: String },

    /// A restore session tried to move to a phase it cannot reach.
    #[error("illegal restore transition {from} -> {to}")]
    IllegalTransition { from: Phase, to: Phase },

    // ------------------------------------------------------------------ security
    /// Entry path or type is unsafe to extract.
    #[error("unsafe archive entry {path}: {reason}")]
    UnsafeEntry { path: String, reason: &'static str },

    /// A non-overridable ceiling was exceeded.
    #[error("archive exceeds hard limit on {limit} ({actual} > {max})")]
    HardLimitExceeded {
        limit: &'static str,
        actual: u64,
        max: u64,
    },

    // ------------------------------------------------------------------ resource
    /// Not enough free space for the operation.
    #[error("not enough disk space at {path}: {required} bytes needed, {available} available")]
    InsufficientSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    /// The destination file system cannot hold a file this large.
    #[error("estimated archive size {estimated} exceeds the {ceiling} byte file limit at {path}")]
    FileSizeCeiling {
        path: PathBuf,
        estimated: u64,
        ceiling: u64,
    },

    /// A user-overridable threshold was exceeded.
    #[error("archive exceeds soft limit on {limit} ({actual} > {max})")]
    SoftLimitExceeded {
        limit: &'static str,
        actual: u64,
        max: u64,
    },

    /// The export destination exists and overwrite was not confirmed.
    #[error("destination already exists: {path}")]
    DestinationExists { path: PathBuf },

    /// No safety backup could be created, so the restore cannot continue.
    #[error("safety backup failed after {attempts} attempt(s)")]
    SafetyBackupFailed {
        attempts: u32,
        #[source]
        source: Box<BackupError>,
    },

    // --------------------------------------------------------------- concurrency
    /// Another backup or restore holds the operation lock.
    #[error("a {running} operation is already in progress")]
    Busy { running: OperationKind },

    /// Active data is quiesced by a running restore.
    #[error("a restore is in progress; active data is temporarily read-only")]
    RestoreInProgress,

    /// In-flight writes did not finish within the quiesce timeout.
    #[error("timed out after {timeout_ms} ms waiting for in-flight writes")]
    QuiesceTimeout { timeout_ms: u64 },

    // -------------------------------------------------------------- partial data
    /// A single record could not be decoded and was skipped.
    #[error("skipped {component} record {index}: {reason}")]
    MalformedRecord {
        component: ComponentKind,
        index: u64,
        reason: String,
    },

    /// History lines skipped because they are too long or malformed.
    #[error("{count} history row(s) will be skipped ({oversized} oversized, {malformed} malformed)")]
    SkippedRows {
        count: u64,
        oversized: u64,
        malformed: u64,
    },

    /// A recording referenced by history could not be found.
    #[error("recording missing: {name}")]
    MissingRecording { name: String },

    // ----------------------------------------------------------------- migration
    /// No chain of adjacent migrations reaches the current payload schema.
    #[error("no migration path for {component} payload version {from} (current: {current})")]
    Migration {
        component: ComponentKind,
        from: u32,
        current: u32,
    },

    // ----------------------------------------------------------------- cancelled
    /// Cancelled through [`crate::CancellationToken`].
    #[error("operation cancelled during {phase}")]
    Cancelled { phase: String },

    /// The caller declined a confirmation the operation needed.
    #[error("operation declined: {reason}")]
    Declined { reason: String },

    /// Test-only crash injection; no cleanup runs after it.
    #[doc(hidden)]
    #[error("simulated crash at {point}")]
    SimulatedCrash { point: String },

    // ------------------------------------------------------------------------ io
    /// File I/O error.
    #[error("failed to {operation} {path}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Archive container error.
    #[error("archive error in {path}")]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    /// JSON encoding or decoding of engine-owned files.
    #[error("failed to {operation} {what}")]
    Json {
        operation: &'static str,
        what: String,
        #[source]
        source: serde_json::Error,
    },

    /// Configuration file could not be parsed or written.
    #[error("invalid configuration at {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    /// A background task panicked or was aborted.
    #[error("background task failed: {0}")]
    Task(String),
}

impl BackupError {
    /// Build an I/O error mapper for `map_err`.
    pub(crate) fn io(
        operation: &'static str,
        path: impl Into<PathBuf>,
    ) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io {
            operation,
            path,
            source,
        }
    }

    /// Build a zip error mapper for `map_err`.
    pub(crate) fn zip(path: impl Into<PathBuf>) -> impl FnOnce(zip::result::ZipError) -> Self {
        let path = path.into();
        move |source| Self::Zip { path, source }
    }

    /// Build a JSON error mapper for `map_err`.
    pub(crate) fn json(
        operation: &'static str,
        what: impl Into<String>,
    ) -> impl FnOnce(serde_json::Error) -> Self {
        let what = what.into();
        move |source| Self::Json {
            operation,
            what,
            source,
        }
    }

    /// Category of this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ChecksumMismatch { .. }
            | Self::MissingEntry { .. }
            | Self::UnlistedEntry { .. }
            | Self::InvalidArchive { .. }
            | Self::InvalidManifest { .. }
            | Self::UnsupportedFormat { .. }
            | Self::StagingInvalid { .. }
            | Self::UnknownSafetyBackup { .. }
            | Self::IllegalTransition { .. } => ErrorCategory::Validation,
            Self::UnsafeEntry { .. } | Self::HardLimitExceeded { .. } => ErrorCategory::Security,
            Self::InsufficientSpace { .. }
            | Self::FileSizeCeiling { .. }
            | Self::SoftLimitExceeded { .. }
            | Self::DestinationExists { .. } => ErrorCategory::Resource,
            Self::SafetyBackupFailed { source, .. } => source.category(),
            Self::Busy { .. } | Self::RestoreInProgress | Self::QuiesceTimeout { .. } => {
                ErrorCategory::Concurrency
            }
            Self::MalformedRecord { .. }
            | Self::SkippedRows { .. }
            | Self::MissingRecording { .. } => ErrorCategory::PartialData,
            Self::Migration { .. } => ErrorCategory::Migration,
            Self::Cancelled { .. } | Self::Declined { .. } => ErrorCategory::Cancelled,
            Self::SimulatedCrash { .. }
            | Self::Io { .. }
            | Self::Zip { .. }
            | Self::Json { .. }
            | Self::Config { .. }
            | Self::Task(_) => ErrorCategory::Io,
        }
    }

    /// Whether this error stops the operation.
    ///
    /// Partial-data errors never abort; they are reported as warnings.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        self.category() != ErrorCategory::PartialData
    }

    /// Whether retrying later may succeed without changing the input.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SafetyBackupFailed { source, .. } => source.is_retryable(),
            _ => matches!(
                self.category(),
                ErrorCategory::Concurrency | ErrorCategory::Io
            ),
        }
    }

    /// Whether the failure was caused by low free space.
    #[must_use]
    pub fn is_low_space(&self) -> bool {
        match self {
            Self::InsufficientSpace { .. } => true,
            Self::SafetyBackupFailed { source, .. } => source.is_low_space(),
            Self::Io { source, .. } => source.kind() == std::io::ErrorKind::StorageFull,
            _ => false,
        }
    }

    /// Get a concise user-facing message for this error.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::ChecksumMismatch { path, .. } => format!(
                "The backup file is damaged: {path} does not match its checksum. Nothing was changed."
            ),
            Self::MissingEntry { path } => {
                format!("The backup file is incomplete: {path} is missing. Nothing was changed.")
            }
            Self::UnlistedEntry { path } => format!(
                "The backup file contains {path}, which is not covered by its checksums. Nothing was changed."
            ),
            Self::InvalidArchive { .. } => {
                "The selected file is not a Codictate backup.".to_string()
            }
            Self::InvalidManifest { entry, .. } => {
                format!("The backup's {entry} is unreadable. Nothing was changed.")
            }
            Self::UnsupportedFormat { found, .. } => format!(
                "This backup uses format {found}, which this version of Codictate cannot restore."
            ),
            Self::StagingInvalid { .. } => {
                "The restored data could not be verified. Nothing was changed.".to_string()
            }
            Self::UnknownSafetyBackup { name } => {
                format!("No safety backup named {name} exists.")
            }
            Self::IllegalTransition { .. } => {
                "The restore reached an unexpected state and was stopped.".to_string()
            }
            Self::UnsafeEntry { path, reason } => format!(
                "The backup contains an unsafe entry ({path}: {reason}) and was rejected. Nothing was changed."
            ),
            Self::HardLimitExceeded { limit, .. } => format!(
                "The backup exceeds the safety limit on {limit} and was rejected. Nothing was changed."
            ),
            Self::InsufficientSpace {
                required,
                available,
                ..
            } => format!(
                "Not enough free disk space: about {} needed, {} available.",
                format_bytes(*required),
                format_bytes(*available)
            ),
            Self::FileSizeCeiling {
                estimated, ceiling, ..
            } => format!(
                "The backup (about {}) is larger than the destination drive allows for a single file ({}).",
                format_bytes(*estimated),
                format_bytes(*ceiling)
            ),
            Self::SoftLimitExceeded { limit, actual, max } => format!(
                "The backup exceeds the configured limit on {limit} ({actual} > {max})."
            ),
            Self::DestinationExists { path } => {
                format!("A file already exists at {}.", path.display())
            }
            Self::SafetyBackupFailed { .. } => {
                "A safety backup of your current data could not be created, so the restore was not started."
                    .to_string()
            }
            Self::Busy { running } => {
                format!("Another {running} is already running. Try again when it has finished.")
            }
            Self::RestoreInProgress => {
                "A restore is in progress. Changes are paused until it finishes.".to_string()
            }
            Self::QuiesceTimeout { .. } => {
                "Codictate is busy saving data. The restore was not started.".to_string()
            }
            Self::MalformedRecord { component, .. } => {
                format!("One {component} record could not be read and was skipped.")
            }
            Self::SkippedRows { count, .. } => {
                format!("{count} history row(s) could not be read and will be skipped.")
            }
            Self::MissingRecording { name } => {
                format!("The recording {name} was not found and was left out.")
            }
            Self::Migration { component, .. } => format!(
                "The backup's {component} data is from a version this release cannot convert. Nothing was changed."
            ),
            Self::Cancelled { .. } => "The operation was cancelled. Nothing was changed.".to_string(),
            Self::Declined { reason } => format!("The operation was stopped: {reason}."),
            Self::SimulatedCrash { .. } => "The operation was interrupted.".to_string(),
            Self::Io {
                operation, path, ..
            } => format!("Could not {operation} {}.", path.display()),
            Self::Zip { .. } => "The backup file could not be read or written.".to_string(),
            Self::Json { what, .. } => format!("Could not process {what}."),
            Self::Config { path, .. } => {
                format!("The backup configuration at {} is invalid.", path.display())
            }
            Self::Task(_) => "An unexpected error occurred.".to_string(),
        }
    }

    /// Get a suggestion for how to resolve this error.
    #[must_use]
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::ChecksumMismatch { .. }
            | Self::MissingEntry { .. }
            | Self::UnlistedEntry { .. }
            | Self::InvalidManifest { .. } => {
                Some("Copy the backup file again from its original location, or use another backup.".into())
            }
            Self::InvalidArchive { .. } => {
                Some("Choose a file created with Codictate's Export Backup.".into())
            }
            Self::UnsupportedFormat { .. } | Self::Migration { .. } => {
                Some("Update Codictate to the latest version and try again.".into())
            }
            Self::UnsafeEntry { .. } | Self::HardLimitExceeded { .. } => {
                Some("Only restore backups that were created by Codictate.".into())
            }
            Self::InsufficientSpace { .. } => {
                Some("Free up disk space, or choose another destination or a lightweight backup.".into())
            }
            Self::FileSizeCeiling { .. } => Some(
                "Choose a destination on another drive, or export a lightweight backup without recordings."
                    .into(),
            ),
            Self::SoftLimitExceeded { .. } => {
                Some("Raise the limit for this restore if you trust the backup.".into())
            }
            Self::DestinationExists { .. } => {
                Some("Choose another file name or confirm that the file should be replaced.".into())
            }
            Self::SafetyBackupFailed { source, .. } => source
                .suggestion()
                .or_else(|| Some("Free up disk space and try the restore again.".into())),
            Self::Busy { .. } | Self::QuiesceTimeout { .. } => {
                Some("Wait a moment and try again.".into())
            }
            Self::RestoreInProgress => Some("Check the restore status for progress.".into()),
            Self::UnknownSafetyBackup { .. } => {
                Some("List safety backups to see the available names.".into())
            }
            Self::StagingInvalid { .. } | Self::IllegalTransition { .. } => {
                Some("Try the restore again. If it keeps failing, use another backup.".into())
            }
            Self::MalformedRecord { .. } | Self::SkippedRows { .. } => {
                Some("Open the details to see which rows were skipped.".into())
            }
            Self::MissingRecording { .. } => None,
            Self::Cancelled { .. } | Self::Declined { .. } | Self::SimulatedCrash { .. } => None,
            Self::Io { operation, .. } => {
                if operation.starts_with("read") || operation.starts_with("open") {
                    Some("Check that the file exists and you have permission to read it.".into())
                } else {
                    Some("Check that you have permission to write to this location.".into())
                }
            }
            Self::Zip { .. } => Some("The file may be damaged. Try another backup.".into()),
            Self::Json { .. } | Self::Task(_) => None,
            Self::Config { .. } => {
                Some("Fix or delete backup.toml to return to the default limits.".into())
            }
        }
    }
}

impl From<ModelError> for BackupError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::InvalidVersion(version) => Self::InvalidManifest {
                entry: "manifest",
                reason: format!("invalid backup format version {version:?}"),
            },
            ModelError::UnsupportedFormat { found, supported } => {
                Self::UnsupportedFormat { found, supported }
            }
            ModelError::MissingMigration {
                component,
                from,
                current,
            } => Self::Migration {
                component,
                from,
                current,
            },
            ModelError::MalformedRecord { component, reason } => Self::MalformedRecord {
                component,
                index: 0,
                reason,
            },
            other => Self::InvalidManifest {
                entry: "payload",
                reason: other.to_string(),
            },
        }
    }
}

/// Format a byte count for user-facing messages.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Result type alias for backup operations.
pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_drive_blocking() {
        let partial = BackupError::MissingRecording {
            name: "a.wav".into(),
        };
        assert_eq!(partial.category(), ErrorCategory::PartialData);
        assert!(!partial.is_blocking());

        let unsafe_entry = BackupError::UnsafeEntry {
            path: "../x".into(),
            reason: "parent directory traversal",
        };
        assert_eq!(unsafe_entry.category(), ErrorCategory::Security);
        assert!(unsafe_entry.is_blocking());
        assert!(!unsafe_entry.is_retryable());
    }

    #[test]
    fn test_busy_is_retryable() {
        let err = BackupError::Busy {
            running: OperationKind::Export,
        };
        assert!(err.is_retryable());
        assert!(err.user_message().contains("export"));
        assert!(err.suggestion().is_some());
    }

    #[test]
    fn test_low_space_through_safety_failure() {
        let err = BackupError::SafetyBackupFailed {
            attempts: 2,
            source: Box::new(BackupError::InsufficientSpace {
                path: PathBuf::from("/tmp"),
                required: 10,
                available: 1,
            }),
        };
        assert!(err.is_low_space());
        assert_eq!(err.category(), ErrorCategory::Resource);
    }

    #[test]
    fn test_model_error_mapping() {
        let err: BackupError = ModelError::MissingMigration {
            component: ComponentKind::History,
            from: 9,
            current: 3,
        }
        .into();
        assert_eq!(err.category(), ErrorCategory::Migration);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }
}
