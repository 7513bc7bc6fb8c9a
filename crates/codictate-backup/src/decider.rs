//! Caller decisions a restore may need.
//!
//! The engine never prompts. Whenever the restore reaches a point that needs
//! the user's consent, it asks the [`RestoreDecider`] passed to
//! [`crate::BackupEngine::start_restore`]. Every default answer is the
//! conservative one.

use serde::{Deserialize, Serialize};

use crate::error::BackupError;
use crate::preflight::PreflightReport;
use crate::safety::SafetyBackup;

/// Answer to recoverable preflight findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoverableChoice {
    /// Restore anyway; skipped rows are reported as warnings.
    ContinuePartial,
    /// Persist soft limits large enough for this archive and re-check.
    RaiseLimits,
    #[default]
    Cancel,
}

/// Answer when the safety backup could not be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyFallback {
    /// Try the full safety backup again.
    RetryFull,
    /// Take a backup without recordings; they cannot be rolled back.
    Lightweight,
    #[default]
    Cancel,
}

/// What happens to the safety backup after a successful restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepChoice {
    #[default]
    Keep,
    Discard,
}

/// Consent callbacks for a restore.
pub trait RestoreDecider: Send + Sync {
    /// Preflight found only recoverable problems.
    fn confirm_recoverable(&self, _report: &PreflightReport) -> RecoverableChoice {
        RecoverableChoice::Cancel
    }

    /// Safety backup attempt `attempt` failed with `error`.
    fn on_safety_backup_failed(&self, _error: &BackupError, _attempt: u32) -> SafetyFallback {
        SafetyFallback::Cancel
    }

    /// The restore succeeded; keep or discard its safety backup.
    fn keep_safety_backup(&self, _backup: &SafetyBackup) -> KeepChoice {
        KeepChoice::Keep
    }

    /// Second confirmation before a safety backup is deleted.
    fn confirm_discard(&self, _backup: &SafetyBackup) -> bool {
        false
    }
}

/// Decider with fixed answers, for non-interactive callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Policy {
    pub on_recoverable: RecoverableChoice,
    pub on_safety_failure: SafetyFallback,
    pub after_restore: KeepChoice,
    /// Answer to the second discard confirmation.
    pub confirm_discard: bool,
}

impl Policy {
    /// Accept recoverable findings, keep everything else at defaults.
    #[must_use]
    pub fn accept_partial() -> Self {
        Self {
            on_recoverable: RecoverableChoice::ContinuePartial,
            ..Self::default()
        }
    }
}

impl RestoreDecider for Policy {
    fn confirm_recoverable(&self, _report: &PreflightReport) -> RecoverableChoice {
        self.on_recoverable
    }

    fn on_safety_backup_failed(&self, _error: &BackupError, _attempt: u32) -> SafetyFallback {
        self.on_safety_failure
    }

    fn keep_safety_backup(&self, _backup: &SafetyBackup) -> KeepChoice {
        self.after_restore
    }

    fn confirm_discard(&self, _backup: &SafetyBackup) -> bool {
        self.confirm_discard
    }
}
