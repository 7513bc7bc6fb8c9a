//! Process-wide operation lock.
//!
//! At most one export, restore or recovery runs at a time. A second request
//! fails fast with [`BackupError::Busy`]; it is never queued. The safety backup
//! taken during a restore runs under the restore's guard instead of acquiring
//! the lock again.

use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BackupError, Result};

/// Kind of operation holding the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Export to an archive.
    Export,
    /// Restore from an archive.
    Restore,
    /// Startup reconciliation of an interrupted restore.
    Recovery,
    /// Listing, pruning or discarding safety backups.
    SafetyMaintenance,
}

impl OperationKind {
    /// Get a human-readable label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Export => "export",
            Self::Restore => "restore",
            Self::Recovery => "recovery",
            Self::SafetyMaintenance => "safety backup maintenance",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Single-holder lock for backup operations.
#[derive(Debug, Default)]
pub struct OperationLock {
    holder: Mutex<Option<OperationKind>>,
}

static GLOBAL: OnceLock<Arc<OperationLock>> = OnceLock::new();

impl OperationLock {
    /// Create an independent lock (tests, embedded engines).
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The lock shared by every engine in this process.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(Self::new))
    }

    /// Acquire the lock or fail with [`BackupError::Busy`].
    pub fn try_acquire(self: &Arc<Self>, kind: OperationKind) -> Result<OperationGuard> {
        let mut holder = self.holder.lock();
        if let Some(running) = *holder {
            debug!(requested = %kind, %running, "operation lock busy");
            return Err(BackupError::Busy { running });
        }
        *holder = Some(kind);
        Ok(OperationGuard {
            lock: Arc::clone(self),
            kind,
        })
    }

    /// Operation currently holding the lock.
    #[must_use]
    pub fn current(&self) -> Option<OperationKind> {
        *self.holder.lock()
    }
}

/// Proof that the holder owns the operation lock; releases it on drop.
#[derive(Debug)]
pub struct OperationGuard {
    lock: Arc<OperationLock>,
    kind: OperationKind,
}

impl OperationGuard {
    /// Kind of operation holding the lock.
    #[must_use]
    pub fn kind(&self) -> OperationKind {
        self.kind
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        *self.lock.holder.lock() = None;
    }
}
