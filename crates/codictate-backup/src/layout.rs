//! On-disk layout of the Codictate data root.
//!
//! ```text
//! <data_root>/
//!   active/                 live data
//!   .restore/session.json   restore phase marker
//!   .restore/work/          unpacked, verified archive entries
//!   .restore/staging/       next active/ being assembled
//!   .restore/staging.complete
//!   .restore/rollback/      previous active/ during the commit swap
//!   safety-backups/         safety backup archives + index.json
//!   backup.toml             engine configuration
//!   last_operation.json     durable outcome of the last operation
//! ```

use std::path::{Path, PathBuf};

use crate::config::BackupConfig;
use crate::error::{BackupError, Result};

/// Paths below one data root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Use `root` as the data root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Platform data directory for Codictate, if the home directory is known.
    #[must_use]
    pub fn default_root() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "Codictate", "Codictate")
            .map(|dirs| dirs.data_dir().to_path_buf())
    }

    /// Create the root and `active/` if missing.
    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(self.active())
            .map_err(BackupError::io("create directory", self.active()))
    }

    /// The data root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Live data directory.
    #[must_use]
    pub fn active(&self) -> PathBuf {
        self.root.join("active")
    }

    /// Restore workspace owned by the engine.
    #[must_use]
    pub fn restore_dir(&self) -> PathBuf {
        self.root.join(".restore")
    }

    /// Persisted restore phase marker.
    #[must_use]
    pub fn marker(&self) -> PathBuf {
        self.restore_dir().join("session.json")
    }

    /// Unpacked archive entries.
    #[must_use]
    pub fn work(&self) -> PathBuf {
        self.restore_dir().join("work")
    }

    /// Staged next `active/`.
    #[must_use]
    pub fn staging(&self) -> PathBuf {
        self.restore_dir().join("staging")
    }

    /// Sentinel written once staging is fully assembled and verified.
    #[must_use]
    pub fn staging_complete(&self) -> PathBuf {
        self.restore_dir().join("staging.complete")
    }

    /// Previous `active/` while the commit swap runs.
    #[must_use]
    pub fn rollback(&self) -> PathBuf {
        self.restore_dir().join("rollback")
    }

    /// Safety backup directory.
    #[must_use]
    pub fn safety_backups(&self) -> PathBuf {
        self.root.join("safety-backups")
    }

    /// Engine configuration file.
    #[must_use]
    pub fn config(&self) -> PathBuf {
        self.root.join(BackupConfig::FILE_NAME)
    }

    /// Durable record of the last operation outcome.
    #[must_use]
    pub fn last_operation(&self) -> PathBuf {
        self.root.join("last_operation.json")
    }

    /// Durable record of the last crash recovery. Later operations leave it
    /// alone.
    #[must_use]
    pub fn last_recovery(&self) -> PathBuf {
        self.root.join("last_recovery.json")
    }
}
