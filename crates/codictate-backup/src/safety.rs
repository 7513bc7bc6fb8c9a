//! Pre-restore safety backups.
//!
//! Safety backups are ordinary archives kept under `<data_root>/safety-backups`
//! and tracked in `index.json`. Automatic copies are pruned to the newest
//! `retention`; copies the user chose to keep are never pruned.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use codictate_model::Scope;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{BackupError, Result};
use crate::export::{ExportOptions, take_snapshot};
use crate::export::writer::write_archive;
use crate::io::{PARTIAL_SUFFIX, remove_file_if_exists, write_atomic};
use crate::lock::OperationGuard;
use crate::progress::{CancellationToken, StatusBoard};
use crate::store::{LocalStores, StatsEngine};
use crate::volume::VolumeProbe;

const INDEX_FILE: &str = "index.json";

/// One safety backup archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyBackup {
    /// File name inside the safety backup directory.
    pub file_name: String,
    pub created_at: DateTime<Utc>,
    pub scope: Scope,
    pub size_bytes: u64,
    /// Exempt from automatic pruning.
    #[serde(default)]
    pub user_saved: bool,
    /// Restore session the backup was taken for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
}

impl SafetyBackup {
    /// Whether this copy lacks recordings.
    #[must_use]
    pub fn is_lightweight(&self) -> bool {
        self.scope == Scope::Lightweight
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SafetyIndex {
    #[serde(default)]
    backups: Vec<SafetyBackup>,
}

/// Inputs shared by every safety backup a restore creates.
pub(crate) struct CreateContext<'a> {
    pub(crate) active: &'a LocalStores,
    pub(crate) stats: &'a dyn StatsEngine,
    pub(crate) app_version: &'a str,
    pub(crate) probe: &'a dyn VolumeProbe,
    pub(crate) cancel: &'a CancellationToken,
    pub(crate) board: &'a StatusBoard,
}

/// Safety backup directory and its retention policy.
#[derive(Debug, Clone)]
pub struct SafetyBackups {
    dir: PathBuf,
    retention: usize,
}

impl SafetyBackups {
    pub fn new(dir: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            dir: dir.into(),
            retention,
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Full path of a safety backup.
    #[must_use]
    pub fn path_of(&self, backup: &SafetyBackup) -> PathBuf {
        self.dir.join(&backup.file_name)
    }

    /// Tracked backups whose archive still exists, newest first.
    pub fn list(&self) -> Result<Vec<SafetyBackup>> {
        let mut backups: Vec<SafetyBackup> = self
            .read_index()?
            .backups
            .into_iter()
            .filter(|b| self.path_of(b).is_file())
            .collect();
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    /// Look up a backup by file name.
    pub fn find(&self, name: &str) -> Result<SafetyBackup> {
        self.list()?
            .into_iter()
            .find(|b| b.file_name == name)
            .ok_or_else(|| BackupError::UnknownSafetyBackup {
                name: name.to_string(),
            })
    }

    /// Snapshot the active stores into a new safety backup.
    pub(crate) fn create(
        &self,
        _guard: &OperationGuard,
        ctx: &CreateContext<'_>,
        scope: Scope,
        session: Option<Uuid>,
    ) -> Result<SafetyBackup> {
        fs::create_dir_all(&self.dir).map_err(BackupError::io("create directory", &self.dir))?;
        let created_at = Utc::now();
        let file_name = file_name_for(created_at);
        let destination = self.dir.join(&file_name);

        let snapshot = take_snapshot(ctx.active, ctx.stats, scope)?;
        let summary = write_archive(
            &snapshot,
            &destination,
            ctx.app_version,
            &ExportOptions::default(),
            ctx.probe,
            ctx.cancel,
            ctx.board,
        )?;

        let backup = SafetyBackup {
            file_name,
            created_at,
            scope,
            size_bytes: summary.size_bytes,
            user_saved: false,
            session_id: session,
        };
        let mut index = self.read_index()?;
        index.backups.push(backup.clone());
        if let Err(e) = self.write_index(&index) {
            // an untracked archive would never be pruned
            if let Err(cleanup) = remove_file_if_exists(&destination) {
                warn!(error = %cleanup, "could not remove untracked safety backup");
            }
            return Err(e);
        }
        info!(
            file = %backup.file_name,
            scope = %scope,
            size_bytes = backup.size_bytes,
            "safety backup created"
        );
        Ok(backup)
    }

    /// Delete automatic backups beyond the newest `retention`. Returns the
    /// removed backups.
    pub fn prune_automatic(&self, _guard: &OperationGuard) -> Result<Vec<SafetyBackup>> {
        let backups = self.list()?;
        let (keep, remove): (Vec<_>, Vec<_>) = backups
            .into_iter()
            .scan(0_usize, |automatic, backup| {
                if backup.user_saved {
                    return Some((true, backup));
                }
                *automatic += 1;
                Some((*automatic <= self.retention, backup))
            })
            .partition(|(keep, _)| *keep);

        if remove.is_empty() {
            return Ok(Vec::new());
        }
        let removed: Vec<SafetyBackup> = remove.into_iter().map(|(_, b)| b).collect();
        for backup in &removed {
            remove_file_if_exists(&self.path_of(backup))?;
        }
        self.write_index(&SafetyIndex {
            backups: keep.into_iter().map(|(_, b)| b).collect(),
        })?;
        info!(removed = removed.len(), retention = self.retention, "safety backups pruned");
        Ok(removed)
    }

    /// Remove archives left half-written by an interrupted backup. Returns
    /// how many were removed.
    pub fn sweep_partial(&self, _guard: &OperationGuard) -> Result<usize> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(BackupError::io("read directory", &self.dir)(e)),
        };
        let mut removed = 0;
        for entry in entries {
            let path = entry.map_err(BackupError::io("read directory", &self.dir))?.path();
            let partial = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(PARTIAL_SUFFIX));
            if partial && path.is_file() {
                remove_file_if_exists(&path)?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "stale partial safety backups removed");
        }
        Ok(removed)
    }

    /// Exempt a backup from pruning, or make it automatic again.
    pub fn mark_user_saved(
        &self,
        _guard: &OperationGuard,
        name: &str,
        saved: bool,
    ) -> Result<SafetyBackup> {
        let mut index = self.read_index()?;
        let backup = index
            .backups
            .iter_mut()
            .find(|b| b.file_name == name)
            .ok_or_else(|| BackupError::UnknownSafetyBackup {
                name: name.to_string(),
            })?;
        backup.user_saved = saved;
        let updated = backup.clone();
        self.write_index(&index)?;
        debug!(file = name, saved, "safety backup retention changed");
        Ok(updated)
    }

    /// Delete one backup.
    pub fn discard(&self, _guard: &OperationGuard, name: &str) -> Result<SafetyBackup> {
        let mut index = self.read_index()?;
        let position = index
            .backups
            .iter()
            .position(|b| b.file_name == name)
            .ok_or_else(|| BackupError::UnknownSafetyBackup {
                name: name.to_string(),
            })?;
        let backup = index.backups.remove(position);
        remove_file_if_exists(&self.path_of(&backup))?;
        self.write_index(&index)?;
        info!(file = name, "safety backup discarded");
        Ok(backup)
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    fn read_index(&self) -> Result<SafetyIndex> {
        let path = self.index_path();
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(BackupError::json("decode", "safety backup index")),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SafetyIndex::default()),
            Err(e) => Err(BackupError::io("read", path)(e)),
        }
    }

    fn write_index(&self, index: &SafetyIndex) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(index)
            .map_err(BackupError::json("encode", "safety backup index"))?;
        write_atomic(&self.index_path(), &bytes)
    }
}

/// `safety-backup-YYYY-MM-DD_HH-MM-SS-<8 hex>.zip`
fn file_name_for(created_at: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "safety-backup-{}-{}.zip",
        created_at.format("%Y-%m-%d_%H-%M-%S"),
        &suffix[..8]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{OperationKind, OperationLock};
    use crate::store::WordCountStats;
    use crate::volume::SystemVolumeProbe;
    use chrono::Duration;
    use tempfile::tempdir;

    fn seed(backups: &SafetyBackups, entries: &[(i64, bool)]) {
        fs::create_dir_all(backups.dir()).unwrap();
        let base = Utc::now();
        let index = SafetyIndex {
            backups: entries
                .iter()
                .map(|&(age_minutes, user_saved)| {
                    let backup = SafetyBackup {
                        file_name: format!("safety-{age_minutes}.zip"),
                        created_at: base - Duration::minutes(age_minutes),
                        scope: Scope::Full,
                        size_bytes: 10,
                        user_saved,
                        session_id: None,
                    };
                    fs::write(backups.path_of(&backup), b"zip").unwrap();
                    backup
                })
                .collect(),
        };
        backups.write_index(&index).unwrap();
    }

    fn names(list: &[SafetyBackup]) -> Vec<&str> {
        list.iter().map(|b| b.file_name.as_str()).collect()
    }

    #[test]
    fn test_prune_keeps_newest_automatic_and_user_saved() {
        let dir = tempdir().unwrap();
        let backups = SafetyBackups::new(dir.path(), 3);
        seed(&backups, &[(1, false), (2, false), (3, true), (4, false), (5, false), (6, false)]);

        let lock = OperationLock::new();
        let guard = lock.try_acquire(OperationKind::SafetyMaintenance).unwrap();
        let removed = backups.prune_automatic(&guard).unwrap();
        assert_eq!(names(&removed), vec!["safety-5.zip", "safety-6.zip"]);
        assert_eq!(
            names(&backups.list().unwrap()),
            vec!["safety-1.zip", "safety-2.zip", "safety-3.zip", "safety-4.zip"]
        );
        assert!(!dir.path().join("safety-6.zip").exists());
    }

    #[test]
    fn test_sweep_partial_keeps_finished_archives() {
        let dir = tempdir().unwrap();
        let backups = SafetyBackups::new(dir.path(), 3);
        seed(&backups, &[(1, false)]);
        fs::write(dir.path().join("safety-backup-x.zip.partial"), b"half").unwrap();
        let lock = OperationLock::new();
        let guard = lock.try_acquire(OperationKind::Recovery).unwrap();

        assert_eq!(backups.sweep_partial(&guard).unwrap(), 1);
        assert!(!dir.path().join("safety-backup-x.zip.partial").exists());
        assert_eq!(names(&backups.list().unwrap()), vec!["safety-1.zip"]);
        assert_eq!(backups.sweep_partial(&guard).unwrap(), 0);

        let missing = SafetyBackups::new(dir.path().join("none"), 3);
        assert_eq!(missing.sweep_partial(&guard).unwrap(), 0);
    }

    #[test]
    fn test_mark_and_discard() {
        let dir = tempdir().unwrap();
        let backups = SafetyBackups::new(dir.path(), 1);
        seed(&backups, &[(1, false), (2, false)]);
        let lock = OperationLock::new();
        let guard = lock.try_acquire(OperationKind::SafetyMaintenance).unwrap();

        backups.mark_user_saved(&guard, "safety-2.zip", true).unwrap();
        assert!(backups.prune_automatic(&guard).unwrap().is_empty());

        backups.discard(&guard, "safety-1.zip").unwrap();
        assert_eq!(names(&backups.list().unwrap()), vec!["safety-2.zip"]);

        let err = backups.discard(&guard, "nope.zip").unwrap_err();
        assert!(matches!(err, BackupError::UnknownSafetyBackup { .. }));
    }

    #[test]
    fn test_list_skips_missing_files() {
        let dir = tempdir().unwrap();
        let backups = SafetyBackups::new(dir.path(), 3);
        seed(&backups, &[(1, false), (2, false)]);
        fs::remove_file(dir.path().join("safety-1.zip")).unwrap();
        assert_eq!(names(&backups.list().unwrap()), vec!["safety-2.zip"]);
    }

    #[test]
    fn test_create_writes_archive_and_index() {
        let dir = tempdir().unwrap();
        let active = LocalStores::at(dir.path().join("active"));
        fs::create_dir_all(active.dir()).unwrap();
        let backups = SafetyBackups::new(dir.path().join("safety-backups"), 3);
        let lock = OperationLock::new();
        let guard = lock.try_acquire(OperationKind::Restore).unwrap();
        let board = StatusBoard::new(None);
        let ctx = CreateContext {
            active: &active,
            stats: &WordCountStats,
            app_version: "1.0.0",
            probe: &SystemVolumeProbe,
            cancel: &CancellationToken::new(),
            board: &board,
        };

        let backup = backups.create(&guard, &ctx, Scope::Lightweight, None).unwrap();
        assert!(backup.file_name.starts_with("safety-backup-"));
        assert!(backup.is_lightweight());
        assert!(backups.path_of(&backup).is_file());
        assert_eq!(backups.find(&backup.file_name).unwrap(), backup);
    }

    #[test]
    fn test_file_name_shape() {
        let name = file_name_for(Utc::now());
        assert!(name.starts_with("safety-backup-"));
        assert!(name.ends_with(".zip"));
        assert_eq!(name.len(), "safety-backup-2026-01-01_00-00-00-abcdef12.zip".len());
    }
}
