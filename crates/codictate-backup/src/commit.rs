//! Commit and rollback of a staged restore.
//!
//! The swap is two renames inside the data root followed by a cleanup:
//!
//! ```text
//! active            -> .restore/rollback
//! .restore/staging  -> active
//! remove .restore/rollback
//! ```
//!
//! Every intermediate state is recognised by [`crate::recovery::decide`], so
//! a crash at any point resolves to either the old or the new data.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::error::{BackupError, Result};
use crate::io::{remove_dir_if_exists, remove_file_if_exists, rename_durable};
use crate::layout::DataDir;
use crate::session::Phase;

/// Points at which a crash can be simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// Right after the session marker recorded this phase.
    Entered(Phase),
    /// Active data has been moved to the rollback slot.
    ActiveMovedAside,
    /// Staging has been promoted; the rollback copy still exists.
    StagingPromoted,
}

impl fmt::Display for CrashPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entered(phase) => write!(f, "entered {phase}"),
            Self::ActiveMovedAside => f.write_str("active moved aside"),
            Self::StagingPromoted => f.write_str("staging promoted"),
        }
    }
}

/// Test hook: returning `true` stops the restore at that point without any
/// cleanup, as if the process had died.
pub type CrashHook = Arc<dyn Fn(CrashPoint) -> bool + Send + Sync>;

pub(crate) fn crash_check(hook: Option<&CrashHook>, point: CrashPoint) -> Result<()> {
    if let Some(hook) = hook
        && hook(point)
    {
        warn!(%point, "simulated crash");
        return Err(BackupError::SimulatedCrash {
            point: point.to_string(),
        });
    }
    Ok(())
}

/// Swap the completed staging area into place.
pub(crate) fn commit(data: &DataDir, deadline: Duration, hook: Option<&CrashHook>) -> Result<()> {
    let started = Instant::now();
    let active = data.active();
    let staging = data.staging();
    let rollback = data.rollback();

    if !data.staging_complete().exists() || !staging.is_dir() {
        return Err(BackupError::StagingInvalid {
            reason: "staging area is not marked complete".into(),
        });
    }

    remove_dir_if_exists(&rollback)?;
    let had_active = active.exists();
    if had_active {
        rename_durable(&active, &rollback)?;
    }
    crash_check(hook, CrashPoint::ActiveMovedAside)?;

    if let Err(e) = rename_durable(&staging, &active) {
        if had_active && let Err(undo) = rename_durable(&rollback, &active) {
            error!(error = %undo, "could not move previous data back after failed commit");
        }
        return Err(e);
    }
    crash_check(hook, CrashPoint::StagingPromoted)?;

    drop_rollback(data);
    let elapsed = started.elapsed();
    let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    if elapsed > deadline {
        warn!(duration_ms, deadline_ms = deadline.as_millis() as u64, "commit exceeded its deadline");
    } else {
        info!(duration_ms, "restore committed");
    }
    Ok(())
}

/// Remove the rollback copy and the commit sentinel once new data is active.
///
/// Failures are logged only: the new data is already in place, and a stale
/// rollback copy is removed before the next commit.
pub(crate) fn drop_rollback(data: &DataDir) {
    for result in [
        remove_dir_if_exists(&data.rollback()),
        remove_file_if_exists(&data.staging_complete()),
        remove_dir_if_exists(&data.work()),
    ] {
        if let Err(e) = result {
            warn!(error = %e, "could not clean up after commit");
        }
    }
}

/// Put the previous active data back and discard the staging workspace.
pub(crate) fn roll_back(data: &DataDir) -> Result<()> {
    let active = data.active();
    let rollback = data.rollback();
    if rollback.exists() {
        // anything at `active` now is promoted staging
        remove_dir_if_exists(&active)?;
        rename_durable(&rollback, &active)?;
        info!("previous data restored from rollback copy");
    }
    discard_workspace(data)
}

/// Remove staging, work directory and sentinel. Active data is not touched.
pub(crate) fn discard_workspace(data: &DataDir) -> Result<()> {
    remove_file_if_exists(&data.staging_complete())?;
    remove_dir_if_exists(&data.staging())?;
    remove_dir_if_exists(&data.work())?;
    debug!("restore workspace discarded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn prepare(data: &DataDir) {
        fs::create_dir_all(data.active()).unwrap();
        fs::write(data.active().join("history.jsonl"), b"old").unwrap();
        fs::create_dir_all(data.staging()).unwrap();
        fs::write(data.staging().join("history.jsonl"), b"new").unwrap();
        fs::write(data.staging_complete(), b"session").unwrap();
    }

    #[test]
    fn test_commit_swaps_and_cleans_up() {
        let dir = tempdir().unwrap();
        let data = DataDir::new(dir.path());
        prepare(&data);

        commit(&data, Duration::from_secs(2), None).unwrap();
        assert_eq!(fs::read(data.active().join("history.jsonl")).unwrap(), b"new");
        assert!(!data.staging().exists());
        assert!(!data.rollback().exists());
        assert!(!data.staging_complete().exists());
    }

    #[test]
    fn test_commit_requires_sentinel() {
        let dir = tempdir().unwrap();
        let data = DataDir::new(dir.path());
        prepare(&data);
        fs::remove_file(data.staging_complete()).unwrap();

        let err = commit(&data, Duration::from_secs(2), None).unwrap_err();
        assert!(matches!(err, BackupError::StagingInvalid { .. }));
        assert_eq!(fs::read(data.active().join("history.jsonl")).unwrap(), b"old");
    }

    #[test]
    fn test_simulated_crash_then_roll_back() {
        let dir = tempdir().unwrap();
        let data = DataDir::new(dir.path());
        prepare(&data);

        let hook: CrashHook = Arc::new(|point: CrashPoint| point == CrashPoint::StagingPromoted);
        let err = commit(&data, Duration::from_secs(2), Some(&hook)).unwrap_err();
        assert!(matches!(err, BackupError::SimulatedCrash { .. }));
        assert!(data.rollback().exists());

        roll_back(&data).unwrap();
        assert_eq!(fs::read(data.active().join("history.jsonl")).unwrap(), b"old");
        assert!(!data.rollback().exists());
        assert!(!data.staging().exists());
    }

    #[test]
    fn test_commit_without_previous_active() {
        let dir = tempdir().unwrap();
        let data = DataDir::new(dir.path());
        prepare(&data);
        fs::remove_dir_all(data.active()).unwrap();

        commit(&data, Duration::from_secs(2), None).unwrap();
        assert_eq!(fs::read(data.active().join("history.jsonl")).unwrap(), b"new");
    }
}
