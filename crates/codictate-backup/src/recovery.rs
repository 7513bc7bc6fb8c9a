//! Startup reconciliation of an interrupted restore.
//!
//! [`decide`] maps the persisted phase and the directories found on disk to
//! one [`Resolution`]; [`reconcile`] executes it. Running reconciliation twice
//! is a no-op the second time because the marker is removed last.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::commit::{commit, discard_workspace, drop_rollback, roll_back};
use crate::error::{BackupError, Result};
use crate::io::{remove_dir_if_exists, remove_file_if_exists, rename_durable, write_atomic};
use crate::layout::DataDir;
use crate::session::{Phase, SessionMarker};

/// Which restore directories exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Presence {
    pub active: bool,
    pub staging: bool,
    pub rollback: bool,
    /// The staging-complete sentinel.
    pub staging_complete: bool,
}

impl Presence {
    /// Inspect the data root.
    #[must_use]
    pub fn probe(data: &DataDir) -> Self {
        Self {
            active: data.active().is_dir(),
            staging: data.staging().is_dir(),
            rollback: data.rollback().is_dir(),
            staging_complete: data.staging_complete().is_file(),
        }
    }
}

/// Step taken to reach a consistent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Remove staging and work files; active data is kept (a stale rollback
    /// copy is dropped too).
    DiscardStaging,
    /// Move the rollback copy back to active.
    RestoreRollback,
    /// Run the commit swap again from the start.
    ReplayCommit,
    /// Finish an interrupted swap by promoting staging.
    PromoteStaging,
    /// The swap finished; only the rollback copy is left.
    DropRollback,
    /// Nothing on disk needs changing.
    Nothing,
}

/// Which data is active after reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Pre-restore data is intact.
    RolledBack,
    /// The restored data is fully in place.
    Restored,
}

/// Result of [`decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub action: Action,
    pub outcome: Outcome,
}

impl Resolution {
    const fn new(action: Action, outcome: Outcome) -> Self {
        Self { action, outcome }
    }
}

/// Decide how to resolve a session interrupted in `phase`.
#[must_use]
pub fn decide(phase: Phase, presence: Presence) -> Resolution {
    use Action::{DiscardStaging, DropRollback, Nothing, PromoteStaging, ReplayCommit, RestoreRollback};
    use Outcome::{Restored, RolledBack};

    let Presence {
        active,
        staging,
        rollback,
        staging_complete: complete,
    } = presence;

    match phase {
        Phase::Commit => match (active, staging, rollback) {
            (true, false, true) => Resolution::new(DropRollback, Restored),
            (true, true, _) if complete => Resolution::new(ReplayCommit, Restored),
            (true, true, _) => Resolution::new(DiscardStaging, RolledBack),
            (false, true, true) if complete => Resolution::new(PromoteStaging, Restored),
            (false, true, true) => Resolution::new(RestoreRollback, RolledBack),
            (false, true, false) if complete => Resolution::new(PromoteStaging, Restored),
            (false, true, false) => Resolution::new(DiscardStaging, RolledBack),
            (true, false, false) => Resolution::new(Nothing, Restored),
            (false, false, true) => Resolution::new(RestoreRollback, RolledBack),
            (false, false, false) => Resolution::new(Nothing, RolledBack),
        },
        Phase::Complete => {
            if rollback {
                Resolution::new(DropRollback, Restored)
            } else {
                Resolution::new(Nothing, Restored)
            }
        }
        Phase::RollBack => {
            if rollback {
                Resolution::new(RestoreRollback, RolledBack)
            } else {
                Resolution::new(DiscardStaging, RolledBack)
            }
        }
        _ => {
            if rollback && !active {
                Resolution::new(RestoreRollback, RolledBack)
            } else {
                Resolution::new(DiscardStaging, RolledBack)
            }
        }
    }
}

/// Outcome of reconciling one interrupted session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub session_id: Uuid,
    /// Phase the marker recorded when the process stopped.
    pub interrupted_phase: Phase,
    pub archive: PathBuf,
    pub action: Action,
    pub outcome: Outcome,
    pub resolved_at: DateTime<Utc>,
    /// Safety backup taken for the interrupted session, if any.
    pub safety_backup: Option<PathBuf>,
    /// Next step for the user.
    pub guidance: String,
}

impl ReconcileReport {
    pub fn write(&self, data: &DataDir) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(BackupError::json("encode", "recovery record"))?;
        write_atomic(&data.last_recovery(), &bytes)
    }

    pub fn read(data: &DataDir) -> Result<Option<Self>> {
        let path = data.last_recovery();
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(BackupError::json("decode", "recovery record")),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BackupError::io("read", path)(e)),
        }
    }
}

fn guidance(outcome: Outcome, phase: Phase, safety_backup: Option<&PathBuf>) -> String {
    match (outcome, safety_backup) {
        (Outcome::Restored, Some(backup)) => format!(
            "A restore interrupted during {phase} was completed. Your previous data is in the safety backup {}.",
            backup.display()
        ),
        (Outcome::Restored, None) => {
            format!("A restore interrupted during {phase} was completed.")
        }
        (Outcome::RolledBack, _) => format!(
            "A restore was interrupted during {phase}. Your data was left as it was before; start the restore again if you still need it."
        ),
    }
}

fn execute(data: &DataDir, action: Action, deadline: Duration) -> Result<()> {
    match action {
        Action::DiscardStaging => {
            discard_workspace(data)?;
            if data.active().is_dir() {
                remove_dir_if_exists(&data.rollback())?;
            }
            Ok(())
        }
        Action::RestoreRollback => roll_back(data),
        Action::ReplayCommit => commit(data, deadline, None),
        Action::PromoteStaging => {
            rename_durable(&data.staging(), &data.active())?;
            drop_rollback(data);
            Ok(())
        }
        Action::DropRollback => {
            drop_rollback(data);
            discard_workspace(data)
        }
        Action::Nothing => discard_workspace(data),
    }
}

/// Resolve a leftover session, if there is one.
///
/// Without a marker, stray workspace directories are cleaned up and `None`
/// is returned.
pub fn reconcile(data: &DataDir, deadline: Duration) -> Result<Option<ReconcileReport>> {
    let Some(marker) = SessionMarker::load(data)? else {
        let presence = Presence::probe(data);
        if presence.staging || presence.rollback || data.work().exists() {
            warn!("restore workspace without session marker, cleaning up");
            if presence.rollback && !presence.active {
                roll_back(data)?;
            } else {
                execute(data, Action::DiscardStaging, deadline)?;
            }
        }
        return Ok(None);
    };

    let presence = Presence::probe(data);
    let resolution = decide(marker.phase, presence);
    info!(
        session = %marker.session_id,
        phase = %marker.phase,
        action = ?resolution.action,
        outcome = ?resolution.outcome,
        "reconciling interrupted restore"
    );
    execute(data, resolution.action, deadline)?;
    remove_file_if_exists(&data.marker())?;

    Ok(Some(ReconcileReport {
        session_id: marker.session_id,
        interrupted_phase: marker.phase,
        archive: marker.archive,
        action: resolution.action,
        outcome: resolution.outcome,
        resolved_at: Utc::now(),
        guidance: guidance(resolution.outcome, marker.phase, marker.safety_backup.as_ref()),
        safety_backup: marker.safety_backup,
    }))
}
