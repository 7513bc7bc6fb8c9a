//! Restore session state machine and its persisted phase marker.
//!
//! ```text
//! Idle -> Preflight -> SafetyBackup -> Quiesce -> StagingImport -> Migrate
//!      -> Validate -> Commit -> Complete
//! ```
//!
//! `RollBack` is reachable from every phase before `Commit` and from `Commit`
//! itself when the swap fails. `Reconcile` is the startup entry point.
//! The marker is written before a phase starts, so after a crash the marker
//! names the phase that may have been interrupted.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{BackupError, Result};
use crate::io::{remove_file_if_exists, write_atomic};
use crate::layout::DataDir;

/// Restore phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Preflight,
    SafetyBackup,
    Quiesce,
    StagingImport,
    Migrate,
    Validate,
    Commit,
    Complete,
    RollBack,
    Reconcile,
}

impl Phase {
    /// Get a human-readable label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Preflight => "preflight",
            Self::SafetyBackup => "safety backup",
            Self::Quiesce => "quiesce",
            Self::StagingImport => "staging import",
            Self::Migrate => "migrate",
            Self::Validate => "validate",
            Self::Commit => "commit",
            Self::Complete => "complete",
            Self::RollBack => "rollback",
            Self::Reconcile => "reconcile",
        }
    }

    /// `Commit` and `RollBack` run to completion regardless of cancellation.
    #[must_use]
    pub const fn is_cancellable(&self) -> bool {
        !matches!(self, Self::Commit | Self::RollBack)
    }

    /// Whether active data may already have been touched in this phase.
    #[must_use]
    pub const fn touches_active(&self) -> bool {
        matches!(self, Self::Commit | Self::Complete | Self::RollBack)
    }

    /// Next phase on the success path.
    #[must_use]
    pub const fn next(&self) -> Option<Self> {
        match self {
            Self::Idle => Some(Self::Preflight),
            Self::Preflight => Some(Self::SafetyBackup),
            Self::SafetyBackup => Some(Self::Quiesce),
            Self::Quiesce => Some(Self::StagingImport),
            Self::StagingImport => Some(Self::Migrate),
            Self::Migrate => Some(Self::Validate),
            Self::Validate => Some(Self::Commit),
            Self::Commit => Some(Self::Complete),
            Self::Complete | Self::RollBack | Self::Reconcile => Some(Self::Idle),
        }
    }

    /// Whether `self -> to` is a legal transition.
    #[must_use]
    pub fn can_transition(&self, to: Self) -> bool {
        if self.next() == Some(to) {
            return true;
        }
        match to {
            Self::RollBack => matches!(
                self,
                Self::Preflight
                    | Self::SafetyBackup
                    | Self::Quiesce
                    | Self::StagingImport
                    | Self::Migrate
                    | Self::Validate
                    | Self::Commit
            ),
            Self::Reconcile => matches!(self, Self::Idle),
            _ => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Durable phase marker at `.restore/session.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMarker {
    /// Session identifier.
    pub session_id: Uuid,
    /// Phase entered most recently.
    pub phase: Phase,
    /// Archive being restored.
    pub archive: PathBuf,
    /// When the session started.
    pub started_at: DateTime<Utc>,
    /// When the marker was last written.
    pub updated_at: DateTime<Utc>,
    /// Safety backup created for this session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_backup: Option<PathBuf>,
}

impl SessionMarker {
    /// Read the marker, if a session was left behind.
    pub fn load(data: &DataDir) -> Result<Option<Self>> {
        let path = data.marker();
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(BackupError::json("decode", "restore session marker")),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BackupError::io("read", path)(e)),
        }
    }

    fn store(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(BackupError::json("encode", "restore session marker"))?;
        write_atomic(path, &bytes)
    }
}

/// A running restore. Owned by the engine for the duration of one restore.
#[derive(Debug)]
pub struct RestoreSession {
    marker: SessionMarker,
    marker_path: PathBuf,
}

impl RestoreSession {
    /// Start a session: `Idle -> Preflight`, persisted.
    pub fn begin(data: &DataDir, archive: &Path) -> Result<Self> {
        let now = Utc::now();
        let marker = SessionMarker {
            session_id: Uuid::new_v4(),
            phase: Phase::Preflight,
            archive: archive.to_path_buf(),
            started_at: now,
            updated_at: now,
            safety_backup: None,
        };
        marker.store(&data.marker())?;
        info!(session = %marker.session_id, "restore session started");
        Ok(Self {
            marker,
            marker_path: data.marker(),
        })
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.marker.session_id
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.marker.phase
    }

    /// Marker snapshot.
    #[must_use]
    pub fn marker(&self) -> &SessionMarker {
        &self.marker
    }

    /// Enter `to`, persisting the marker first.
    pub fn advance(&mut self, to: Phase) -> Result<()> {
        let from = self.marker.phase;
        if !from.can_transition(to) {
            return Err(BackupError::IllegalTransition { from, to });
        }
        let mut next = self.marker.clone();
        next.phase = to;
        next.updated_at = Utc::now();
        next.store(&self.marker_path)?;
        self.marker = next;
        debug!(session = %self.marker.session_id, %from, %to, "restore phase");
        Ok(())
    }

    /// Record the safety backup belonging to this session.
    pub fn set_safety_backup(&mut self, path: PathBuf) -> Result<()> {
        self.marker.safety_backup = Some(path);
        self.marker.updated_at = Utc::now();
        self.marker.store(&self.marker_path)
    }

    /// End the session after `Complete` or `RollBack` and remove the marker.
    pub fn finish(self) -> Result<()> {
        if !matches!(self.marker.phase, Phase::Complete | Phase::RollBack) {
            return Err(BackupError::IllegalTransition {
                from: self.marker.phase,
                to: Phase::Idle,
            });
        }
        remove_file_if_exists(&self.marker_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_success_path_is_legal() {
        let mut phase = Phase::Idle;
        let mut visited = vec![phase];
        while let Some(next) = phase.next() {
            if next == Phase::Idle {
                break;
            }
            assert!(phase.can_transition(next));
            phase = next;
            visited.push(phase);
        }
        assert_eq!(visited.last(), Some(&Phase::Complete));
        assert_eq!(visited.len(), 9);
    }

    #[test]
    fn test_rollback_reachability() {
        for phase in [
            Phase::Preflight,
            Phase::SafetyBackup,
            Phase::Quiesce,
            Phase::StagingImport,
            Phase::Migrate,
            Phase::Validate,
        ] {
            assert!(phase.can_transition(Phase::RollBack), "{phase}");
            assert!(phase.is_cancellable());
        }
        assert!(!Phase::Complete.can_transition(Phase::RollBack));
        assert!(!Phase::Commit.is_cancellable());
        assert!(!Phase::RollBack.is_cancellable());
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        assert!(!Phase::Preflight.can_transition(Phase::Commit));
        assert!(!Phase::Migrate.can_transition(Phase::StagingImport));
        assert!(!Phase::Complete.can_transition(Phase::Commit));
        assert!(Phase::Idle.can_transition(Phase::Reconcile));
    }

    #[test]
    fn test_marker_persisted_per_phase() {
        let dir = tempdir().unwrap();
        let data = DataDir::new(dir.path());
        let mut session = RestoreSession::begin(&data, Path::new("/tmp/a.zip")).unwrap();

        let marker = SessionMarker::load(&data).unwrap().unwrap();
        assert_eq!(marker.phase, Phase::Preflight);

        session.advance(Phase::SafetyBackup).unwrap();
        assert_eq!(
            SessionMarker::load(&data).unwrap().unwrap().phase,
            Phase::SafetyBackup
        );

        let err = session.advance(Phase::Commit).unwrap_err();
        assert!(matches!(err, BackupError::IllegalTransition { .. }));
        assert_eq!(session.phase(), Phase::SafetyBackup);

        session.advance(Phase::RollBack).unwrap();
        session.finish().unwrap();
        assert!(SessionMarker::load(&data).unwrap().is_none());
    }
}
