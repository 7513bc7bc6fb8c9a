//! Operation reports and the durable last-operation record.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use codictate_model::{ComponentKind, Manifest, Scope, StatsSnapshot};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BackupError, ErrorCategory, Result};
use crate::import::ImportCounts;
use crate::io::write_atomic;
use crate::layout::DataDir;
use crate::lock::OperationKind;
use crate::recovery::{Outcome, ReconcileReport};

/// Result of a successful export.
#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub path: PathBuf,
    pub scope: Scope,
    pub size_bytes: u64,
    /// Entries in the archive, manifest and checksums included.
    pub entries: usize,
    pub manifest: Manifest,
    /// Recordings that could not be included, and similar findings.
    pub warnings: Vec<String>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
    /// Interrupted restore resolved before the export started.
    pub recovered: Option<ReconcileReport>,
}

impl ExportReport {
    /// One-line summary with counts.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "Exported {} history entries, {} dictionary words and {} recordings to {}.",
            self.manifest.count(ComponentKind::History),
            self.manifest.count(ComponentKind::Dictionary),
            self.manifest.count(ComponentKind::Recordings),
            self.path.display()
        );
        if !self.warnings.is_empty() {
            summary.push_str(&format!(" {} warning(s).", self.warnings.len()));
        }
        summary
    }
}

/// Result of a successful restore.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub session_id: Uuid,
    pub archive: PathBuf,
    /// Safety backup taken before the restore.
    pub safety_backup: Option<PathBuf>,
    /// Whether the safety backup still exists.
    pub safety_backup_kept: bool,
    /// Whether the safety backup lacks recordings.
    pub safety_backup_lightweight: bool,
    pub counts: ImportCounts,
    /// Stats recomputed from the restored history.
    pub stats: StatsSnapshot,
    /// Concise warnings for the summary view.
    pub warnings: Vec<String>,
    /// Per-item diagnostics, shown on demand.
    pub details: Vec<String>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Interrupted restore resolved before this one started.
    pub recovered: Option<ReconcileReport>,
}

impl RestoreReport {
    /// One-line summary with counts.
    #[must_use]
    pub fn summary(&self) -> String {
        let c = &self.counts;
        let mut summary = format!(
            "Restored {} history entries, {} new dictionary words and {} recordings.",
            c.history_restored, c.dictionary_added, c.recordings_restored
        );
        let skipped = c.history_skipped + c.dictionary_skipped;
        if skipped > 0 {
            summary.push_str(&format!(" {skipped} item(s) skipped."));
        }
        if c.recordings_missing > 0 {
            summary.push_str(&format!(" {} recording(s) missing.", c.recordings_missing));
        }
        summary
    }
}

/// Durable outcome of the most recent operation.
///
/// Written to `last_operation.json` so the outcome stays observable after the
/// caller that started the operation has gone away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastOperation {
    pub kind: OperationKind,
    pub success: bool,
    pub finished_at: DateTime<Utc>,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ErrorCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
}

impl LastOperation {
    pub fn succeeded(kind: OperationKind, summary: impl Into<String>) -> Self {
        Self {
            kind,
            success: true,
            finished_at: Utc::now(),
            summary: summary.into(),
            category: None,
            guidance: None,
        }
    }

    pub fn failed(kind: OperationKind, error: &BackupError) -> Self {
        Self {
            kind,
            success: false,
            finished_at: Utc::now(),
            summary: error.user_message(),
            category: Some(error.category()),
            guidance: error.suggestion(),
        }
    }

    pub fn reconciled(report: &ReconcileReport) -> Self {
        Self {
            kind: OperationKind::Recovery,
            success: report.outcome == Outcome::Restored,
            finished_at: report.resolved_at,
            summary: report.guidance.clone(),
            category: None,
            guidance: (report.outcome == Outcome::RolledBack)
                .then(|| "Start the restore again if you still need it.".to_string()),
        }
    }

    pub fn write(&self, data: &DataDir) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(BackupError::json("encode", "last operation record"))?;
        write_atomic(&data.last_operation(), &bytes)
    }

    pub fn read(data: &DataDir) -> Result<Option<Self>> {
        let path = data.last_operation();
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(BackupError::json("decode", "last operation record")),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BackupError::io("read", path)(e)),
        }
    }
}
