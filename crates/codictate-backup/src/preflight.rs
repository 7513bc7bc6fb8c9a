//! Read-only archive validation.
//!
//! Preflight never writes anything. It runs in this order and stops at the
//! first stage that produced a blocking finding:
//!
//! 1. entry metadata (names, types, sizes, compression ratios)
//! 2. required entries, manifest version window and migration paths
//! 3. checksum coverage and hash verification
//! 4. history line scan (line bounds, decodability)
//! 5. free space for unpack, staging and rollback
//!
//! Stage 1 reads only the central directory, so an archive with a traversal
//! entry or a zip bomb is rejected before any content is inflated.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use codictate_model::{
    ComponentKind, FormatVersion, HistoryRecord, HistoryRow, Manifest, migration_path, paths,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::archive::{self, Archive, EntryMeta};
use crate::checksum::{BUFFER_SIZE, ChecksumSet};
use crate::config::{SoftLimits, hard};
use crate::error::{BackupError, Result};
use crate::export::snapshot::is_plain_file_name;
use crate::io::{Line, dir_size, read_bounded_line};
use crate::layout::DataDir;
use crate::progress::{CancellationToken, ProgressTracker, Stage, StatusBoard};
use crate::session::Phase;
use crate::volume::VolumeProbe;

const STAGE: Stage = Stage::Restore(Phase::Preflight);

/// How a finding affects the restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// The restore cannot proceed.
    Blocking,
    /// The restore may proceed after the caller confirms.
    Recoverable,
}

/// One preflight finding.
#[derive(Debug)]
pub struct Finding {
    pub severity: Severity,
    pub error: BackupError,
}

/// Outcome of validating one archive.
#[derive(Debug)]
pub struct PreflightReport {
    /// Archive that was validated.
    pub archive: PathBuf,
    /// Parsed manifest, once it could be read.
    pub manifest: Option<Manifest>,
    /// Findings in discovery order.
    pub findings: Vec<Finding>,
    /// Entries in the archive (directories included).
    pub entry_count: u64,
    /// Sum of declared uncompressed entry sizes.
    pub total_uncompressed: u64,
    /// Free space the restore needs under the data root.
    pub required_space: u64,
    /// Free space found, when it could be queried.
    pub available_space: Option<u64>,
    /// Non-empty history lines.
    pub history_rows: u64,
    /// History lines that will be skipped.
    pub skipped_rows: u64,
    /// Longest history line seen, in bytes.
    pub longest_line: u64,
    pub(crate) checksums: ChecksumSet,
    pub(crate) entries: Vec<EntryMeta>,
}

impl PreflightReport {
    fn new(archive: &Path) -> Self {
        Self {
            archive: archive.to_path_buf(),
            manifest: None,
            findings: Vec::new(),
            entry_count: 0,
            total_uncompressed: 0,
            required_space: 0,
            available_space: None,
            history_rows: 0,
            skipped_rows: 0,
            longest_line: 0,
            checksums: ChecksumSet::new(),
            entries: Vec::new(),
        }
    }

    fn block(&mut self, error: BackupError) {
        debug!(category = %error.category(), "blocking finding: {error}");
        self.findings.push(Finding {
            severity: Severity::Blocking,
            error,
        });
    }

    fn recover(&mut self, error: BackupError) {
        debug!(category = %error.category(), "recoverable finding: {error}");
        self.findings.push(Finding {
            severity: Severity::Recoverable,
            error,
        });
    }

    /// Move an error into the findings; cancellation still propagates.
    fn absorb<T>(&mut self, result: Result<T>) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e @ BackupError::Cancelled { .. }) => Err(e),
            Err(e) => {
                self.block(e);
                Ok(None)
            }
        }
    }

    /// Whether any finding blocks the restore.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        self.findings
            .iter()
            .any(|f| f.severity == Severity::Blocking)
    }

    /// Whether the archive passed without any finding.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    /// Blocking findings.
    pub fn blocking(&self) -> impl Iterator<Item = &BackupError> {
        self.with_severity(Severity::Blocking)
    }

    /// Recoverable findings.
    pub fn recoverable(&self) -> impl Iterator<Item = &BackupError> {
        self.with_severity(Severity::Recoverable)
    }

    fn with_severity(&self, severity: Severity) -> impl Iterator<Item = &BackupError> {
        self.findings
            .iter()
            .filter(move |f| f.severity == severity)
            .map(|f| &f.error)
    }

    /// Whether raising the soft limits would clear a recoverable finding.
    #[must_use]
    pub fn exceeds_soft_limits(&self) -> bool {
        self.recoverable().any(|e| match e {
            BackupError::SoftLimitExceeded { .. } => true,
            BackupError::SkippedRows { oversized, .. } => *oversized > 0,
            _ => false,
        })
    }

    /// `Err` with the first blocking finding, or the report itself.
    pub fn into_result(mut self) -> Result<Self> {
        match self
            .findings
            .iter()
            .position(|f| f.severity == Severity::Blocking)
        {
            Some(index) => Err(self.findings.swap_remove(index).error),
            None => Ok(self),
        }
    }

    /// First blocking finding, consuming the report.
    #[must_use]
    pub fn into_blocking_error(self) -> Option<BackupError> {
        self.findings
            .into_iter()
            .find(|f| f.severity == Severity::Blocking)
            .map(|f| f.error)
    }
}

/// Result of scanning the history payload line by line.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct HistoryScan {
    pub(crate) rows: u64,
    pub(crate) oversized: u64,
    pub(crate) malformed: u64,
    pub(crate) longest_line: u64,
    /// Per-line diagnostics (line numbers and decoder categories only).
    pub(crate) details: Vec<String>,
}

impl HistoryScan {
    pub(crate) fn skipped(&self) -> u64 {
        self.oversized + self.malformed
    }

    pub(crate) fn skipped_error(&self) -> Option<BackupError> {
        (self.skipped() > 0).then(|| BackupError::SkippedRows {
            count: self.skipped(),
            oversized: self.oversized,
            malformed: self.malformed,
        })
    }
}

/// Decode history lines at `version`, handing each valid row to `accept`.
///
/// Lines above `soft_max` or that fail to decode are skipped and counted.
/// A line above the hard bound fails the whole scan.
pub(crate) fn scan_history<R: BufRead>(
    reader: &mut R,
    version: u32,
    soft_max: u64,
    cancel: &CancellationToken,
    stage: Stage,
    mut accept: impl FnMut(HistoryRecord),
) -> Result<HistoryScan> {
    let mut scan = HistoryScan::default();
    let mut buf = Vec::new();
    let mut line_number = 0_u64;

    loop {
        cancel.check(stage)?;
        let line = read_bounded_line(reader, &mut buf, hard::MAX_HISTORY_LINE_BYTES).map_err(|e| {
            BackupError::InvalidArchive {
                reason: format!("{}: {e}", paths::HISTORY),
            }
        })?;
        line_number += 1;
        match line {
            Line::Eof => break,
            Line::TooLong { length } => {
                return Err(BackupError::HardLimitExceeded {
                    limit: "history line length",
                    actual: length,
                    max: hard::MAX_HISTORY_LINE_BYTES,
                });
            }
            Line::Complete => {}
        }
        if buf.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        scan.rows += 1;
        let length = buf.len() as u64;
        scan.longest_line = scan.longest_line.max(length);
        if length > soft_max {
            scan.oversized += 1;
            scan.details
                .push(format!("history line {line_number}: {length} bytes exceeds the row limit"));
            continue;
        }

        let decoded = std::str::from_utf8(&buf)
            .map_err(|_| "not valid UTF-8".to_string())
            .and_then(|text| HistoryRow::decode(version, text).map_err(|e| e.to_string()));
        match decoded {
            Ok(row) => accept(row.into_current()),
            Err(reason) => {
                scan.malformed += 1;
                scan.details.push(format!("history line {line_number}: {reason}"));
            }
        }
    }
    Ok(scan)
}

/// Inputs shared by one preflight run.
pub(crate) struct Preflight<'a> {
    pub(crate) limits: &'a SoftLimits,
    pub(crate) disk_margin_bytes: u64,
    pub(crate) data: &'a DataDir,
    pub(crate) probe: &'a dyn VolumeProbe,
    pub(crate) cancel: &'a CancellationToken,
    pub(crate) board: &'a StatusBoard,
}

impl Preflight<'_> {
    /// Validate `archive_path`.
    ///
    /// Returns `Err` only for cancellation; every problem with the archive
    /// itself becomes a finding.
    pub(crate) fn run(&self, archive_path: &Path) -> Result<PreflightReport> {
        let mut report = PreflightReport::new(archive_path);
        let Some(mut archive) = report.absorb(archive::open(archive_path))? else {
            return Ok(report);
        };
        self.cancel.check(STAGE)?;

        if archive.len() as u64 > hard::MAX_ENTRIES {
            report.entry_count = archive.len() as u64;
            report.block(BackupError::HardLimitExceeded {
                limit: "entry count",
                actual: archive.len() as u64,
                max: hard::MAX_ENTRIES,
            });
            return Ok(report);
        }
        let Some(entries) = report.absorb(archive::list(&mut archive, archive_path))? else {
            return Ok(report);
        };

        self.check_metadata(&entries, &mut report);
        if !report.is_blocking() {
            self.check_content(&mut archive, &entries, &mut report)?;
        }
        if !report.is_blocking() {
            self.check_space(&mut report);
        }
        report.entries = entries;

        info!(
            archive = %archive_path.display(),
            entries = report.entry_count,
            total_bytes = report.total_uncompressed,
            blocking = report.blocking().count(),
            recoverable = report.recoverable().count(),
            "preflight finished"
        );
        Ok(report)
    }

    fn check_metadata(&self, entries: &[EntryMeta], report: &mut PreflightReport) {
        let mut seen = BTreeSet::new();
        let mut total = 0_u64;

        for entry in entries {
            if let Some(reason) = unsafe_name(&entry.raw_name).or_else(|| entry.unsafe_type()) {
                report.block(BackupError::UnsafeEntry {
                    path: entry.raw_name.clone(),
                    reason,
                });
                continue;
            }
            if !seen.insert(entry.name.as_str()) {
                report.block(BackupError::UnsafeEntry {
                    path: entry.raw_name.clone(),
                    reason: "duplicate entry name",
                });
                continue;
            }
            if entry.is_dir {
                continue;
            }
            if let Some(name) = entry.name.strip_prefix(paths::RECORDINGS_PREFIX)
                && !is_plain_file_name(name)
            {
                report.block(BackupError::UnsafeEntry {
                    path: entry.raw_name.clone(),
                    reason: "nested recording path",
                });
                continue;
            }

            if entry.size > hard::MAX_ENTRY_BYTES {
                report.block(BackupError::HardLimitExceeded {
                    limit: "entry size",
                    actual: entry.size,
                    max: hard::MAX_ENTRY_BYTES,
                });
            }
            if entry.size > hard::RATIO_CHECK_MIN_BYTES {
                let ratio = entry.compression_ratio().unwrap_or(u64::MAX);
                if ratio > hard::MAX_COMPRESSION_RATIO {
                    report.block(BackupError::HardLimitExceeded {
                        limit: "compression ratio",
                        actual: ratio,
                        max: hard::MAX_COMPRESSION_RATIO,
                    });
                }
            }
            if let Some((limit, max)) = document_limit(&entry.name)
                && entry.size > max
            {
                report.block(BackupError::HardLimitExceeded {
                    limit,
                    actual: entry.size,
                    max,
                });
            }
            total = total.saturating_add(entry.size);
        }

        report.entry_count = entries.len() as u64;
        report.total_uncompressed = total;

        if total > hard::MAX_TOTAL_BYTES {
            report.block(BackupError::HardLimitExceeded {
                limit: "total size",
                actual: total,
                max: hard::MAX_TOTAL_BYTES,
            });
        }
        if report.entry_count > self.limits.max_entries {
            report.recover(BackupError::SoftLimitExceeded {
                limit: "entry count",
                actual: report.entry_count,
                max: self.limits.max_entries,
            });
        }
        if total > self.limits.max_total_bytes {
            report.recover(BackupError::SoftLimitExceeded {
                limit: "total size",
                actual: total,
                max: self.limits.max_total_bytes,
            });
        }
    }

    fn check_content(
        &self,
        archive: &mut Archive,
        entries: &[EntryMeta],
        report: &mut PreflightReport,
    ) -> Result<()> {
        let path = report.archive.clone();
        let files: BTreeMap<&str, &EntryMeta> = entries
            .iter()
            .filter(|e| !e.is_dir)
            .map(|e| (e.name.as_str(), e))
            .collect();

        for required in paths::REQUIRED {
            if !files.contains_key(required) {
                report.block(BackupError::MissingEntry {
                    path: required.to_string(),
                });
            }
        }
        if report.is_blocking() {
            return Ok(());
        }

        let manifest = report.absorb(read_manifest(archive, files[paths::MANIFEST], &path))?;
        let checksums = report.absorb(read_checksums(archive, files[paths::CHECKSUMS], &path))?;
        let (Some(manifest), Some(checksums)) = (manifest, checksums) else {
            return Ok(());
        };

        for kind in ComponentKind::ALL {
            if kind == ComponentKind::Recordings && !manifest.includes_recordings {
                continue;
            }
            if let Err(e) = migration_path(kind, manifest.payload_version(kind)) {
                report.block(e.into());
            }
        }

        for (name, entry) in &files {
            if *name == paths::MANIFEST || *name == paths::CHECKSUMS {
                continue;
            }
            if !checksums.contains(name) {
                report.block(BackupError::UnlistedEntry {
                    path: entry.raw_name.clone(),
                });
            }
        }
        for (listed, _) in checksums.iter() {
            if !files.contains_key(listed) {
                report.block(BackupError::MissingEntry {
                    path: listed.to_string(),
                });
            }
        }
        if report.is_blocking() {
            report.manifest = Some(manifest);
            return Ok(());
        }

        let mut tracker = ProgressTracker::new(self.board, STAGE, report.total_uncompressed);
        for (listed, expected) in checksums.iter() {
            let entry = files[listed];
            let hashed = archive::hash_entry(archive, entry, &path, self.cancel, STAGE, &mut tracker);
            if let Some(actual) = report.absorb(hashed)?
                && actual != expected
            {
                report.block(BackupError::ChecksumMismatch {
                    path: listed.to_string(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        if !report.is_blocking() {
            let entry = files[paths::HISTORY];
            let version = manifest.payload_version(ComponentKind::History);
            let scanned = archive
                .by_index(entry.index)
                .map_err(BackupError::zip(&path))
                .and_then(|file| {
                    let mut reader = BufReader::with_capacity(BUFFER_SIZE, file.take(entry.size));
                    scan_history(
                        &mut reader,
                        version,
                        self.limits.max_history_line_bytes,
                        self.cancel,
                        STAGE,
                        |_| {},
                    )
                });
            if let Some(scan) = report.absorb(scanned)? {
                report.history_rows = scan.rows;
                report.skipped_rows = scan.skipped();
                report.longest_line = scan.longest_line;
                if let Some(skipped) = scan.skipped_error() {
                    report.recover(skipped);
                }
            }
        }
        tracker.finish();

        report.manifest = Some(manifest);
        report.checksums = checksums;
        Ok(())
    }

    fn check_space(&self, report: &mut PreflightReport) {
        let root = self.data.root();
        let active = match dir_size(&self.data.active()) {
            Ok(size) => size,
            Err(e) => {
                report.block(e);
                return;
            }
        };
        let required = report
            .total_uncompressed
            .saturating_mul(2)
            .saturating_add(active)
            .saturating_add(self.disk_margin_bytes);
        report.required_space = required;

        match self.probe.available_space(root) {
            Ok(available) => {
                report.available_space = Some(available);
                if available < required {
                    report.block(BackupError::InsufficientSpace {
                        path: root.to_path_buf(),
                        required,
                        available,
                    });
                }
            }
            Err(e) => report.block(BackupError::io("query free space at", root)(e)),
        }
    }
}

fn read_manifest(archive: &mut Archive, entry: &EntryMeta, path: &Path) -> Result<Manifest> {
    let bytes = archive::read_to_vec(archive, entry, path)?;
    let invalid = |reason: String| BackupError::InvalidManifest {
        entry: "manifest",
        reason,
    };

    // Check the version window first, so a future layout is reported as
    // unsupported rather than unreadable.
    let value: serde_json::Value =
        serde_json::from_slice(&bytes).map_err(|e| invalid(e.to_string()))?;
    let version: FormatVersion = value
        .get("backup_format_version")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| invalid("missing backup_format_version".into()))?
        .parse()?;
    version.ensure_supported()?;

    serde_json::from_value(value).map_err(|e| invalid(e.to_string()))
}

fn read_checksums(archive: &mut Archive, entry: &EntryMeta, path: &Path) -> Result<ChecksumSet> {
    let bytes = archive::read_to_vec(archive, entry, path)?;
    let text = String::from_utf8(bytes).map_err(|_| BackupError::InvalidManifest {
        entry: "checksum list",
        reason: "not valid UTF-8".into(),
    })?;
    ChecksumSet::parse(&text)
}

/// Reason an entry name is unsafe to extract, if any.
pub(crate) fn unsafe_name(name: &str) -> Option<&'static str> {
    if name.is_empty() {
        return Some("empty name");
    }
    if name.contains('\0') {
        return Some("NUL byte in name");
    }
    if name.contains('\\') {
        return Some("backslash separator");
    }
    if name.starts_with('/') {
        return Some("absolute path");
    }
    if name.contains(':') {
        return Some("drive prefix");
    }
    let trimmed = name.strip_suffix('/').unwrap_or(name);
    for component in trimmed.split('/') {
        match component {
            ".." => return Some("parent directory traversal"),
            "" | "." => return Some("non-canonical path"),
            _ => {}
        }
    }
    None
}

fn document_limit(name: &str) -> Option<(&'static str, u64)> {
    match name {
        paths::MANIFEST => Some(("manifest size", hard::MAX_MANIFEST_BYTES)),
        paths::CHECKSUMS => Some(("checksum list size", hard::MAX_CHECKSUMS_BYTES)),
        paths::DICTIONARY | paths::SETTINGS | paths::STATS_SNAPSHOT => {
            Some(("document size", hard::MAX_DOCUMENT_BYTES))
        }
        _ => None,
    }
}
