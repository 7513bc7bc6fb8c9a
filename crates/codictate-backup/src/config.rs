//! Engine configuration.
//!
//! Soft limits, safety-backup retention and timeouts live in
//! `<data_root>/backup.toml`. Hard limits are constants in [`hard`] and are
//! never read from configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BackupError, Result};
use crate::io::write_atomic;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Non-overridable security ceilings applied to every archive.
pub mod hard {
    use super::{GIB, KIB, MIB};

    /// Maximum number of entries in one archive.
    pub const MAX_ENTRIES: u64 = 100_000;
    /// Maximum uncompressed size of one entry.
    pub const MAX_ENTRY_BYTES: u64 = 8 * GIB;
    /// Maximum total uncompressed size.
    pub const MAX_TOTAL_BYTES: u64 = 64 * GIB;
    /// Maximum uncompressed/compressed ratio for a single entry.
    pub const MAX_COMPRESSION_RATIO: u64 = 100;
    /// Entries smaller than this are exempt from the ratio check.
    pub const RATIO_CHECK_MIN_BYTES: u64 = MIB;
    /// Maximum size of `manifest.json`.
    pub const MAX_MANIFEST_BYTES: u64 = 256 * KIB;
    /// Maximum size of `checksums.sha256`.
    pub const MAX_CHECKSUMS_BYTES: u64 = 16 * MIB;
    /// Maximum size of the dictionary and settings payloads.
    pub const MAX_DOCUMENT_BYTES: u64 = 64 * MIB;
    /// Maximum length of one history line.
    pub const MAX_HISTORY_LINE_BYTES: u64 = 8 * MIB;
}

/// Engine configuration.
///
/// Serialized to TOML and stored next to the data directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// User-overridable restore thresholds.
    pub limits: SoftLimits,

    /// Safety-backup policy.
    pub safety: SafetyConfig,

    /// Quiesce behaviour.
    pub quiesce: QuiesceConfig,

    /// Restore behaviour.
    pub restore: RestoreConfig,
}

/// Soft thresholds. A restore that exceeds them needs explicit confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftLimits {
    /// Total uncompressed archive size.
    pub max_total_bytes: u64,
    /// Number of archive entries.
    pub max_entries: u64,
    /// History rows longer than this are skipped.
    pub max_history_line_bytes: u64,
}

impl Default for SoftLimits {
    fn default() -> Self {
        Self {
            max_total_bytes: 4 * GIB,
            max_entries: 20_000,
            max_history_line_bytes: MIB,
        }
    }
}

impl SoftLimits {
    /// Clamp every soft limit to its hard ceiling.
    #[must_use]
    pub fn clamped(&self) -> Self {
        Self {
            max_total_bytes: self.max_total_bytes.min(hard::MAX_TOTAL_BYTES),
            max_entries: self.max_entries.min(hard::MAX_ENTRIES),
            max_history_line_bytes: self
                .max_history_line_bytes
                .min(hard::MAX_HISTORY_LINE_BYTES),
        }
    }

    /// Raise limits so that the observed values fit (never above hard ceilings).
    pub fn raise_to_fit(&mut self, total_bytes: u64, entries: u64, longest_line: u64) {
        self.max_total_bytes = self.max_total_bytes.max(total_bytes);
        self.max_entries = self.max_entries.max(entries);
        self.max_history_line_bytes = self.max_history_line_bytes.max(longest_line);
        *self = self.clamped();
    }
}

/// Safety-backup policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Automatic safety backups kept after pruning.
    pub retention: usize,
    /// Upper bound on fallback attempts offered to the caller.
    pub max_attempts: u32,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            retention: 3,
            max_attempts: 5,
        }
    }
}

/// Quiesce behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuiesceConfig {
    /// How long to wait for in-flight writes.
    pub timeout_ms: u64,
}

impl Default for QuiesceConfig {
    fn default() -> Self {
        Self { timeout_ms: 5_000 }
    }
}

/// Restore behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Extra free space required on top of unpack + staging + rollback.
    pub disk_margin_bytes: u64,
    /// Commit swaps slower than this are logged as warnings.
    pub commit_deadline_ms: u64,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            disk_margin_bytes: 64 * MIB,
            commit_deadline_ms: 2_000,
        }
    }
}

impl BackupConfig {
    /// File name of the configuration inside the data root.
    pub const FILE_NAME: &'static str = "backup.toml";

    /// Load configuration; a missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(BackupError::io("read", path)(e)),
        };
        let mut config: Self = toml::from_str(&content).map_err(|e| BackupError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.limits = config.limits.clamped();
        Ok(config)
    }

    /// Save configuration atomically.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| BackupError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        write_atomic(path, content.as_bytes())
    }
}
