//! Backup manifest.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::version::FormatVersion;

/// Fixed entry paths inside a backup archive.
pub mod paths {
    /// Manifest entry.
    pub const MANIFEST: &str = "manifest.json";
    /// Checksum set entry.
    pub const CHECKSUMS: &str = "checksums.sha256";
    /// History payload (JSON Lines).
    pub const HISTORY: &str = "history/history.jsonl";
    /// Dictionary payload.
    pub const DICTIONARY: &str = "dictionary/dictionary.json";
    /// Settings payload.
    pub const SETTINGS: &str = "settings/settings.json";
    /// Informational stats snapshot; never imported.
    pub const STATS_SNAPSHOT: &str = "stats/stats_snapshot.json";
    /// Directory prefix for recordings.
    pub const RECORDINGS_PREFIX: &str = "recordings/";

    /// Payload entries every archive must contain.
    pub const REQUIRED: [&str; 5] = [MANIFEST, CHECKSUMS, HISTORY, DICTIONARY, SETTINGS];

    /// Build the archive path for a recording file name.
    #[must_use]
    pub fn recording(file_name: &str) -> String {
        format!("{RECORDINGS_PREFIX}{file_name}")
    }
}

/// Export scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// History, dictionary, settings and every referenced recording.
    #[default]
    Full,
    /// Everything except recordings.
    Lightweight,
}

impl Scope {
    /// Get a human-readable label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Lightweight => "lightweight",
        }
    }

    /// Whether recordings are part of this scope.
    #[must_use]
    pub const fn includes_recordings(&self) -> bool {
        matches!(self, Self::Full)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Payload component carried by an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    /// Transcript history rows.
    History,
    /// Learned-word dictionary.
    Dictionary,
    /// Allow-listed user settings.
    Settings,
    /// Audio recordings.
    Recordings,
}

impl ComponentKind {
    /// All components in archive order.
    pub const ALL: [ComponentKind; 4] = [
        Self::History,
        Self::Dictionary,
        Self::Settings,
        Self::Recordings,
    ];

    /// Get a human-readable label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::History => "history",
            Self::Dictionary => "dictionary",
            Self::Settings => "settings",
            Self::Recordings => "recordings",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-component version and item count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentInfo {
    /// Payload schema version of this component.
    pub payload_version: u32,
    /// Number of items written.
    pub count: u64,
}

/// Archive manifest.
///
/// Built exclusively by the exporter; restore never infers these values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Backup format version (`major.minor`).
    pub backup_format_version: FormatVersion,
    /// Application version that wrote the archive.
    pub created_with_app_version: String,
    /// When the archive was written.
    pub created_at: DateTime<Utc>,
    /// Whether `recordings/` entries are present.
    pub includes_recordings: bool,
    /// Scope the archive was exported with.
    #[serde(default)]
    pub scope: Scope,
    /// Per-component payload version and count.
    pub components: BTreeMap<ComponentKind, ComponentInfo>,
    /// Non-fatal export findings (e.g. missing recordings).
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl Manifest {
    /// Create a manifest for a new export.
    #[must_use]
    pub fn new(app_version: impl Into<String>, scope: Scope) -> Self {
        Self {
            backup_format_version: FormatVersion::CURRENT,
            created_with_app_version: app_version.into(),
            created_at: Utc::now(),
            includes_recordings: scope.includes_recordings(),
            scope,
            components: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }

    /// Record version and count for a component.
    pub fn set_component(&mut self, kind: ComponentKind, payload_version: u32, count: u64) {
        self.components.insert(
            kind,
            ComponentInfo {
                payload_version,
                count,
            },
        );
    }

    /// Look up a component entry.
    #[must_use]
    pub fn component(&self, kind: ComponentKind) -> Option<&ComponentInfo> {
        self.components.get(&kind)
    }

    /// Payload version for a component, defaulting to 1 for archives that
    /// predate per-component versioning.
    #[must_use]
    pub fn payload_version(&self, kind: ComponentKind) -> u32 {
        self.component(kind).map_or(1, |info| info.payload_version)
    }

    /// Item count for a component (0 when absent).
    #[must_use]
    pub fn count(&self, kind: ComponentKind) -> u64 {
        self.component(kind).map_or(0, |info| info.count)
    }

    /// Add an export warning.
    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }
}

/// Stats snapshot stored alongside the payload for display only.
///
/// Restore ignores it and recomputes from the imported rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Total words across all rows.
    pub total_words: u64,
    /// Total recorded duration.
    pub total_duration_ms: u64,
    /// Number of transcriptions.
    pub total_transcriptions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_manifest_scope() {
        let manifest = Manifest::new("1.4.0", Scope::Lightweight);
        assert!(!manifest.includes_recordings);
        assert_eq!(manifest.backup_format_version, FormatVersion::CURRENT);

        let manifest = Manifest::new("1.4.0", Scope::Full);
        assert!(manifest.includes_recordings);
    }

    #[test]
    fn test_manifest_json_shape() {
        let mut manifest = Manifest::new("1.4.0", Scope::Full);
        manifest.set_component(ComponentKind::History, 3, 12);
        manifest.warn("recording missing: a.wav");

        let value = serde_json::to_value(&manifest).unwrap();
        assert_eq!(value["backup_format_version"], "2.1");
        assert_eq!(value["components"]["history"]["payload_version"], 3);
        assert_eq!(value["components"]["history"]["count"], 12);
        assert_eq!(value["warnings"][0], "recording missing: a.wav");
        assert_eq!(value["scope"], "full");
    }

    #[test]
    fn test_payload_version_defaults_to_one() {
        let manifest = Manifest::new("1.0.0", Scope::Full);
        assert_eq!(manifest.payload_version(ComponentKind::Dictionary), 1);
        assert_eq!(manifest.count(ComponentKind::Dictionary), 0);
    }

    #[test]
    fn test_recording_path() {
        assert_eq!(paths::recording("a.wav"), "recordings/a.wav");
    }
}
