//! Versioned payload rows and adjacent-version migrations.
//!
//! Each payload version is a distinct tagged variant. A row decoded at an old
//! version is migrated one adjacent step at a time until it reaches the
//! current schema. A version with no chain to the current schema is rejected
//! up front by [`migration_path`], before any row is decoded.

use serde::Deserialize;

use crate::dictionary::{DICTIONARY_PAYLOAD_VERSION, DictionaryEntry};
use crate::error::{ModelError, Result};
use crate::history::{HISTORY_PAYLOAD_VERSION, HistoryRecord};
use crate::manifest::ComponentKind;
use crate::settings::SETTINGS_PAYLOAD_VERSION;

/// Oldest payload version with a registered migration chain.
const fn oldest_supported(component: ComponentKind) -> u32 {
    match component {
        ComponentKind::History
        | ComponentKind::Dictionary
        | ComponentKind::Settings
        | ComponentKind::Recordings => 1,
    }
}

/// Current payload version for a component.
#[must_use]
pub const fn current_version(component: ComponentKind) -> u32 {
    match component {
        ComponentKind::History => HISTORY_PAYLOAD_VERSION,
        ComponentKind::Dictionary => DICTIONARY_PAYLOAD_VERSION,
        ComponentKind::Settings => SETTINGS_PAYLOAD_VERSION,
        ComponentKind::Recordings => 1,
    }
}

/// Compute the adjacent steps `(from, to)` needed to reach the current schema.
///
/// Returns an empty path when `from` is already current.
pub fn migration_path(component: ComponentKind, from: u32) -> Result<Vec<(u32, u32)>> {
    let current = current_version(component);
    if from < oldest_supported(component) || from > current {
        return Err(ModelError::MissingMigration {
            component,
            from,
            current,
        });
    }
    Ok((from..current).map(|v| (v, v + 1)).collect())
}

// =============================================================================
// HISTORY
// =============================================================================

/// History row as written by payload version 1.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HistoryRowV1 {
    pub id: i64,
    pub file_name: String,
    pub timestamp: i64,
    #[serde(default)]
    pub saved: bool,
    pub title: String,
    pub transcription_text: String,
}

/// History row as written by payload version 2.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HistoryRowV2 {
    pub id: i64,
    pub file_name: String,
    pub timestamp: i64,
    #[serde(default)]
    pub saved: bool,
    pub title: String,
    pub transcription_text: String,
    #[serde(default)]
    pub post_processed_text: Option<String>,
    #[serde(default)]
    pub post_process_prompt: Option<String>,
}

/// A history row tagged with the payload version it was decoded at.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryRow {
    V1(HistoryRowV1),
    V2(HistoryRowV2),
    V3(HistoryRecord),
}

impl HistoryRow {
    /// Decode one JSON line at the given payload version.
    pub fn decode(version: u32, line: &str) -> Result<Self> {
        let malformed = |e: serde_json::Error| ModelError::malformed(ComponentKind::History, &e);
        match version {
            1 => serde_json::from_str(line).map(Self::V1).map_err(malformed),
            2 => serde_json::from_str(line).map(Self::V2).map_err(malformed),
            3 => serde_json::from_str(line).map(Self::V3).map_err(malformed),
            other => Err(ModelError::MissingMigration {
                component: ComponentKind::History,
                from: other,
                current: HISTORY_PAYLOAD_VERSION,
            }),
        }
    }

    /// Payload version of this variant.
    #[must_use]
    pub const fn version(&self) -> u32 {
        match self {
            Self::V1(_) => 1,
            Self::V2(_) => 2,
            Self::V3(_) => 3,
        }
    }

    /// Apply one adjacent migration step.
    #[must_use]
    pub fn step(self) -> Self {
        match self {
            Self::V1(row) => Self::V2(HistoryRowV2 {
                id: row.id,
                file_name: row.file_name,
                timestamp: row.timestamp,
                saved: row.saved,
                title: row.title,
                transcription_text: row.transcription_text,
                post_processed_text: None,
                post_process_prompt: None,
            }),
            Self::V2(row) => Self::V3(HistoryRecord {
                id: row.id,
                title: row.title,
                transcription_text: row.transcription_text,
                post_processed_text: row.post_processed_text,
                post_process_prompt: row.post_process_prompt,
                timestamp: row.timestamp,
                duration_ms: 0,
                saved: row.saved,
                recording_filename: Some(row.file_name).filter(|name| !name.trim().is_empty()),
            }),
            current @ Self::V3(_) => current,
        }
    }

    /// Migrate to the current schema.
    #[must_use]
    pub fn into_current(self) -> HistoryRecord {
        let mut row = self;
        loop {
            match row {
                Self::V3(record) => return record,
                older => row = older.step(),
            }
        }
    }
}

// =============================================================================
// DICTIONARY
// =============================================================================

/// Dictionary entry as written by payload version 1 (no aliases).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DictionaryEntryV1 {
    pub input: String,
    pub replacement: String,
    #[serde(default)]
    pub is_replacement: bool,
}

/// A dictionary entry tagged with its payload version.
#[derive(Debug, Clone, PartialEq)]
pub enum DictionaryRow {
    V1(DictionaryEntryV1),
    V2(DictionaryEntry),
}

impl DictionaryRow {
    /// Decode one JSON value at the given payload version.
    pub fn decode(version: u32, value: serde_json::Value) -> Result<Self> {
        let malformed = |e: serde_json::Error| ModelError::malformed(ComponentKind::Dictionary, &e);
        match version {
            1 => serde_json::from_value(value).map(Self::V1).map_err(malformed),
            2 => serde_json::from_value(value).map(Self::V2).map_err(malformed),
            other => Err(ModelError::MissingMigration {
                component: ComponentKind::Dictionary,
                from: other,
                current: DICTIONARY_PAYLOAD_VERSION,
            }),
        }
    }

    /// Migrate to the current schema.
    #[must_use]
    pub fn into_current(self) -> DictionaryEntry {
        match self {
            Self::V1(entry) => DictionaryEntry {
                input: entry.input,
                aliases: Vec::new(),
                replacement: entry.replacement,
                is_replacement: entry.is_replacement,
            },
            Self::V2(entry) => entry,
        }
    }
}
