//! Archive schemas for Codictate backups.
//!
//! This crate owns every type that is written into or read out of a backup
//! archive: the manifest, the versioned payload records, and the settings
//! allow-list. It performs no I/O.
//!
//! # Archive Layout
//!
//! ```text
//! manifest.json
//! checksums.sha256
//! history/history.jsonl
//! dictionary/dictionary.json
//! settings/settings.json
//! stats/stats_snapshot.json
//! recordings/<file>          (full scope only)
//! ```
//!
//! # Versioning
//!
//! The manifest carries a `major.minor` backup format version. The major
//! version defines the compatibility window (current and previous major are
//! accepted). Each payload component additionally carries its own
//! `payload_version`; older payloads are decoded into tagged variants and
//! migrated one adjacent step at a time (see [`migrate`]).

pub mod dictionary;
pub mod error;
pub mod history;
pub mod manifest;
pub mod migrate;
pub mod names;
pub mod settings;
pub mod version;

pub use dictionary::{DICTIONARY_PAYLOAD_VERSION, DictionaryEntry};
pub use error::{ModelError, Result};
pub use history::{HISTORY_PAYLOAD_VERSION, HistoryRecord};
pub use manifest::{
    ComponentInfo, ComponentKind, Manifest, Scope, StatsSnapshot, paths,
};
pub use migrate::{DictionaryRow, HistoryRow, current_version, migration_path};
pub use names::{collision_key, normalize_name};
pub use settings::{SETTINGS_ALLOW_LIST, SETTINGS_PAYLOAD_VERSION, SettingsMerge, SettingsPayload};
pub use version::FormatVersion;
