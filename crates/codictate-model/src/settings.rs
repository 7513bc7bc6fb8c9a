//! Settings payload and field-by-field merge.
//!
//! Only fields on [`SETTINGS_ALLOW_LIST`] ever leave the machine. Secrets
//! (API keys) and device-specific fields (microphones, output device, model
//! selection) are never exported and never overwritten by a restore.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current settings payload version.
pub const SETTINGS_PAYLOAD_VERSION: u32 = 1;

/// User-configurable settings that are portable between installations.
pub const SETTINGS_ALLOW_LIST: &[&str] = &[
    "bindings",
    "push_to_talk",
    "selected_language",
    "app_language",
    "translate_to_english",
    "overlay_position",
    "paste_method",
    "clipboard_handling",
    "append_trailing_space",
    "auto_submit",
    "auto_submit_key",
    "audio_feedback",
    "audio_feedback_volume",
    "sound_theme",
    "start_hidden",
    "show_tray_icon",
    "autostart_enabled",
    "mute_while_recording",
    "enable_filler_word_filter",
    "enable_hallucination_filter",
    "word_correction_threshold",
    "history_limit",
    "recording_retention_period",
    "post_process_enabled",
    "post_process_prompts",
    "post_process_selected_prompt_id",
    "update_checks_enabled",
];

/// Check whether a settings field is portable.
#[must_use]
pub fn is_allowed(field: &str) -> bool {
    SETTINGS_ALLOW_LIST.contains(&field)
}

/// Allow-listed settings as written to `settings/settings.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SettingsPayload {
    fields: Map<String, Value>,
}

/// Outcome of merging a payload into the current settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsMerge {
    /// Resulting settings object.
    pub merged: Map<String, Value>,
    /// Allow-listed fields taken from the backup.
    pub applied: Vec<String>,
    /// Backup fields dropped because the current schema no longer has them.
    pub dropped: Vec<String>,
}

impl SettingsPayload {
    /// Extract the allow-listed fields from a full settings object.
    #[must_use]
    pub fn from_store(settings: &Map<String, Value>) -> Self {
        let fields = settings
            .iter()
            .filter(|(key, _)| is_allowed(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Self { fields }
    }

    /// Wrap raw fields read from an archive without filtering.
    #[must_use]
    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Number of fields carried.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether no fields are carried.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Read a field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Merge into the current settings object field by field.
    ///
    /// - allow-listed fields present in the payload replace current values
    /// - allow-listed fields absent from the payload keep current values
    /// - payload fields unknown to the current allow-list are dropped
    /// - fields outside the allow-list (secrets, devices) are never touched
    #[must_use]
    pub fn merge_into(&self, current: &Map<String, Value>) -> SettingsMerge {
        let mut merged = current.clone();
        let mut applied = Vec::new();
        let mut dropped = Vec::new();

        for (key, value) in &self.fields {
            if is_allowed(key) {
                merged.insert(key.clone(), value.clone());
                applied.push(key.clone());
            } else {
                dropped.push(key.clone());
            }
        }

        SettingsMerge {
            merged,
            applied,
            dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_from_store_excludes_secrets_and_devices() {
        let store = object(json!({
            "selected_language": "en",
            "bindings": {"transcribe": "ctrl+space"},
            "post_process_api_keys": {"openai": "sk-secret"},
            "selected_microphone": "USB Mic",
            "selected_model": "large-v3",
        }));
        let payload = SettingsPayload::from_store(&store);
        assert_eq!(payload.len(), 2);
        assert!(payload.get("post_process_api_keys").is_none());
        assert!(payload.get("selected_microphone").is_none());
        assert!(payload.get("selected_model").is_none());
    }

    #[test]
    fn test_merge_field_by_field() {
        let current = object(json!({
            "selected_language": "de",
            "paste_method": "ctrl_v",
            "post_process_api_keys": {"openai": "sk-local"},
        }));
        let payload = SettingsPayload::from_fields(object(json!({
            "selected_language": "en",
            "legacy_removed_field": true,
            "post_process_api_keys": {"openai": "sk-from-backup"},
        })));

        let merge = payload.merge_into(&current);

        assert_eq!(merge.merged["selected_language"], "en");
        // absent from backup keeps current
        assert_eq!(merge.merged["paste_method"], "ctrl_v");
        // secrets never overwritten
        assert_eq!(merge.merged["post_process_api_keys"]["openai"], "sk-local");
        assert!(!merge.merged.contains_key("legacy_removed_field"));
        assert_eq!(merge.applied, vec!["selected_language".to_string()]);
        assert_eq!(merge.dropped.len(), 2);
    }
}
