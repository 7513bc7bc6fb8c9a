//! History payload records.

use serde::{Deserialize, Serialize};

/// Current history payload version.
pub const HISTORY_PAYLOAD_VERSION: u32 = 3;

/// One transcript history row in the current payload schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Row identifier. Unique after import; may collide inside an archive.
    pub id: i64,
    /// Display title.
    pub title: String,
    /// Raw transcription.
    pub transcription_text: String,
    /// Post-processed transcription, when post-processing ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_processed_text: Option<String>,
    /// Prompt used for post-processing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_process_prompt: Option<String>,
    /// Unix timestamp (seconds).
    pub timestamp: i64,
    /// Recorded duration in milliseconds.
    #[serde(default)]
    pub duration_ms: i64,
    /// Whether the user starred this row.
    #[serde(default)]
    pub saved: bool,
    /// Recording file referenced by this row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording_filename: Option<String>,
}

impl HistoryRecord {
    /// Text the stats engine counts: the post-processed text when present.
    #[must_use]
    pub fn effective_text(&self) -> &str {
        self.post_processed_text
            .as_deref()
            .unwrap_or(&self.transcription_text)
    }
}
