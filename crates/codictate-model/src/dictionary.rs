//! Dictionary payload entries.

use serde::{Deserialize, Serialize};

use crate::names::collision_key;

/// Current dictionary payload version.
pub const DICTIONARY_PAYLOAD_VERSION: u32 = 2;

/// One learned-word dictionary entry.
///
/// Entries pass through import unchanged; the only transformation is
/// deduplication against entries already present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictionaryEntry {
    /// Canonical term as spoken.
    pub input: String,
    /// Alternative spellings that map to the same term.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Text inserted in place of the term.
    pub replacement: String,
    /// Exact replacement instead of fuzzy vocabulary matching.
    #[serde(default)]
    pub is_replacement: bool,
}

impl DictionaryEntry {
    /// Key used to detect duplicates (NFC + case folded canonical term).
    #[must_use]
    pub fn dedup_key(&self) -> String {
        collision_key(&self.input)
    }
}
