//! Portable name handling.
//!
//! Archive entry names and recording file names are stored in Unicode NFC.
//! Collision detection additionally folds case, so `Rec.wav` and `rec.wav`
//! count as the same file.

use unicode_normalization::UnicodeNormalization;

/// Normalize a name to Unicode NFC.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    name.nfc().collect()
}

/// Key under which two names are considered the same file on any platform.
#[must_use]
pub fn collision_key(name: &str) -> String {
    normalize_name(name).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_composes() {
        let decomposed = "e\u{301}.wav";
        assert_eq!(normalize_name(decomposed), "\u{e9}.wav");
    }

    #[test]
    fn test_collision_key_folds_case() {
        assert_eq!(collision_key("Rec.WAV"), collision_key("rec.wav"));
        assert_ne!(collision_key("rec1.wav"), collision_key("rec2.wav"));
    }
}
