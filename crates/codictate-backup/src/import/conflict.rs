//! Conflict resolution for imported data.
//!
//! Both functions are pure and order-preserving: the same input always yields
//! the same output, so restoring one archive twice produces identical data.

use std::collections::HashSet;

use codictate_model::{HistoryRecord, collision_key};
use serde::Serialize;

/// One history id that was changed to resolve a duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Rekey {
    /// Row position in the imported sequence.
    pub position: usize,
    /// Id as found in the archive.
    pub from: i64,
    /// Id assigned.
    pub to: i64,
}

/// Give every duplicate history id a fresh one.
///
/// The first row with an id keeps it. Later duplicates get `max_id + 1`,
/// `max_id + 2`, ... in encounter order. Rows are never dropped.
pub fn rekey_history(rows: &mut [HistoryRecord]) -> Vec<Rekey> {
    let mut seen: HashSet<i64> = HashSet::with_capacity(rows.len());
    let duplicated = rows.iter().any(|row| !seen.insert(row.id));
    if !duplicated {
        return Vec::new();
    }

    let mut next = rows.iter().map(|row| row.id).max().unwrap_or(0);
    let mut taken: HashSet<i64> = HashSet::with_capacity(rows.len());
    let mut rekeys = Vec::new();
    for (position, row) in rows.iter_mut().enumerate() {
        if taken.insert(row.id) {
            continue;
        }
        next = next_unused(&seen, &taken, next);
        rekeys.push(Rekey {
            position,
            from: row.id,
            to: next,
        });
        row.id = next;
        taken.insert(next);
    }
    rekeys
}

fn next_unused(original: &HashSet<i64>, taken: &HashSet<i64>, after: i64) -> i64 {
    let mut candidate = after.checked_add(1).unwrap_or(1);
    while original.contains(&candidate) || taken.contains(&candidate) {
        candidate = candidate.checked_add(1).unwrap_or(1);
    }
    candidate
}

/// Resolve recording names that collide after NFC normalization and case
/// folding.
///
/// Returns the final name for each input, in input order. The first name of
/// a colliding group is kept; later ones become `stem-N.ext` with the first
/// `N` that collides with neither an input name nor an earlier result.
#[must_use]
pub fn resolve_recording_names(names: &[String]) -> Vec<String> {
    let originals: HashSet<String> = names.iter().map(|n| collision_key(n)).collect();
    let mut used: HashSet<String> = HashSet::with_capacity(names.len());
    let mut resolved = Vec::with_capacity(names.len());

    for name in names {
        if used.insert(collision_key(name)) {
            resolved.push(name.clone());
            continue;
        }
        let mut suffix = 1_u32;
        loop {
            let candidate = suffixed(name, suffix);
            let key = collision_key(&candidate);
            if !originals.contains(&key) && used.insert(key) {
                resolved.push(candidate);
                break;
            }
            suffix += 1;
        }
    }
    resolved
}

/// `stem-N.ext`, or `name-N` without an extension.
pub(crate) fn suffixed(name: &str, n: u32) -> String {
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}-{n}{}", &name[..dot], &name[dot..]),
        _ => format!("{name}-{n}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(ids: &[i64]) -> Vec<HistoryRecord> {
        ids.iter()
            .map(|&id| HistoryRecord {
                id,
                title: String::new(),
                transcription_text: String::new(),
                post_processed_text: None,
                post_process_prompt: None,
                timestamp: 0,
                duration_ms: 0,
                saved: false,
                recording_filename: None,
            })
            .collect()
    }

    fn ids(rows: &[HistoryRecord]) -> Vec<i64> {
        rows.iter().map(|r| r.id).collect()
    }

    #[test]
    fn test_rekey_duplicate_ids() {
        let mut imported = rows(&[1, 1, 2]);
        let rekeys = rekey_history(&mut imported);
        assert_eq!(ids(&imported), vec![1, 3, 2]);
        assert_eq!(
            rekeys,
            vec![Rekey {
                position: 1,
                from: 1,
                to: 3
            }]
        );
    }

    #[test]
    fn test_rekey_is_stable() {
        let mut first = rows(&[5, 2, 5, 2, 5]);
        let mut second = first.clone();
        rekey_history(&mut first);
        rekey_history(&mut second);
        assert_eq!(ids(&first), vec![5, 2, 6, 7, 8]);
        assert_eq!(ids(&first), ids(&second));
    }

    #[test]
    fn test_rekey_without_duplicates_is_noop() {
        let mut imported = rows(&[3, 1, 2]);
        assert!(rekey_history(&mut imported).is_empty());
        assert_eq!(ids(&imported), vec![3, 1, 2]);
    }

    #[test]
    fn test_rekey_at_id_ceiling() {
        let mut imported = rows(&[i64::MAX, i64::MAX]);
        rekey_history(&mut imported);
        assert_eq!(ids(&imported), vec![i64::MAX, 1]);
    }

    #[test]
    fn test_recording_collisions_renamed() {
        let names: Vec<String> = ["Rec.wav", "rec.wav", "REC.WAV", "other.wav"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            resolve_recording_names(&names),
            vec!["Rec.wav", "rec-1.wav", "REC-2.WAV", "other.wav"]
        );
    }

    #[test]
    fn test_suffix_skips_existing_names() {
        let names: Vec<String> = ["a.wav", "A.wav", "a-1.wav"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            resolve_recording_names(&names),
            vec!["a.wav", "A-2.wav", "a-1.wav"]
        );
    }

    #[test]
    fn test_unicode_forms_collide() {
        let names = vec!["caf\u{e9}.wav".to_string(), "cafe\u{301}.wav".to_string()];
        let resolved = resolve_recording_names(&names);
        assert_eq!(resolved[0], names[0]);
        assert_eq!(resolved[1], "cafe\u{301}-1.wav");
    }

    #[test]
    fn test_suffix_without_extension() {
        assert_eq!(suffixed("memo", 2), "memo-2");
        assert_eq!(suffixed(".hidden", 1), ".hidden-1");
    }
}
