//! SHA-256 checksums for archive entries.
//!
//! The checksum set is stored as `checksums.sha256` in GNU `sha256sum` format
//! (`<hash>  <path>` per line) so an archive can also be checked by hand after
//! unpacking.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use codictate_model::{normalize_name, paths};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{BackupError, Result};

/// Buffer size for reading files during checksum computation.
pub(crate) const BUFFER_SIZE: usize = 64 * 1024;

/// Compute the SHA-256 of a byte slice as lowercase hex.
#[must_use]
pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Compute the SHA-256 of a file.
pub fn compute_file_sha256(path: &Path) -> Result<String> {
    debug!(path = %path.display(), "computing sha256");
    let file = File::open(path).map_err(BackupError::io("open", path))?;
    let mut reader = HashingReader::new(BufReader::with_capacity(BUFFER_SIZE, file));
    io::copy(&mut reader, &mut io::sink()).map_err(BackupError::io("read", path))?;
    Ok(reader.finish().0)
}

/// Reader adapter that hashes and counts everything read through it.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes: u64,
}

impl<R: Read> HashingReader<R> {
    /// Wrap a reader.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    /// Bytes read so far.
    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.bytes
    }

    /// Finish hashing and return `(hex digest, byte count)`.
    #[must_use]
    pub fn finish(self) -> (String, u64) {
        (hex::encode(self.hasher.finalize()), self.bytes)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}

/// Ordered map of archive path to SHA-256.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumSet {
    entries: BTreeMap<String, String>,
}

impl ChecksumSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the hash of an entry. Paths are stored NFC-normalized.
    pub fn insert(&mut self, path: &str, hash: &str) {
        self.entries
            .insert(normalize_name(path), hash.to_ascii_lowercase());
    }

    /// Look up the expected hash of an entry.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&str> {
        self.entries.get(&normalize_name(path)).map(String::as_str)
    }

    /// Whether an entry is covered.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Number of covered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(path, hash)` in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(p, h)| (p.as_str(), h.as_str()))
    }

    /// Render in `sha256sum` format.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.entries.len() * 96);
        for (path, hash) in &self.entries {
            out.push_str(hash);
            out.push_str("  ");
            out.push_str(path);
            out.push('\n');
        }
        out
    }

    /// Parse `sha256sum` output (text `"  "` or binary `" *"` separators).
    ///
    /// The set may not list itself or the manifest.
    pub fn parse(content: &str) -> Result<Self> {
        let mut set = Self::new();
        for (number, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let invalid = |reason: &str| BackupError::InvalidManifest {
                entry: "checksum list",
                reason: format!("line {}: {reason}", number + 1),
            };
            let (hash, rest) = line
                .split_once(' ')
                .ok_or_else(|| invalid("expected `<hash>  <path>`"))?;
            let path = rest
                .strip_prefix(' ')
                .or_else(|| rest.strip_prefix('*'))
                .ok_or_else(|| invalid("expected two-space separator"))?;
            if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid("hash is not 64 hex characters"));
            }
            if path.is_empty() || path == paths::MANIFEST || path == paths::CHECKSUMS {
                return Err(invalid("invalid path"));
            }
            if set.contains(path) {
                return Err(invalid("duplicate path"));
            }
            set.insert(path, hash);
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    const HELLO_SHA: &str = "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f";

    #[test]
    fn test_sha256_bytes() {
        assert_eq!(sha256_bytes(b"Hello, World!"), HELLO_SHA);
    }

    #[test]
    fn test_compute_file_sha256() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        let mut file = File::create(&path).unwrap();
        file.write_all(b"Hello, World!").unwrap();
        drop(file);

        assert_eq!(compute_file_sha256(&path).unwrap(), HELLO_SHA);
    }

    #[test]
    fn test_hashing_reader_counts() {
        let mut reader = HashingReader::new(&b"Hello, World!"[..]);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        let (hash, bytes) = reader.finish();
        assert_eq!(hash, HELLO_SHA);
        assert_eq!(bytes, 13);
    }

    #[test]
    fn test_render_and_parse() {
        let mut set = ChecksumSet::new();
        set.insert("history/history.jsonl", &HELLO_SHA.to_uppercase());
        set.insert("dictionary/dictionary.json", HELLO_SHA);

        let rendered = set.render();
        assert!(rendered.starts_with(&format!("{HELLO_SHA}  dictionary/dictionary.json\n")));

        let parsed = ChecksumSet::parse(&rendered).unwrap();
        assert_eq!(parsed, set);
        assert_eq!(parsed.get("history/history.jsonl"), Some(HELLO_SHA));
    }

    #[test]
    fn test_parse_binary_marker() {
        let parsed = ChecksumSet::parse(&format!("{HELLO_SHA} *recordings/a.wav\n")).unwrap();
        assert!(parsed.contains("recordings/a.wav"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ChecksumSet::parse("abc  history/history.jsonl").is_err());
        assert!(ChecksumSet::parse(&format!("{HELLO_SHA}  manifest.json")).is_err());
        assert!(
            ChecksumSet::parse(&format!("{HELLO_SHA}  a\n{HELLO_SHA}  a\n")).is_err()
        );
    }

    #[test]
    fn test_paths_are_nfc() {
        let mut set = ChecksumSet::new();
        set.insert("recordings/cafe\u{301}.wav", HELLO_SHA);
        assert!(set.contains("recordings/caf\u{e9}.wav"));
    }
}
