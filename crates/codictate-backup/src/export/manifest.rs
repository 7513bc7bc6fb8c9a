//! Manifest and checksum builder.
//!
//! The only place that decides manifest contents. Every payload entry written
//! by the archive writer is recorded here with its hash; restore never infers
//! versions or counts.

use codictate_model::{
    ComponentKind, DICTIONARY_PAYLOAD_VERSION, HISTORY_PAYLOAD_VERSION, Manifest,
    SETTINGS_PAYLOAD_VERSION, Scope,
};

use crate::checksum::ChecksumSet;

/// Payload version written for recordings (plain files, never migrated).
pub const RECORDINGS_PAYLOAD_VERSION: u32 = 1;

/// Accumulates entry hashes and component counts while an archive is written.
#[derive(Debug)]
pub struct ManifestBuilder {
    manifest: Manifest,
    checksums: ChecksumSet,
}

impl ManifestBuilder {
    /// Start a manifest stamped with the app version and current time.
    pub fn new(app_version: impl Into<String>, scope: Scope) -> Self {
        Self {
            manifest: Manifest::new(app_version, scope),
            checksums: ChecksumSet::new(),
        }
    }

    /// Record the hash of a payload entry.
    pub fn record_entry(&mut self, path: &str, sha256: &str) {
        self.checksums.insert(path, sha256);
    }

    /// Record the item count of a component at its current payload version.
    pub fn record_component(&mut self, kind: ComponentKind, count: u64) {
        let version = match kind {
            ComponentKind::History => HISTORY_PAYLOAD_VERSION,
            ComponentKind::Dictionary => DICTIONARY_PAYLOAD_VERSION,
            ComponentKind::Settings => SETTINGS_PAYLOAD_VERSION,
            ComponentKind::Recordings => RECORDINGS_PAYLOAD_VERSION,
        };
        self.manifest.set_component(kind, version, count);
    }

    /// Add a non-fatal warning.
    pub fn warn(&mut self, warning: impl Into<String>) {
        self.manifest.warn(warning);
    }

    /// Entries hashed so far.
    #[must_use]
    pub fn checksums(&self) -> &ChecksumSet {
        &self.checksums
    }

    /// Finish and return the manifest with its checksum set.
    #[must_use]
    pub fn finish(self) -> (Manifest, ChecksumSet) {
        (self.manifest, self.checksums)
    }
}
