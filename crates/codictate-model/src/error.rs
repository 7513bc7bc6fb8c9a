//! Schema-level error types.

use thiserror::Error;

use crate::manifest::ComponentKind;

/// Errors raised while interpreting archive schemas.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ModelError {
    /// A `major.minor` version string could not be parsed.
    #[error("invalid backup format version: {0}")]
    InvalidVersion(String),

    /// The archive was written by a format outside the compatibility window.
    #[error("backup format {found} is not supported (supported majors: {supported})")]
    UnsupportedFormat {
        /// Version found in the manifest.
        found: String,
        /// Human-readable list of supported majors.
        supported: String,
    },

    /// No chain of adjacent migrations leads from `from` to the current version.
    #[error("no migration path for {component} payload version {from} (current: {current})")]
    MissingMigration {
        /// Component whose payload cannot be migrated.
        component: ComponentKind,
        /// Payload version found in the archive.
        from: u32,
        /// Payload version this build understands.
        current: u32,
    },

    /// A single payload record could not be decoded.
    #[error("malformed {component} record: {reason}")]
    MalformedRecord {
        /// Component the record belongs to.
        component: ComponentKind,
        /// Decoder message (never contains record content).
        reason: String,
    },
}

impl ModelError {
    pub(crate) fn malformed(component: ComponentKind, err: &serde_json::Error) -> Self {
        // serde_json messages can echo record values; keep category and column only
        Self::MalformedRecord {
            component,
            reason: format!("{:?} error at column {}", err.classify(), err.column()),
        }
    }
}

/// Result type alias for schema operations.
pub type Result<T> = std::result::Result<T, ModelError>;
