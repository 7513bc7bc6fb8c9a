//! Backup format versioning.
//!
//! The format version is a `major.minor` pair. The major version defines the
//! compatibility window: archives written with the current major or the
//! immediately previous major can be restored. The minor version tracks
//! payload-schema evolution within a major and never blocks a restore.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ModelError, Result};

/// A `major.minor` backup format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FormatVersion {
    /// Major version; defines the compatibility window.
    pub major: u32,
    /// Minor version; tracks payload evolution within a major.
    pub minor: u32,
}

impl FormatVersion {
    /// Format written by this build.
    pub const CURRENT: Self = Self::new(2, 1);

    /// Create a new version.
    #[must_use]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Majors this build can restore (current and immediately previous).
    #[must_use]
    pub fn supported_majors() -> [u32; 2] {
        let current = Self::CURRENT.major;
        [current, current.saturating_sub(1)]
    }

    /// Check whether this version falls inside the compatibility window.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.major > 0 && Self::supported_majors().contains(&self.major)
    }

    /// Fail with [`ModelError::UnsupportedFormat`] when outside the window.
    pub fn ensure_supported(&self) -> Result<()> {
        if self.is_supported() {
            return Ok(());
        }
        let [current, previous] = Self::supported_majors();
        Err(ModelError::UnsupportedFormat {
            found: self.to_string(),
            supported: format!("{current}.x, {previous}.x"),
        })
    }

    /// Whether the archive was written by a newer major than this build knows.
    #[must_use]
    pub fn is_newer_than_current(&self) -> bool {
        self.major > Self::CURRENT.major
    }
}

impl Default for FormatVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl FromStr for FormatVersion {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let (major, minor) = trimmed
            .split_once('.')
            .ok_or_else(|| ModelError::InvalidVersion(trimmed.to_string()))?;
        let major = major
            .parse()
            .map_err(|_| ModelError::InvalidVersion(trimmed.to_string()))?;
        let minor = minor
            .parse()
            .map_err(|_| ModelError::InvalidVersion(trimmed.to_string()))?;
        Ok(Self { major, minor })
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Serialize for FormatVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FormatVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
