//! Export: snapshot the stores, build the manifest, write the archive.

pub mod manifest;
pub mod snapshot;
pub mod writer;

pub use manifest::{ManifestBuilder, RECORDINGS_PAYLOAD_VERSION};
pub use snapshot::{RecordingSource, Snapshot, take_snapshot};
pub use writer::{ARCHIVE_EXTENSION, ArchiveSummary, ExportOptions, default_file_name, resolve_destination};
