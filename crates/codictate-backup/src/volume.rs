//! Free-space and file-size-ceiling probes.

use std::borrow::Cow;
use std::io;
use std::path::{Path, PathBuf};

/// Largest file a FAT32 volume can hold.
pub const FAT32_MAX_FILE_BYTES: u64 = 4 * 1024 * 1024 * 1024 - 1;

/// Queries about the volume holding a path.
///
/// Export and restore consult the probe before writing anything, so tests can
/// simulate full disks and size-limited destinations.
pub trait VolumeProbe: Send + Sync {
    /// Free bytes on the volume holding `path` (or its nearest existing parent).
    fn available_space(&self, path: &Path) -> io::Result<u64>;

    /// Single-file size ceiling of that volume, when it has one.
    fn max_file_size(&self, path: &Path) -> Option<u64>;
}

/// Probe backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemVolumeProbe;

impl VolumeProbe for SystemVolumeProbe {
    fn available_space(&self, path: &Path) -> io::Result<u64> {
        fs2::available_space(existing_ancestor(path).as_ref())
    }

    fn max_file_size(&self, path: &Path) -> Option<u64> {
        let fs_type = filesystem_type(existing_ancestor(path).as_ref())?;
        matches!(fs_type.as_str(), "vfat" | "msdos" | "fat" | "fat32").then_some(FAT32_MAX_FILE_BYTES)
    }
}

fn existing_ancestor(path: &Path) -> Cow<'_, Path> {
    let mut current = path;
    loop {
        if current.exists() {
            return Cow::Borrowed(current);
        }
        match current.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => current = parent,
            _ => {
                return Cow::Owned(std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
            }
        }
    }
}

/// File system type of the mount holding `path` (Linux only).
#[cfg(target_os = "linux")]
fn filesystem_type(path: &Path) -> Option<String> {
    let path = path.canonicalize().ok()?;
    let mounts = std::fs::read_to_string("/proc/mounts").ok()?;
    mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _device = fields.next()?;
            let mount_point = fields.next()?.replace("\\040", " ");
            let fs_type = fields.next()?;
            path.starts_with(&mount_point)
                .then(|| (mount_point.len(), fs_type.to_string()))
        })
        .max_by_key(|(len, _)| *len)
        .map(|(_, fs_type)| fs_type)
}

#[cfg(not(target_os = "linux"))]
fn filesystem_type(_path: &Path) -> Option<String> {
    None
}
