//! Free space lookups for save directories.

use std::io;
use std::path::Path;

/// Source of free disk space, injectable so tests can run out of room.
pub trait DiskSpace: Send + Sync {
    /// Bytes available to this process on the filesystem holding `dir`.
    fn available(&self, dir: &Path) -> io::Result<u64>;
}

/// Reads the filesystem through `statvfs` (or the platform equivalent).
#[derive(Debug, Clone, Copy, Default)]
pub struct FsDiskSpace;

impl DiskSpace for FsDiskSpace {
    fn available(&self, dir: &Path) -> io::Result<u64> {
        // A save directory is created on first write; ask its nearest
        // existing ancestor until then.
        let existing = dir
            .ancestors()
            .find(|p| p.exists())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{:?} has no existing ancestor", dir)))?;
        fs2::available_space(existing)
    }
}
