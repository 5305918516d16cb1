//! Persistent torrent record types.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::StorageMode;

/// Durable identity of a torrent record. Survives restarts, unlike
/// `SessionHandle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Per-file skip flags for a torrent, one per file. `true` = skip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileFilter(Vec<bool>);

impl FileFilter {
    pub fn new(skip: Vec<bool>) -> Self {
        Self(skip)
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of files marked as skipped.
    pub fn skipped(&self) -> usize {
        self.0.iter().filter(|skip| **skip).count()
    }
}

/// A torrent the client manages, as persisted between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentRecord {
    pub id: RecordId,
    /// The managed copy of the torrent file.
    pub source_path: PathBuf,
    /// Where downloaded data goes.
    pub save_directory: PathBuf,
    pub storage_mode: StorageMode,
    /// Paused by the user; the queue policy never resumes it.
    pub user_paused: bool,
    /// Bytes uploaded in earlier sessions.
    pub uploaded_credit: u64,
    /// Set before removal; the synchronizer deletes the record.
    #[serde(skip)]
    pub pending_delete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_filter: Option<FileFilter>,
}

impl TorrentRecord {
    /// File name of the managed torrent copy.
    pub fn file_name(&self) -> String {
        self.source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Delete the managed torrent copy and its fast-resume sidecar.
    ///
    /// Files that are already gone are not an error.
    pub fn remove_managed_files(&self) -> io::Result<()> {
        remove_if_exists(&self.source_path)?;
        remove_if_exists(&fastresume_path(&self.source_path))
    }
}

/// Path of the fast-resume sidecar written next to a torrent file.
pub fn fastresume_path(torrent_file: &Path) -> PathBuf {
    let mut name = torrent_file.as_os_str().to_os_string();
    name.push(".fastresume");
    PathBuf::from(name)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Errors for catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Torrent already managed: {name}")]
    DuplicateTorrent { name: String },

    #[error("Not a torrent file path: {0}")]
    InvalidSource(PathBuf),

    #[error("Unknown record: {0}")]
    UnknownRecord(RecordId),

    #[error("Catalog file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CatalogError {
    /// Whether this is a missing-file error (nothing saved yet).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(source: PathBuf) -> TorrentRecord {
        TorrentRecord {
            id: RecordId(1),
            source_path: source,
            save_directory: PathBuf::from("/downloads"),
            storage_mode: StorageMode::Sparse,
            user_paused: false,
            uploaded_credit: 0,
            pending_delete: true,
            file_filter: None,
        }
    }

    #[test]
    fn test_fastresume_path_appends_suffix() {
        assert_eq!(
            fastresume_path(Path::new("/t/debian.torrent")),
            PathBuf::from("/t/debian.torrent.fastresume")
        );
    }

    #[test]
    fn test_pending_delete_is_not_persisted() {
        let json = serde_json::to_string(&record(PathBuf::from("/t/a.torrent"))).unwrap();
        assert!(!json.contains("pending_delete"));
        assert!(!json.contains("file_filter"));

        let parsed: TorrentRecord = serde_json::from_str(&json).unwrap();
        assert!(!parsed.pending_delete);
    }

    #[test]
    fn test_remove_managed_files_tolerates_missing_sidecar() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("a.torrent");
        std::fs::write(&source, b"d4:infoe").unwrap();

        let record = record(source.clone());
        record.remove_managed_files().unwrap();
        assert!(!source.exists());

        // Second call: both files already gone.
        record.remove_managed_files().unwrap();
    }

    #[test]
    fn test_file_filter_counts() {
        let filter = FileFilter::new(vec![true, false, true]);
        assert_eq!(filter.len(), 3);
        assert_eq!(filter.skipped(), 2);
        assert_eq!(serde_json::to_string(&filter).unwrap(), "[true,false,true]");
    }
}
