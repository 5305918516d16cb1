//! Types for the session manager.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::catalog::{CatalogError, RecordId};
use crate::engine::{EngineError, SessionHandle, SessionSnapshot, StorageMode, TorrentSnapshot};
use crate::prefs::PreferenceError;
use crate::queue::QueueError;

/// Session manager lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Uninitialized,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl Lifecycle {
    /// Returns the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Uninitialized => "uninitialized",
            Lifecycle::Starting => "starting",
            Lifecycle::Running => "running",
            Lifecycle::Stopping => "stopping",
            Lifecycle::Stopped => "stopped",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors for session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Cannot {operation} while {state}")]
    InvalidLifecycle {
        operation: &'static str,
        state: Lifecycle,
    },

    #[error("Unknown torrent: {0}")]
    UnknownTorrent(SessionHandle),

    #[error("File filter for {handle} has {actual} entries, torrent has {expected} files")]
    InvalidFileFilter {
        handle: SessionHandle,
        expected: usize,
        actual: usize,
    },

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Preference(#[from] PreferenceError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The handle map, catalog, queue and engine disagree about how many
/// torrents exist. Always a bug.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "Torrent bookkeeping out of step: {handles} handles, {records} records, \
     {queued} queued, {engine} in engine"
)]
pub struct InvariantViolation {
    pub handles: usize,
    pub records: usize,
    pub queued: usize,
    pub engine: usize,
}

/// A request to add a torrent file.
#[derive(Debug, Clone, PartialEq)]
pub struct AddTorrentRequest {
    pub torrent_file: PathBuf,
    pub save_directory: PathBuf,
    pub storage_mode: StorageMode,
    /// Add as user-paused.
    pub paused: bool,
}

impl AddTorrentRequest {
    pub fn new(torrent_file: impl Into<PathBuf>, save_directory: impl Into<PathBuf>) -> Self {
        Self {
            torrent_file: torrent_file.into(),
            save_directory: save_directory.into(),
            storage_mode: StorageMode::default(),
            paused: false,
        }
    }

    pub fn with_storage_mode(mut self, mode: StorageMode) -> Self {
        self.storage_mode = mode;
        self
    }

    pub fn paused(mut self, paused: bool) -> Self {
        self.paused = paused;
        self
    }
}

/// An engine call the synchronizer could not complete.
#[derive(Debug, Clone)]
pub struct SyncFailure {
    pub record: RecordId,
    /// Set when the failure was a removal.
    pub handle: Option<SessionHandle>,
    pub error: EngineError,
}

/// Outcome of one synchronizer pass.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Every handle created by this pass, in creation order.
    pub added: Vec<SessionHandle>,
    /// Handles released by this pass.
    pub removed: Vec<SessionHandle>,
    pub failed: Vec<SyncFailure>,
}

impl SyncReport {
    /// Whether the pass made no engine changes and hit no failures.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.failed.is_empty()
    }

    /// The failure recorded for `record`, if any.
    pub fn failure_for(&self, record: RecordId) -> Option<&SyncFailure> {
        self.failed.iter().find(|f| f.record == record)
    }
}

/// Tracker status text kept per torrent from engine events.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TorrentAnnotations {
    pub tracker_status: Option<String>,
    /// Raw message from the last tracker event that carried one.
    pub tracker_message: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Everything known about one managed torrent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TorrentStatus {
    pub handle: SessionHandle,
    pub record: RecordId,
    /// Index in the queue, 0 = highest priority.
    pub queue_position: usize,
    pub save_directory: PathBuf,
    pub storage_mode: StorageMode,
    pub user_paused: bool,
    /// Upload from earlier sessions plus this one.
    pub total_uploaded: u64,
    /// Upload/download ratio, `None` before anything was downloaded.
    pub ratio: Option<f64>,
    pub state: TorrentSnapshot,
    #[serde(flatten)]
    pub annotations: TorrentAnnotations,
}

/// Session-wide status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub lifecycle: Lifecycle,
    pub torrent_count: usize,
    pub is_listening: bool,
    pub listening_port: u16,
    /// `None` when the DHT is not running.
    pub dht_nodes: Option<u64>,
    pub engine: SessionSnapshot,
}

/// A shutdown step that failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShutdownFailure {
    pub step: &'static str,
    pub error: String,
}

/// Outcome of `SessionManager::stop`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShutdownReport {
    /// Torrents whose session upload was folded into their credit.
    pub credited: usize,
    /// Torrents whose fast-resume data was written.
    pub fastresume_saved: usize,
    pub failures: Vec<ShutdownFailure>,
}

impl ShutdownReport {
    /// Whether every step succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub(crate) fn record(&mut self, step: &'static str, error: impl fmt::Display) {
        self.failures.push(ShutdownFailure {
            step,
            error: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_display() {
        assert_eq!(Lifecycle::Running.to_string(), "running");
        assert_eq!(
            serde_json::to_string(&Lifecycle::Uninitialized).unwrap(),
            "\"uninitialized\""
        );
    }

    #[test]
    fn test_invalid_lifecycle_message() {
        let err = SessionError::InvalidLifecycle {
            operation: "add a torrent",
            state: Lifecycle::Stopped,
        };
        assert_eq!(err.to_string(), "Cannot add a torrent while stopped");
    }

    #[test]
    fn test_add_request_builder() {
        let request = AddTorrentRequest::new("/in/a.torrent", "/downloads")
            .with_storage_mode(StorageMode::Compact)
            .paused(true);
        assert_eq!(request.storage_mode, StorageMode::Compact);
        assert!(request.paused);
    }

    #[test]
    fn test_shutdown_report() {
        let mut report = ShutdownReport::default();
        assert!(report.is_clean());
        report.record("stop_dht", EngineError::Unavailable("gone".into()));
        assert!(!report.is_clean());
        assert_eq!(report.failures[0].step, "stop_dht");
        assert_eq!(report.failures[0].error, "Engine unavailable: gone");
    }

    #[test]
    fn test_sync_report_failure_lookup() {
        let report = SyncReport {
            failed: vec![SyncFailure {
                record: RecordId(2),
                handle: None,
                error: EngineError::InvalidTorrent("bad".into()),
            }],
            ..Default::default()
        };
        assert!(!report.is_empty());
        assert!(report.failure_for(RecordId(2)).is_some());
        assert!(report.failure_for(RecordId(1)).is_none());
    }
}
