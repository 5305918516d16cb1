//! Types for torrent engine operations.

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during engine operations.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("Engine unavailable: {0}")]
    Unavailable(String),

    #[error("Torrent not found: {0}")]
    TorrentNotFound(SessionHandle),

    #[error("Invalid torrent data: {0}")]
    InvalidTorrent(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Engine-issued identifier for a torrent, valid for one running session only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionHandle(pub u64);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How the engine allocates storage for a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Pieces are packed as they arrive; files grow over time.
    Compact,
    /// Files are created at full size up front.
    #[default]
    Sparse,
}

impl StorageMode {
    /// Returns the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::Compact => "compact",
            StorageMode::Sparse => "sparse",
        }
    }
}

/// Point-in-time state of one torrent as reported by the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TorrentSnapshot {
    /// Torrent name.
    pub name: String,
    /// Download progress (0.0 - 1.0).
    pub progress: f64,
    /// Whether the engine has the torrent paused.
    pub is_paused: bool,
    /// Whether every wanted piece is present and the torrent is uploading only.
    pub is_seed: bool,
    /// Bytes uploaded during this engine session. Reset on restart.
    pub total_upload: u64,
    /// Bytes of verified data on disk.
    pub total_done: u64,
    /// Total bytes selected for download.
    pub total_wanted: u64,
    /// Selected bytes already downloaded.
    pub total_wanted_done: u64,
    /// Number of files in the torrent.
    pub num_files: usize,
    /// Connected peers.
    pub num_peers: u32,
    /// Connected seeds.
    pub num_seeds: u32,
    /// Current download rate in bytes/second.
    pub download_rate: u64,
    /// Current upload rate in bytes/second.
    pub upload_rate: u64,
}

impl TorrentSnapshot {
    /// Whether the download has reached 100%.
    pub fn is_complete(&self) -> bool {
        self.progress >= 1.0
    }
}

/// A connected peer of one torrent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Remote address as `ip:port`.
    pub address: String,
    /// Client identification string.
    pub client: String,
    /// Download rate from this peer in bytes/second.
    pub download_rate: u64,
    /// Upload rate to this peer in bytes/second.
    pub upload_rate: u64,
    /// Whether the peer has the complete torrent.
    pub is_seed: bool,
}

/// A file inside a torrent, relative to its save directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path within the torrent.
    pub path: String,
    /// File size in bytes.
    pub size_bytes: u64,
}

/// Session-wide counters reported by the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Whether any incoming connection has been accepted.
    pub has_incoming_connections: bool,
    /// Total upload rate in bytes/second.
    pub upload_rate: u64,
    /// Total download rate in bytes/second.
    pub download_rate: u64,
    /// Connected peers across all torrents.
    pub num_peers: u32,
    /// Payload bytes downloaded this session.
    pub total_downloaded: u64,
    /// Payload bytes uploaded this session.
    pub total_uploaded: u64,
}

/// Something the engine wants the session layer to know about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A torrent finished downloading.
    Finished { handle: SessionHandle, message: String },
    /// An announce was sent to the tracker.
    TrackerAnnounce { handle: SessionHandle },
    /// The tracker answered an announce.
    TrackerReply { handle: SessionHandle },
    /// The tracker failed to answer.
    TrackerAlert {
        handle: SessionHandle,
        message: String,
        status_code: u16,
        times_in_row: u32,
    },
    /// The tracker answered with a warning.
    TrackerWarning { handle: SessionHandle, message: String },
    /// The engine could not read or write a torrent's files.
    FileError { handle: SessionHandle, message: String },
    /// Anything else, passed through untouched.
    Other {
        handle: Option<SessionHandle>,
        message: String,
    },
}

impl EngineEvent {
    /// The torrent the event refers to, if any.
    pub fn handle(&self) -> Option<SessionHandle> {
        match self {
            EngineEvent::Finished { handle, .. }
            | EngineEvent::TrackerAnnounce { handle }
            | EngineEvent::TrackerReply { handle }
            | EngineEvent::TrackerAlert { handle, .. }
            | EngineEvent::TrackerWarning { handle, .. }
            | EngineEvent::FileError { handle, .. } => Some(*handle),
            EngineEvent::Other { handle, .. } => *handle,
        }
    }

    /// Short kind name, used for logging and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::Finished { .. } => "finished",
            EngineEvent::TrackerAnnounce { .. } => "tracker_announce",
            EngineEvent::TrackerReply { .. } => "tracker_reply",
            EngineEvent::TrackerAlert { .. } => "tracker_alert",
            EngineEvent::TrackerWarning { .. } => "tracker_warning",
            EngineEvent::FileError { .. } => "file_error",
            EngineEvent::Other { .. } => "other",
        }
    }
}

/// Trait for torrent engine backends.
///
/// Calls may block for a while; callers must not hold session locks across them.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Admit a torrent file and return its handle for this session.
    async fn add_torrent(
        &self,
        torrent_file: &Path,
        save_dir: &Path,
        mode: StorageMode,
    ) -> Result<SessionHandle, EngineError>;

    /// Remove a torrent from the engine. Downloaded data is left alone.
    async fn remove_torrent(&self, handle: SessionHandle) -> Result<(), EngineError>;

    /// Pause a torrent.
    async fn pause(&self, handle: SessionHandle) -> Result<(), EngineError>;

    /// Resume a paused torrent.
    async fn resume(&self, handle: SessionHandle) -> Result<(), EngineError>;

    /// Current state of a torrent. May be expensive.
    async fn torrent_state(&self, handle: SessionHandle) -> Result<TorrentSnapshot, EngineError>;

    /// Peers connected for a torrent.
    async fn peer_info(&self, handle: SessionHandle) -> Result<Vec<PeerInfo>, EngineError>;

    /// Files contained in a torrent.
    async fn file_info(&self, handle: SessionHandle) -> Result<Vec<FileEntry>, EngineError>;

    /// Skip (true) or download (false) each file of a torrent.
    async fn set_file_filter(
        &self,
        handle: SessionHandle,
        filter: &[bool],
    ) -> Result<(), EngineError>;

    /// Session-wide counters.
    async fn session_info(&self) -> Result<SessionSnapshot, EngineError>;

    /// Whether the listen socket is open.
    async fn is_listening(&self) -> Result<bool, EngineError>;

    /// Port the engine listens on.
    async fn listening_port(&self) -> Result<u16, EngineError>;

    /// Number of DHT nodes known.
    async fn dht_node_count(&self) -> Result<u64, EngineError>;

    /// Next queued event, or `None` when the queue is empty.
    async fn pop_event(&self) -> Result<Option<EngineEvent>, EngineError>;

    /// Number of torrents the engine currently holds.
    async fn torrent_count(&self) -> Result<usize, EngineError>;

    /// Global download limit in bytes/second, negative = unlimited.
    async fn set_download_rate_limit(&self, limit: i64) -> Result<(), EngineError>;

    /// Global upload limit in bytes/second, negative = unlimited.
    async fn set_upload_rate_limit(&self, limit: i64) -> Result<(), EngineError>;

    /// Listen on the first free port in `first..=last`.
    async fn set_listen_on(&self, first: u16, last: u16) -> Result<(), EngineError>;

    /// Global connection limit, negative = unlimited.
    async fn set_max_connections(&self, limit: i64) -> Result<(), EngineError>;

    /// Global upload slot limit, negative = unlimited.
    async fn set_max_uploads(&self, limit: i64) -> Result<(), EngineError>;

    /// Write fast-resume data for a torrent next to `torrent_file`.
    async fn save_fastresume(
        &self,
        handle: SessionHandle,
        torrent_file: &Path,
    ) -> Result<(), EngineError>;

    /// Start the DHT, restoring node state from `state_file` when given.
    async fn start_dht(&self, state_file: Option<&Path>) -> Result<(), EngineError>;

    /// Stop the DHT and write its node state to `state_file`.
    async fn stop_dht(&self, state_file: &Path) -> Result<(), EngineError>;

    /// Shut the engine down. No further calls are made afterwards.
    async fn shutdown(&self) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_mode_serialization() {
        assert_eq!(
            serde_json::to_string(&StorageMode::Compact).unwrap(),
            "\"compact\""
        );
        assert_eq!(
            serde_json::from_str::<StorageMode>("\"sparse\"").unwrap(),
            StorageMode::Sparse
        );
        assert_eq!(StorageMode::default(), StorageMode::Sparse);
    }

    #[test]
    fn test_session_handle_display() {
        assert_eq!(SessionHandle(7).to_string(), "#7");
    }

    #[test]
    fn test_snapshot_is_complete() {
        let mut snapshot = TorrentSnapshot::default();
        assert!(!snapshot.is_complete());
        snapshot.progress = 1.0;
        assert!(snapshot.is_complete());
    }

    #[test]
    fn test_event_handle_and_kind() {
        let event = EngineEvent::TrackerWarning {
            handle: SessionHandle(3),
            message: "slow down".to_string(),
        };
        assert_eq!(event.handle(), Some(SessionHandle(3)));
        assert_eq!(event.kind(), "tracker_warning");

        let other = EngineEvent::Other {
            handle: None,
            message: "listen failed".to_string(),
        };
        assert_eq!(other.handle(), None);
        assert_eq!(other.kind(), "other");
    }

    #[test]
    fn test_event_serialization() {
        let event = EngineEvent::Finished {
            handle: SessionHandle(1),
            message: "torrent has finished downloading".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"finished\""));
        let parsed: EngineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
