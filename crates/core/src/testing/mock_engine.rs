//! Mock torrent engine for testing.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::catalog::fastresume_path;
use crate::engine::{
    Engine, EngineError, EngineEvent, FileEntry, PeerInfo, SessionHandle, SessionSnapshot,
    StorageMode, TorrentSnapshot,
};

/// A mutating call made against the mock, for test assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    AddTorrent {
        path: PathBuf,
        save_dir: PathBuf,
        mode: StorageMode,
    },
    RemoveTorrent(SessionHandle),
    Pause(SessionHandle),
    Resume(SessionHandle),
    SetFileFilter(SessionHandle, Vec<bool>),
    SetDownloadRateLimit(i64),
    SetUploadRateLimit(i64),
    SetListenOn(u16, u16),
    SetMaxConnections(i64),
    SetMaxUploads(i64),
    SaveFastresume(SessionHandle),
    StartDht(Option<PathBuf>),
    StopDht(PathBuf),
    Shutdown,
}

impl EngineCall {
    /// Whether this call changes which torrents the engine holds.
    pub fn is_membership_change(&self) -> bool {
        matches!(self, EngineCall::AddTorrent { .. } | EngineCall::RemoveTorrent(_))
    }
}

#[derive(Debug, Clone)]
struct MockTorrent {
    torrent_file: PathBuf,
    snapshot: TorrentSnapshot,
    files: Vec<FileEntry>,
    peers: Vec<PeerInfo>,
    filter: Option<Vec<bool>>,
}

/// Mock implementation of the `Engine` trait.
///
/// Provides controllable behavior for testing:
/// - Records every mutating call
/// - Lets tests drive torrent state and queue events
/// - Injects a one-shot failure per operation name
///
/// # Example
///
/// ```rust,ignore
/// let engine = MockEngine::new();
/// let handle = engine.add_torrent(&file, &save_dir, StorageMode::Sparse).await?;
///
/// engine.set_progress(handle, 1.0).await;
/// engine.push_event(EngineEvent::Finished { handle, message: "done".into() }).await;
///
/// engine.fail_next("pause", EngineError::Unavailable("busy".into())).await;
/// assert!(engine.pause(handle).await.is_err());
/// ```
#[derive(Debug, Default)]
pub struct MockEngine {
    calls: RwLock<Vec<EngineCall>>,
    torrents: RwLock<BTreeMap<SessionHandle, MockTorrent>>,
    events: RwLock<VecDeque<EngineEvent>>,
    /// Pending failure per op: calls to let through first, then the error.
    failures: RwLock<HashMap<&'static str, (usize, EngineError)>>,
    session: RwLock<SessionSnapshot>,
    next_handle: AtomicU64,
    state_queries: AtomicUsize,
}

impl MockEngine {
    /// Create a new mock engine with no torrents.
    pub fn new() -> Self {
        Self::default()
    }

    /// All mutating calls made so far.
    pub async fn calls(&self) -> Vec<EngineCall> {
        self.calls.read().await.clone()
    }

    /// Forget recorded calls.
    pub async fn clear_calls(&self) {
        self.calls.write().await.clear();
    }

    /// Number of `torrent_state` calls made so far.
    pub fn state_queries(&self) -> usize {
        self.state_queries.load(Ordering::SeqCst)
    }

    /// Make the next call of `op` fail with `error`.
    ///
    /// `op` is the trait method name, e.g. `"add_torrent"` or `"stop_dht"`.
    pub async fn fail_next(&self, op: &'static str, error: EngineError) {
        self.fail_after(op, 0, error).await;
    }

    /// Let `calls` more calls of `op` succeed, then fail the one after.
    pub async fn fail_after(&self, op: &'static str, calls: usize, error: EngineError) {
        self.failures.write().await.insert(op, (calls, error));
    }

    /// Modify a torrent's snapshot in place.
    pub async fn update_torrent(&self, handle: SessionHandle, f: impl FnOnce(&mut TorrentSnapshot)) {
        if let Some(torrent) = self.torrents.write().await.get_mut(&handle) {
            f(&mut torrent.snapshot);
        }
    }

    /// Set download progress. Reaching 1.0 makes the torrent a seed.
    pub async fn set_progress(&self, handle: SessionHandle, progress: f64) {
        self.update_torrent(handle, |s| {
            let progress = progress.clamp(0.0, 1.0);
            s.progress = progress;
            s.total_wanted_done = (s.total_wanted as f64 * progress) as u64;
            s.total_done = s.total_wanted_done;
            s.is_seed = progress >= 1.0;
        })
        .await;
    }

    /// Replace the file list of a torrent.
    pub async fn set_files(&self, handle: SessionHandle, files: Vec<FileEntry>) {
        if let Some(torrent) = self.torrents.write().await.get_mut(&handle) {
            torrent.snapshot.num_files = files.len();
            torrent.files = files;
        }
    }

    /// Replace the peer list of a torrent.
    pub async fn set_peers(&self, handle: SessionHandle, peers: Vec<PeerInfo>) {
        if let Some(torrent) = self.torrents.write().await.get_mut(&handle) {
            torrent.snapshot.num_peers = peers.len() as u32;
            torrent.peers = peers;
        }
    }

    /// Replace the session-wide counters.
    pub async fn set_session_info(&self, info: SessionSnapshot) {
        *self.session.write().await = info;
    }

    /// Queue an event for `pop_event`.
    pub async fn push_event(&self, event: EngineEvent) {
        self.events.write().await.push_back(event);
    }

    pub async fn has_torrent(&self, handle: SessionHandle) -> bool {
        self.torrents.read().await.contains_key(&handle)
    }

    /// Handles currently held, in issue order.
    pub async fn handles(&self) -> Vec<SessionHandle> {
        self.torrents.read().await.keys().copied().collect()
    }

    /// Handle of the torrent added from `torrent_file`, if held.
    pub async fn handle_for(&self, torrent_file: &Path) -> Option<SessionHandle> {
        self.torrents
            .read()
            .await
            .iter()
            .find(|(_, t)| t.torrent_file == torrent_file)
            .map(|(h, _)| *h)
    }

    /// File filter last set for a torrent.
    pub async fn file_filter(&self, handle: SessionHandle) -> Option<Vec<bool>> {
        self.torrents
            .read()
            .await
            .get(&handle)
            .and_then(|t| t.filter.clone())
    }

    async fn take_failure(&self, op: &'static str) -> Result<(), EngineError> {
        let mut failures = self.failures.write().await;
        match failures.get_mut(op) {
            Some((remaining, _)) if *remaining > 0 => {
                *remaining -= 1;
                Ok(())
            }
            Some(_) => match failures.remove(op) {
                Some((_, e)) => Err(e),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    async fn record(&self, call: EngineCall) {
        self.calls.write().await.push(call);
    }

    async fn with_torrent<T>(
        &self,
        handle: SessionHandle,
        f: impl FnOnce(&mut MockTorrent) -> T,
    ) -> Result<T, EngineError> {
        let mut torrents = self.torrents.write().await;
        let torrent = torrents
            .get_mut(&handle)
            .ok_or(EngineError::TorrentNotFound(handle))?;
        Ok(f(torrent))
    }
}

#[async_trait]
impl Engine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    async fn add_torrent(
        &self,
        torrent_file: &Path,
        save_dir: &Path,
        mode: StorageMode,
    ) -> Result<SessionHandle, EngineError> {
        self.take_failure("add_torrent").await?;

        if !torrent_file.is_file() {
            return Err(EngineError::InvalidTorrent(format!(
                "{} does not exist",
                torrent_file.display()
            )));
        }

        let name = torrent_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let size = 1024 * 1024;
        let handle = SessionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst) + 1);

        self.torrents.write().await.insert(
            handle,
            MockTorrent {
                torrent_file: torrent_file.to_path_buf(),
                snapshot: TorrentSnapshot {
                    name: name.clone(),
                    total_wanted: size,
                    num_files: 1,
                    ..Default::default()
                },
                files: vec![FileEntry {
                    path: format!("{}/data.bin", name),
                    size_bytes: size,
                }],
                peers: Vec::new(),
                filter: None,
            },
        );

        self.record(EngineCall::AddTorrent {
            path: torrent_file.to_path_buf(),
            save_dir: save_dir.to_path_buf(),
            mode,
        })
        .await;
        Ok(handle)
    }

    async fn remove_torrent(&self, handle: SessionHandle) -> Result<(), EngineError> {
        self.take_failure("remove_torrent").await?;
        self.torrents
            .write()
            .await
            .remove(&handle)
            .ok_or(EngineError::TorrentNotFound(handle))?;
        self.record(EngineCall::RemoveTorrent(handle)).await;
        Ok(())
    }

    async fn pause(&self, handle: SessionHandle) -> Result<(), EngineError> {
        self.take_failure("pause").await?;
        self.with_torrent(handle, |t| t.snapshot.is_paused = true)
            .await?;
        self.record(EngineCall::Pause(handle)).await;
        Ok(())
    }

    async fn resume(&self, handle: SessionHandle) -> Result<(), EngineError> {
        self.take_failure("resume").await?;
        self.with_torrent(handle, |t| t.snapshot.is_paused = false)
            .await?;
        self.record(EngineCall::Resume(handle)).await;
        Ok(())
    }

    async fn torrent_state(&self, handle: SessionHandle) -> Result<TorrentSnapshot, EngineError> {
        self.take_failure("torrent_state").await?;
        self.state_queries.fetch_add(1, Ordering::SeqCst);
        self.with_torrent(handle, |t| t.snapshot.clone()).await
    }

    async fn peer_info(&self, handle: SessionHandle) -> Result<Vec<PeerInfo>, EngineError> {
        self.take_failure("peer_info").await?;
        self.with_torrent(handle, |t| t.peers.clone()).await
    }

    async fn file_info(&self, handle: SessionHandle) -> Result<Vec<FileEntry>, EngineError> {
        self.take_failure("file_info").await?;
        self.with_torrent(handle, |t| t.files.clone()).await
    }

    async fn set_file_filter(
        &self,
        handle: SessionHandle,
        filter: &[bool],
    ) -> Result<(), EngineError> {
        self.take_failure("set_file_filter").await?;
        let expected = self.with_torrent(handle, |t| t.files.len()).await?;
        if filter.len() != expected {
            return Err(EngineError::InvalidArgument(format!(
                "filter has {} entries, torrent has {} files",
                filter.len(),
                expected
            )));
        }
        self.with_torrent(handle, |t| t.filter = Some(filter.to_vec()))
            .await?;
        self.record(EngineCall::SetFileFilter(handle, filter.to_vec()))
            .await;
        Ok(())
    }

    async fn session_info(&self) -> Result<SessionSnapshot, EngineError> {
        self.take_failure("session_info").await?;
        Ok(self.session.read().await.clone())
    }

    async fn is_listening(&self) -> Result<bool, EngineError> {
        self.take_failure("is_listening").await?;
        Ok(true)
    }

    async fn listening_port(&self) -> Result<u16, EngineError> {
        self.take_failure("listening_port").await?;
        Ok(6881)
    }

    async fn dht_node_count(&self) -> Result<u64, EngineError> {
        self.take_failure("dht_node_count").await?;
        Ok(0)
    }

    async fn pop_event(&self) -> Result<Option<EngineEvent>, EngineError> {
        self.take_failure("pop_event").await?;
        Ok(self.events.write().await.pop_front())
    }

    async fn torrent_count(&self) -> Result<usize, EngineError> {
        self.take_failure("torrent_count").await?;
        Ok(self.torrents.read().await.len())
    }

    async fn set_download_rate_limit(&self, limit: i64) -> Result<(), EngineError> {
        self.take_failure("set_download_rate_limit").await?;
        self.record(EngineCall::SetDownloadRateLimit(limit)).await;
        Ok(())
    }

    async fn set_upload_rate_limit(&self, limit: i64) -> Result<(), EngineError> {
        self.take_failure("set_upload_rate_limit").await?;
        self.record(EngineCall::SetUploadRateLimit(limit)).await;
        Ok(())
    }

    async fn set_listen_on(&self, first: u16, last: u16) -> Result<(), EngineError> {
        self.take_failure("set_listen_on").await?;
        self.record(EngineCall::SetListenOn(first, last)).await;
        Ok(())
    }

    async fn set_max_connections(&self, limit: i64) -> Result<(), EngineError> {
        self.take_failure("set_max_connections").await?;
        self.record(EngineCall::SetMaxConnections(limit)).await;
        Ok(())
    }

    async fn set_max_uploads(&self, limit: i64) -> Result<(), EngineError> {
        self.take_failure("set_max_uploads").await?;
        self.record(EngineCall::SetMaxUploads(limit)).await;
        Ok(())
    }

    async fn save_fastresume(
        &self,
        handle: SessionHandle,
        torrent_file: &Path,
    ) -> Result<(), EngineError> {
        self.take_failure("save_fastresume").await?;
        let progress = self.with_torrent(handle, |t| t.snapshot.progress).await?;
        std::fs::write(fastresume_path(torrent_file), format!("progress={}", progress))
            .map_err(|e| EngineError::Io(e.to_string()))?;
        self.record(EngineCall::SaveFastresume(handle)).await;
        Ok(())
    }

    async fn start_dht(&self, state_file: Option<&Path>) -> Result<(), EngineError> {
        self.take_failure("start_dht").await?;
        self.record(EngineCall::StartDht(state_file.map(Path::to_path_buf)))
            .await;
        Ok(())
    }

    async fn stop_dht(&self, state_file: &Path) -> Result<(), EngineError> {
        self.take_failure("stop_dht").await?;
        self.record(EngineCall::StopDht(state_file.to_path_buf()))
            .await;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), EngineError> {
        self.take_failure("shutdown").await?;
        self.record(EngineCall::Shutdown).await;
        Ok(())
    }
}
