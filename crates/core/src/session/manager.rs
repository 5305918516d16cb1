//! The session manager: owns the registry and drives the engine.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::events::{tracker_update, FINISHED_DOWNLOADING};
use super::registry::TorrentRegistry;
use super::sync::Synchronizer;
use super::{
    AddTorrentRequest, Lifecycle, SessionError, SessionStatus, ShutdownReport, SyncReport,
    TorrentAnnotations, TorrentStatus,
};
use crate::cache::{CachedQuery, Clock, SystemClock};
use crate::catalog::{fastresume_path, Catalog, FileFilter};
use crate::config::SessionConfig;
use crate::disk::{DiskSpace, FsDiskSpace};
use crate::engine::{
    Engine, EngineError, EngineEvent, FileEntry, PeerInfo, SessionHandle, StorageMode, TorrentSnapshot,
};
use crate::metrics::{ENGINE_EVENTS, QUEUE_TRANSITIONS};
use crate::prefs::{PrefValue, Preference, PreferenceStore, PreferenceTable};
use crate::queue::{
    compute_ratio, plan_transitions, seeds_to_demote, QueueAction, QueueEntry, QueueError,
    QueueOrder, QueueReport, RatioAction,
};

/// Buffer size for the engine event broadcast.
const EVENT_BUFFER_SIZE: usize = 256;

type Reorder = fn(&mut QueueOrder, SessionHandle) -> Result<bool, QueueError>;

/// Registry facts the queue pass needs about one handle.
struct Queued {
    handle: SessionHandle,
    user_paused: bool,
    uploaded_credit: u64,
    storage_mode: StorageMode,
    save_directory: PathBuf,
}

/// Owns the managed torrents and keeps the engine in line with them.
///
/// All methods take `&self`; wrap the manager in an `Arc` to share it with
/// the poll loop and callers.
pub struct SessionManager {
    config: SessionConfig,
    engine: Arc<dyn Engine>,
    prefs: PreferenceStore,
    registry: Arc<Mutex<TorrentRegistry>>,
    synchronizer: Synchronizer,
    lifecycle: RwLock<Lifecycle>,
    dht_running: AtomicBool,
    torrent_states: CachedQuery<SessionHandle, TorrentSnapshot>,
    peer_infos: CachedQuery<SessionHandle, Vec<PeerInfo>>,
    annotations: RwLock<HashMap<SessionHandle, TorrentAnnotations>>,
    disk: Arc<dyn DiskSpace>,
    /// `max_active_torrents` as it was before `pause_all`.
    paused_limit: Mutex<Option<PrefValue>>,
    events_tx: broadcast::Sender<EngineEvent>,
    shutdown_tx: broadcast::Sender<()>,
}

impl SessionManager {
    /// Create a manager over `engine`. Nothing happens until `start`.
    pub fn new(config: SessionConfig, engine: Arc<dyn Engine>) -> Self {
        Self::with_clock(config, engine, Arc::new(SystemClock))
    }

    /// Create a manager whose caches expire by `clock`.
    pub fn with_clock(config: SessionConfig, engine: Arc<dyn Engine>, clock: Arc<dyn Clock>) -> Self {
        let registry = Arc::new(Mutex::new(TorrentRegistry::new(Catalog::new(
            config.torrents_dir(),
        ))));
        let synchronizer = Synchronizer::new(Arc::clone(&engine), Arc::clone(&registry));

        let state_engine = Arc::clone(&engine);
        let torrent_states = CachedQuery::new(
            "torrent_state",
            config.cache_ttl(),
            Arc::clone(&clock),
            Arc::new(move |handle: SessionHandle| {
                let engine = Arc::clone(&state_engine);
                async move { engine.torrent_state(handle).await }.boxed()
            }),
        );

        let peer_engine = Arc::clone(&engine);
        let peer_infos = CachedQuery::new(
            "peer_info",
            config.cache_ttl(),
            clock,
            Arc::new(move |handle: SessionHandle| {
                let engine = Arc::clone(&peer_engine);
                async move { engine.peer_info(handle).await }.boxed()
            }),
        );

        let (events_tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            prefs: PreferenceStore::new(Arc::clone(&engine)),
            config,
            engine,
            registry,
            synchronizer,
            lifecycle: RwLock::new(Lifecycle::Uninitialized),
            dht_running: AtomicBool::new(false),
            torrent_states,
            peer_infos,
            annotations: RwLock::new(HashMap::new()),
            disk: Arc::new(FsDiskSpace),
            paused_limit: Mutex::new(None),
            events_tx,
            shutdown_tx,
        }
    }

    /// Replace the free space source used before resuming downloads.
    pub fn with_disk_space(mut self, disk: Arc<dyn DiskSpace>) -> Self {
        self.disk = disk;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn prefs(&self) -> &PreferenceStore {
        &self.prefs
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read().await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Load saved state, configure the engine and admit every saved torrent.
    ///
    /// On failure the manager returns to `Uninitialized` and may be started
    /// again.
    pub async fn start(&self) -> Result<(), SessionError> {
        self.transition(Lifecycle::Uninitialized, Lifecycle::Starting, "start")
            .await?;
        info!(
            engine = self.engine.name(),
            base_dir = %self.config.base_dir.display(),
            blank_slate = self.config.blank_slate,
            "Starting session"
        );

        match self.start_inner().await {
            Ok(()) => {
                self.set_lifecycle(Lifecycle::Running).await;
                info!(torrents = self.queue().await.len(), "Session running");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Session start failed");
                self.set_lifecycle(Lifecycle::Uninitialized).await;
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<(), SessionError> {
        if !self.config.blank_slate {
            self.prefs
                .replace(PreferenceTable::load_or_default(&self.config.prefs_path()))
                .await;
        }
        self.prefs.apply_all().await?;

        if self.prefs.use_dht().await {
            let state_file = self.config.dht_state_path();
            let restore = (!self.config.blank_slate && state_file.is_file())
                .then_some(state_file.as_path());
            match self.engine.start_dht(restore).await {
                Ok(()) => self.dht_running.store(true, Ordering::SeqCst),
                Err(e) => warn!(error = %e, "Failed to start DHT"),
            }
        }

        let catalog = if self.config.blank_slate {
            Catalog::new(self.config.torrents_dir())
        } else {
            Catalog::load_or_empty(&self.config.catalog_path(), self.config.torrents_dir())
        };
        *self.registry.lock().await = TorrentRegistry::new(catalog);

        let gate = self.synchronizer.lock().await;
        let report = self.synchronizer.sync(&gate).await;
        drop(gate);
        for failure in &report.failed {
            warn!(record = %failure.record, error = %failure.error, "Saved torrent could not be restored");
        }

        self.reapply_file_filters().await;
        self.apply_queue_pass(false).await;
        Ok(())
    }

    async fn reapply_file_filters(&self) {
        let filters: Vec<(SessionHandle, FileFilter)> = {
            let registry = self.registry.lock().await;
            registry
                .queue()
                .as_slice()
                .iter()
                .filter_map(|h| {
                    let filter = registry.record(*h)?.file_filter.clone()?;
                    Some((*h, filter))
                })
                .collect()
        };

        for (handle, filter) in filters {
            if let Err(e) = self.engine.set_file_filter(handle, filter.as_slice()).await {
                warn!(handle = %handle, error = %e, "Failed to restore file filter");
            }
        }
    }

    /// Persist everything and shut the engine down.
    ///
    /// Every step is attempted; failures are logged and collected in the
    /// report rather than returned.
    pub async fn stop(&self) -> Result<ShutdownReport, SessionError> {
        self.transition(Lifecycle::Running, Lifecycle::Stopping, "stop")
            .await?;
        info!("Stopping session");

        // No receivers is fine.
        let _ = self.shutdown_tx.send(());

        let mut report = ShutdownReport::default();
        let _gate = self.synchronizer.lock().await;

        for handle in self.queue().await {
            match self.engine.torrent_state(handle).await {
                Ok(state) => {
                    if let Some(record) = self.registry.lock().await.record_mut(handle) {
                        record.uploaded_credit = record.uploaded_credit.saturating_add(state.total_upload);
                        report.credited += 1;
                    }
                }
                Err(e) => {
                    warn!(handle = %handle, error = %e, "Could not read upload total");
                    report.record("upload_credit", format!("{}: {}", handle, e));
                }
            }
        }

        if let Err(e) = self.prefs.snapshot().await.save(&self.config.prefs_path()) {
            error!(error = %e, "Failed to save preferences");
            report.record("save_preferences", e);
        }

        {
            let registry = self.registry.lock().await;
            if let Err(e) = registry
                .catalog()
                .save(&self.config.catalog_path(), &registry.queue_record_ids())
            {
                error!(error = %e, "Failed to save catalog");
                report.record("save_catalog", e);
            }
        }

        let (saved, errors) = self.save_all_fastresume().await;
        report.fastresume_saved = saved;
        for e in errors {
            report.record("save_fastresume", e);
        }

        if self.dht_running.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.engine.stop_dht(&self.config.dht_state_path()).await {
                warn!(error = %e, "Failed to stop DHT");
                report.record("stop_dht", e);
            }
        }

        if let Err(e) = self.engine.shutdown().await {
            warn!(error = %e, "Engine shutdown failed");
            report.record("shutdown_engine", e);
        }

        self.set_lifecycle(Lifecycle::Stopped).await;
        info!(
            clean = report.is_clean(),
            failures = report.failures.len(),
            "Session stopped"
        );
        Ok(report)
    }

    /// Spawn the background loop that drains events and applies the queue
    /// every `poll_interval_ms`. It exits when the session stops.
    pub fn spawn_poll_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = self.config.poll_interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            info!("Poll loop started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Poll loop received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if manager.lifecycle().await != Lifecycle::Running {
                            break;
                        }
                        manager.poll_once().await;
                    }
                }
            }
            info!("Poll loop stopped");
        })
    }

    /// One poll iteration: drain events, then apply the queue.
    pub async fn poll_once(&self) {
        if let Err(e) = self.handle_events().await {
            warn!(error = %e, "Event handling failed");
        }
        if let Err(e) = self.apply_queue(true).await {
            warn!(error = %e, "Queue pass failed");
        }
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Add a torrent file and admit it to the engine.
    pub async fn add_torrent(&self, request: AddTorrentRequest) -> Result<SessionHandle, SessionError> {
        self.ensure_running("add a torrent").await?;

        let gate = self.synchronizer.lock().await;
        let id = self.registry.lock().await.catalog_mut().add(
            &request.torrent_file,
            &request.save_directory,
            request.storage_mode,
            request.paused,
        )?;
        let report = self.synchronizer.sync(&gate).await;
        drop(gate);

        if let Some(failure) = report.failure_for(id) {
            return Err(failure.error.clone().into());
        }
        let handle = self
            .registry
            .lock()
            .await
            .handles()
            .handle_of(id)
            .ok_or_else(|| EngineError::Internal(format!("{} has no handle after sync", id)))?;

        info!(
            handle = %handle,
            record = %id,
            file = %request.torrent_file.display(),
            "Torrent added"
        );
        Ok(handle)
    }

    /// Remove a torrent, optionally deleting its downloaded data.
    ///
    /// Downloaded files that are already gone are not an error.
    pub async fn remove_torrent(&self, handle: SessionHandle, delete_data: bool) -> Result<(), SessionError> {
        self.ensure_running("remove a torrent").await?;

        let gate = self.synchronizer.lock().await;
        let (id, save_directory) = {
            let registry = self.registry.lock().await;
            let record = registry
                .record(handle)
                .ok_or(SessionError::UnknownTorrent(handle))?;
            (record.id, record.save_directory.clone())
        };

        let files = if delete_data {
            match self.engine.file_info(handle).await {
                Ok(files) => files,
                Err(e) => {
                    warn!(handle = %handle, error = %e, "Could not list files, data left in place");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        self.registry
            .lock()
            .await
            .catalog_mut()
            .mark_for_removal(id)?;
        let report = self.synchronizer.sync(&gate).await;
        drop(gate);

        if let Some(failure) = report.failure_for(id) {
            return Err(failure.error.clone().into());
        }
        self.forget(handle).await;

        if delete_data {
            delete_downloaded_files(&save_directory, &files).await;
        }
        info!(handle = %handle, record = %id, delete_data, "Torrent removed");
        Ok(())
    }

    /// Remove every torrent that has finished downloading. Downloaded data
    /// is kept. Returns the removed handles.
    pub async fn clear_completed(&self) -> Result<Vec<SessionHandle>, SessionError> {
        self.ensure_running("clear completed torrents").await?;

        let gate = self.synchronizer.lock().await;
        let mut completed = Vec::new();
        for handle in self.queue().await {
            match self.torrent_states.get(handle, false).await {
                Ok(state) if state.is_complete() => completed.push(handle),
                Ok(_) => {}
                Err(e) => warn!(handle = %handle, error = %e, "Could not read torrent state"),
            }
        }
        if completed.is_empty() {
            return Ok(Vec::new());
        }

        {
            let mut registry = self.registry.lock().await;
            for handle in &completed {
                if let Some(id) = registry.handles().record_of(*handle) {
                    registry.catalog_mut().mark_for_removal(id)?;
                }
            }
        }
        let report = self.synchronizer.sync(&gate).await;
        drop(gate);

        for handle in &report.removed {
            self.forget(*handle).await;
        }
        info!(removed = report.removed.len(), "Cleared completed torrents");
        Ok(report.removed)
    }

    /// Run the synchronizer on demand.
    pub async fn sync(&self) -> Result<SyncReport, SessionError> {
        self.ensure_running("sync").await?;
        let gate = self.synchronizer.lock().await;
        Ok(self.synchronizer.sync(&gate).await)
    }

    async fn forget(&self, handle: SessionHandle) {
        self.torrent_states.invalidate(&handle).await;
        self.peer_infos.invalidate(&handle).await;
        self.annotations.write().await.remove(&handle);
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Handles in queue order.
    pub async fn queue(&self) -> Vec<SessionHandle> {
        self.registry.lock().await.queue().as_slice().to_vec()
    }

    /// Engine state plus bookkeeping for one torrent.
    pub async fn get_torrent_state(&self, handle: SessionHandle) -> Result<TorrentStatus, SessionError> {
        self.ensure_running("query a torrent").await?;

        let (queue_position, record) = {
            let registry = self.registry.lock().await;
            let position = registry
                .queue()
                .position(handle)
                .ok_or(SessionError::UnknownTorrent(handle))?;
            let record = registry
                .record(handle)
                .cloned()
                .ok_or(SessionError::UnknownTorrent(handle))?;
            (position, record)
        };

        let state = self.torrent_states.get(handle, false).await?;
        let annotations = self
            .annotations
            .read()
            .await
            .get(&handle)
            .cloned()
            .unwrap_or_default();

        Ok(TorrentStatus {
            handle,
            record: record.id,
            queue_position,
            save_directory: record.save_directory,
            storage_mode: record.storage_mode,
            user_paused: record.user_paused,
            total_uploaded: record.uploaded_credit.saturating_add(state.total_upload),
            ratio: compute_ratio(state.total_upload, record.uploaded_credit, state.total_done),
            state,
            annotations,
        })
    }

    /// Connected peers of one torrent.
    pub async fn get_torrent_peer_info(&self, handle: SessionHandle) -> Result<Vec<PeerInfo>, SessionError> {
        self.ensure_running("query a torrent").await?;
        if !self.registry.lock().await.queue().contains(handle) {
            return Err(SessionError::UnknownTorrent(handle));
        }
        Ok(self.peer_infos.get(handle, false).await?)
    }

    /// Session-wide counters.
    pub async fn get_session_state(&self) -> Result<SessionStatus, SessionError> {
        self.ensure_running("query the session").await?;

        let engine = self.engine.session_info().await?;
        let is_listening = self.engine.is_listening().await?;
        let listening_port = self.engine.listening_port().await?;
        let dht_nodes = if self.dht_running.load(Ordering::SeqCst) {
            Some(self.engine.dht_node_count().await?)
        } else {
            None
        };

        Ok(SessionStatus {
            lifecycle: Lifecycle::Running,
            torrent_count: self.registry.lock().await.queue().len(),
            is_listening,
            listening_port,
            dht_nodes,
            engine,
        })
    }

    /// Subscribe to drained engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events_tx.subscribe()
    }

    // =========================================================================
    // Queue
    // =========================================================================

    /// Enforce queue order and limits.
    ///
    /// With `efficient == false` every torrent's state is read fresh from the
    /// engine.
    pub async fn apply_queue(&self, efficient: bool) -> Result<QueueReport, SessionError> {
        self.ensure_running("apply the queue").await?;
        Ok(self.apply_queue_pass(efficient).await)
    }

    async fn apply_queue_pass(&self, efficient: bool) -> QueueReport {
        let mut report = QueueReport::default();

        let queued: Vec<Queued> = {
            let registry = self.registry.lock().await;
            registry
                .queue()
                .as_slice()
                .iter()
                .filter_map(|h| {
                    let record = registry.record(*h)?;
                    Some(Queued {
                        handle: *h,
                        user_paused: record.user_paused,
                        uploaded_credit: record.uploaded_credit,
                        storage_mode: record.storage_mode,
                        save_directory: record.save_directory.clone(),
                    })
                })
                .collect()
        };

        let mut entries = Vec::with_capacity(queued.len());
        for (position, torrent) in queued.iter().enumerate() {
            match self.torrent_states.get(torrent.handle, !efficient).await {
                Ok(state) => entries.push(QueueEntry {
                    handle: torrent.handle,
                    position,
                    is_paused: state.is_paused,
                    is_seed: state.is_seed,
                    user_paused: torrent.user_paused,
                    uploaded_this_session: state.total_upload,
                    uploaded_credit: torrent.uploaded_credit,
                    downloaded_total: state.total_done,
                    remaining: state.total_wanted.saturating_sub(state.total_wanted_done),
                    free_space: None,
                }),
                Err(e) => {
                    warn!(handle = %torrent.handle, error = %e, "Could not read torrent state, skipping");
                    report.failed.push(torrent.handle);
                }
            }
        }

        if let Some(ratio) = self.prefs.auto_seed_ratio().await {
            let at_ratio = seeds_to_demote(&entries, ratio);
            let action = RatioAction::select(
                self.prefs.auto_end_seeding().await,
                self.prefs.clear_max_ratio_torrents().await,
            );
            match action {
                RatioAction::Remove => self.remove_seeds(&at_ratio, &mut report).await,
                RatioAction::MoveToBottom | RatioAction::EndSeeding => {
                    self.demote_seeds(&at_ratio, ratio, &mut report).await;
                    if action == RatioAction::EndSeeding {
                        self.end_seeding(&at_ratio, &mut entries, &mut report).await;
                    }
                }
            }
        }

        // Demotions and removals moved things; plan against the order as it
        // is now.
        let order = self.queue().await;
        entries.retain_mut(|entry| match order.iter().position(|h| *h == entry.handle) {
            Some(position) => {
                entry.position = position;
                true
            }
            None => false,
        });
        entries.sort_by_key(|entry| entry.position);

        let max_active = self.prefs.max_active_torrents().await;
        for entry in entries.iter_mut() {
            let due = entry.is_paused
                && !entry.user_paused
                && !entry.is_seed
                && max_active.is_none_or(|limit| entry.position < limit);
            if !due {
                continue;
            }
            let Some(torrent) = queued
                .iter()
                .find(|q| q.handle == entry.handle && q.storage_mode == StorageMode::Sparse)
            else {
                continue;
            };
            match self.disk.available(&torrent.save_directory) {
                Ok(available) => entry.free_space = Some(available),
                Err(e) => warn!(
                    handle = %entry.handle,
                    dir = %torrent.save_directory.display(),
                    error = %e,
                    "Could not read free space"
                ),
            }
        }

        for action in plan_transitions(&entries, max_active) {
            let (handle, result) = match action {
                QueueAction::Hold {
                    handle,
                    needed,
                    available,
                } => {
                    warn!(handle = %handle, needed, available, "Not enough free space to resume torrent");
                    if let Some(record) = self.registry.lock().await.record_mut(handle) {
                        record.user_paused = true;
                    }
                    QUEUE_TRANSITIONS.with_label_values(&["hold"]).inc();
                    report.held.push(handle);
                    continue;
                }
                QueueAction::Resume(h) => (h, self.engine.resume(h).await),
                QueueAction::Pause(h) => (h, self.engine.pause(h).await),
            };
            // The cached is_paused is stale either way.
            self.torrent_states.invalidate(&handle).await;

            match (action, result) {
                (QueueAction::Resume(_), Ok(())) => {
                    debug!(handle = %handle, "Queue resumed torrent");
                    QUEUE_TRANSITIONS.with_label_values(&["resume"]).inc();
                    report.resumed.push(handle);
                }
                (_, Ok(())) => {
                    debug!(handle = %handle, "Queue paused torrent");
                    QUEUE_TRANSITIONS.with_label_values(&["pause"]).inc();
                    report.paused.push(handle);
                }
                (_, Err(e)) => {
                    warn!(handle = %handle, error = %e, "Queue command failed");
                    report.failed.push(handle);
                }
            }
        }

        if !report.is_noop() {
            info!(
                demoted = report.demoted.len(),
                ended_seeding = report.ended_seeding.len(),
                removed = report.removed.len(),
                held = report.held.len(),
                resumed = report.resumed.len(),
                paused = report.paused.len(),
                "Queue applied"
            );
        }
        report
    }

    /// Move seeds at the ratio to the bottom, keeping their relative order.
    async fn demote_seeds(&self, at_ratio: &[SessionHandle], ratio: f64, report: &mut QueueReport) {
        let mut registry = self.registry.lock().await;
        // Already sitting at the bottom in this order: nothing to move.
        if registry.queue().as_slice().ends_with(at_ratio) {
            return;
        }
        for handle in at_ratio {
            if registry.queue_mut().move_to_bottom(*handle).is_ok() {
                debug!(handle = %handle, ratio, "Seed reached ratio, moved to bottom");
                report.demoted.push(*handle);
            }
        }
        QUEUE_TRANSITIONS
            .with_label_values(&["demote"])
            .inc_by(report.demoted.len() as u64);
    }

    /// User-pause seeds at the ratio so the plan below stops them.
    async fn end_seeding(
        &self,
        at_ratio: &[SessionHandle],
        entries: &mut [QueueEntry],
        report: &mut QueueReport,
    ) {
        let mut registry = self.registry.lock().await;
        for entry in entries.iter_mut() {
            if entry.user_paused || !at_ratio.contains(&entry.handle) {
                continue;
            }
            if let Some(record) = registry.record_mut(entry.handle) {
                record.user_paused = true;
                entry.user_paused = true;
                info!(handle = %entry.handle, "Seed reached ratio, seeding ended");
                QUEUE_TRANSITIONS.with_label_values(&["end_seeding"]).inc();
                report.ended_seeding.push(entry.handle);
            }
        }
    }

    /// Remove seeds at the ratio from the session. Their data stays on disk.
    async fn remove_seeds(&self, at_ratio: &[SessionHandle], report: &mut QueueReport) {
        if at_ratio.is_empty() {
            return;
        }

        let gate = self.synchronizer.lock().await;
        {
            let mut registry = self.registry.lock().await;
            for handle in at_ratio {
                let Some(id) = registry.handles().record_of(*handle) else {
                    continue;
                };
                if let Err(e) = registry.catalog_mut().mark_for_removal(id) {
                    warn!(handle = %handle, error = %e, "Could not mark seed for removal");
                }
            }
        }
        let sync = self.synchronizer.sync(&gate).await;
        drop(gate);

        for failure in &sync.failed {
            warn!(record = %failure.record, error = %failure.error, "Seed at ratio could not be removed");
        }
        for handle in sync.removed {
            self.forget(handle).await;
            if at_ratio.contains(&handle) {
                info!(handle = %handle, "Seed reached ratio, removed");
                QUEUE_TRANSITIONS.with_label_values(&["remove"]).inc();
                report.removed.push(handle);
            }
        }
    }

    /// Stop every torrent by dropping the active limit to zero. The previous
    /// limit is kept for `resume_all`. A no-op when the limit is already zero.
    pub async fn pause_all(&self) -> Result<QueueReport, SessionError> {
        self.ensure_running("pause all torrents").await?;

        let current = self.prefs.value(Preference::MaxActiveTorrents).await;
        if current.as_int() != Some(0) {
            *self.paused_limit.lock().await = Some(current);
            self.prefs
                .set(Preference::MaxActiveTorrents.name(), PrefValue::Int(0))
                .await?;
            info!("All torrents paused");
        }
        Ok(self.apply_queue_pass(false).await)
    }

    /// Undo `pause_all`, restoring the limit it replaced (the default when
    /// none was kept). A no-op unless the limit is zero.
    pub async fn resume_all(&self) -> Result<QueueReport, SessionError> {
        self.ensure_running("resume all torrents").await?;

        if self.prefs.value(Preference::MaxActiveTorrents).await.as_int() == Some(0) {
            let restored = self
                .paused_limit
                .lock()
                .await
                .take()
                .unwrap_or_else(|| Preference::MaxActiveTorrents.default_value());
            self.prefs
                .set(Preference::MaxActiveTorrents.name(), restored.clone())
                .await?;
            info!(max_active_torrents = %restored, "All torrents resumed");
        }
        Ok(self.apply_queue_pass(false).await)
    }

    /// Swap a torrent with the one ahead of it.
    pub async fn move_up(&self, handle: SessionHandle) -> Result<bool, SessionError> {
        self.reorder(handle, QueueOrder::move_up).await
    }

    /// Swap a torrent with the one behind it.
    pub async fn move_down(&self, handle: SessionHandle) -> Result<bool, SessionError> {
        self.reorder(handle, QueueOrder::move_down).await
    }

    pub async fn move_to_top(&self, handle: SessionHandle) -> Result<bool, SessionError> {
        self.reorder(handle, QueueOrder::move_to_top).await
    }

    pub async fn move_to_bottom(&self, handle: SessionHandle) -> Result<bool, SessionError> {
        self.reorder(handle, QueueOrder::move_to_bottom).await
    }

    async fn reorder(&self, handle: SessionHandle, op: Reorder) -> Result<bool, SessionError> {
        self.ensure_running("reorder the queue").await?;
        let moved = op(self.registry.lock().await.queue_mut(), handle)?;
        Ok(moved)
    }

    /// Pause or release a torrent on the user's behalf, then apply the queue.
    pub async fn set_user_pause(&self, handle: SessionHandle, paused: bool) -> Result<QueueReport, SessionError> {
        self.ensure_running("pause a torrent").await?;
        self.registry
            .lock()
            .await
            .record_mut(handle)
            .ok_or(SessionError::UnknownTorrent(handle))?
            .user_paused = paused;
        info!(handle = %handle, paused, "User pause changed");
        Ok(self.apply_queue_pass(false).await)
    }

    // =========================================================================
    // Files
    // =========================================================================

    /// Choose which files of a torrent to skip (`true`) or download.
    pub async fn set_file_filter(&self, handle: SessionHandle, skip: Vec<bool>) -> Result<(), SessionError> {
        self.ensure_running("set a file filter").await?;
        if !self.registry.lock().await.handles().contains(handle) {
            return Err(SessionError::UnknownTorrent(handle));
        }

        let files = self.engine.file_info(handle).await?;
        if files.len() != skip.len() {
            return Err(SessionError::InvalidFileFilter {
                handle,
                expected: files.len(),
                actual: skip.len(),
            });
        }
        self.engine.set_file_filter(handle, &skip).await?;

        if let Some(record) = self.registry.lock().await.record_mut(handle) {
            record.file_filter = Some(FileFilter::new(skip));
        }
        Ok(())
    }

    /// The saved file filter of a torrent, `None` if every file is wanted.
    pub async fn file_filter(&self, handle: SessionHandle) -> Result<Option<FileFilter>, SessionError> {
        let registry = self.registry.lock().await;
        let record = registry
            .record(handle)
            .ok_or(SessionError::UnknownTorrent(handle))?;
        Ok(record.file_filter.clone())
    }

    /// Write fast-resume data for one torrent, or for all of them.
    ///
    /// For a single torrent errors propagate; for all torrents failures are
    /// logged and skipped. Returns the number written.
    pub async fn save_fastresume_data(&self, only: Option<SessionHandle>) -> Result<usize, SessionError> {
        self.ensure_running("save fast-resume data").await?;
        match only {
            Some(handle) => {
                self.save_fastresume_for(handle).await?;
                Ok(1)
            }
            None => Ok(self.save_all_fastresume().await.0),
        }
    }

    async fn save_all_fastresume(&self) -> (usize, Vec<SessionError>) {
        let mut saved = 0;
        let mut errors = Vec::new();
        for handle in self.queue().await {
            match self.save_fastresume_for(handle).await {
                Ok(()) => saved += 1,
                Err(e) => {
                    warn!(handle = %handle, error = %e, "Unable to save fast-resume data");
                    errors.push(e);
                }
            }
        }
        (saved, errors)
    }

    async fn save_fastresume_for(&self, handle: SessionHandle) -> Result<(), SessionError> {
        let torrent_file = self
            .registry
            .lock()
            .await
            .record(handle)
            .map(|r| r.source_path.clone())
            .ok_or(SessionError::UnknownTorrent(handle))?;

        let sidecar = fastresume_path(&torrent_file);
        match tokio::fs::remove_file(&sidecar).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                return Err(SessionError::Io {
                    path: sidecar,
                    source: e,
                });
            }
            _ => {}
        }

        self.engine.save_fastresume(handle, &torrent_file).await?;
        debug!(handle = %handle, "Fast-resume data saved");
        Ok(())
    }

    // =========================================================================
    // Preferences
    // =========================================================================

    pub async fn get_pref(&self, name: &str) -> Result<PrefValue, SessionError> {
        Ok(self.prefs.get(name).await?)
    }

    /// Store a preference and push it to the engine.
    pub async fn set_pref(&self, name: &str, value: PrefValue) -> Result<(), SessionError> {
        self.ensure_running("change a preference").await?;
        Ok(self.prefs.set(name, value).await?)
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Drain the engine's event queue and act on each event.
    ///
    /// Every drained event is returned and broadcast to subscribers; events
    /// for torrents that are no longer managed are not acted on.
    pub async fn handle_events(&self) -> Result<Vec<EngineEvent>, SessionError> {
        self.ensure_running("handle events").await?;

        // A failed pop ends the drain; what was popped is still handled.
        let mut events = Vec::new();
        loop {
            match self.engine.pop_event().await {
                Ok(Some(event)) => events.push(event),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, drained = events.len(), "Event drain interrupted");
                    break;
                }
            }
        }

        let mut run_queue = false;
        for event in &events {
            ENGINE_EVENTS.with_label_values(&[event.kind()]).inc();
            // No receivers is fine.
            let _ = self.events_tx.send(event.clone());

            let Some(handle) = event.handle() else {
                continue;
            };
            if !self.registry.lock().await.handles().contains(handle) {
                debug!(handle = %handle, kind = event.kind(), "Event for unmanaged torrent");
                continue;
            }

            match event {
                EngineEvent::Finished { message, .. } => {
                    run_queue |= self.on_finished(handle, message).await;
                }
                EngineEvent::FileError { message, .. } => {
                    warn!(handle = %handle, message = %message, "Engine file error");
                }
                _ => {
                    if let Some((status, raw)) = tracker_update(event) {
                        self.annotate(handle, status, raw).await;
                    }
                }
            }
        }

        if run_queue {
            self.apply_queue_pass(false).await;
        }
        Ok(events)
    }

    /// Returns whether the queue needs re-applying.
    async fn on_finished(&self, handle: SessionHandle, message: &str) -> bool {
        info!(handle = %handle, "Torrent finished");
        self.torrent_states.invalidate(&handle).await;

        let mut moved = false;
        if message == FINISHED_DOWNLOADING && self.prefs.queue_seeds_to_bottom().await {
            moved = self
                .registry
                .lock()
                .await
                .queue_mut()
                .move_to_bottom(handle)
                .unwrap_or(false);
        }

        if let Err(e) = self.save_fastresume_for(handle).await {
            warn!(handle = %handle, error = %e, "Unable to save fast-resume data");
        }

        moved || self.prefs.auto_seed_ratio().await.is_some()
    }

    async fn annotate(&self, handle: SessionHandle, status: String, raw: Option<String>) {
        let mut annotations = self.annotations.write().await;
        let entry = annotations.entry(handle).or_default();
        entry.tracker_status = Some(status);
        if raw.is_some() {
            entry.tracker_message = raw;
        }
        entry.updated_at = Some(Utc::now());
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn ensure_running(&self, operation: &'static str) -> Result<(), SessionError> {
        let state = *self.lifecycle.read().await;
        if state == Lifecycle::Running {
            Ok(())
        } else {
            Err(SessionError::InvalidLifecycle { operation, state })
        }
    }

    async fn transition(
        &self,
        from: Lifecycle,
        to: Lifecycle,
        operation: &'static str,
    ) -> Result<(), SessionError> {
        let mut state = self.lifecycle.write().await;
        if *state != from {
            return Err(SessionError::InvalidLifecycle {
                operation,
                state: *state,
            });
        }
        *state = to;
        Ok(())
    }

    async fn set_lifecycle(&self, to: Lifecycle) {
        *self.lifecycle.write().await = to;
    }
}

/// Delete a torrent's downloaded files, then any directories left empty.
///
/// Missing files are expected (never downloaded, or already cleaned up).
async fn delete_downloaded_files(save_directory: &Path, files: &[FileEntry]) {
    let mut dirs = BTreeSet::new();

    for file in files {
        let relative = Path::new(&file.path);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            warn!(path = %file.path, "Refusing to delete path outside save directory");
            continue;
        }

        let path = save_directory.join(relative);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "Deleted downloaded file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Downloaded file already gone");
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete downloaded file"),
        }

        let mut parent = path.parent();
        while let Some(dir) = parent {
            if dir == save_directory {
                break;
            }
            dirs.insert(dir.to_path_buf());
            parent = dir.parent();
        }
    }

    // Deepest first; only empty directories are removed.
    for dir in dirs.iter().rev() {
        let _ = tokio::fs::remove_dir(dir).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixtures, EngineCall, FixedDiskSpace, MockEngine};
    use tempfile::TempDir;

    async fn running() -> (TempDir, Arc<MockEngine>, SessionManager) {
        running_with_disk(Arc::new(FixedDiskSpace::new(u64::MAX))).await
    }

    async fn running_with_disk(disk: Arc<FixedDiskSpace>) -> (TempDir, Arc<MockEngine>, SessionManager) {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(MockEngine::new());
        let manager = SessionManager::new(
            SessionConfig::with_base_dir(dir.path().join("state")),
            Arc::clone(&engine) as Arc<dyn Engine>,
        )
        .with_disk_space(disk);
        manager.start().await.unwrap();
        (dir, engine, manager)
    }

    /// Make `handle` a seed that uploaded twice what it downloaded.
    async fn seed_past_ratio(engine: &MockEngine, handle: SessionHandle) {
        engine.set_progress(handle, 1.0).await;
        engine
            .update_torrent(handle, |s| s.total_upload = s.total_done * 2)
            .await;
    }

    async fn add(dir: &TempDir, manager: &SessionManager, name: &str) -> SessionHandle {
        let file = fixtures::write_torrent_file(&dir.path().join("incoming"), name);
        manager
            .add_torrent(AddTorrentRequest::new(file, dir.path().join("downloads")))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_operations_require_running() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(MockEngine::new());
        let manager = SessionManager::new(
            SessionConfig::with_base_dir(dir.path()),
            engine as Arc<dyn Engine>,
        );

        let err = manager
            .add_torrent(AddTorrentRequest::new("/x.torrent", "/d"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidLifecycle {
                state: Lifecycle::Uninitialized,
                ..
            }
        ));
        assert!(manager.stop().await.is_err());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (_dir, _engine, manager) = running().await;
        assert!(matches!(
            manager.start().await,
            Err(SessionError::InvalidLifecycle {
                state: Lifecycle::Running,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_failed_start_returns_to_uninitialized() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(MockEngine::new());
        engine
            .fail_next("set_listen_on", EngineError::Unavailable("port in use".into()))
            .await;
        let manager = SessionManager::new(
            SessionConfig::with_base_dir(dir.path()),
            Arc::clone(&engine) as Arc<dyn Engine>,
        );

        assert!(manager.start().await.is_err());
        assert_eq!(manager.lifecycle().await, Lifecycle::Uninitialized);

        manager.start().await.unwrap();
        assert_eq!(manager.lifecycle().await, Lifecycle::Running);
    }

    #[tokio::test]
    async fn test_add_duplicate_is_rejected() {
        let (dir, engine, manager) = running().await;
        add(&dir, &manager, "a.torrent").await;

        let file = fixtures::write_torrent_file(&dir.path().join("elsewhere"), "a.torrent");
        let err = manager
            .add_torrent(AddTorrentRequest::new(file, "/d"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Catalog(_)));
        assert_eq!(engine.torrent_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_add_rejected_by_engine_leaves_nothing_behind() {
        let (dir, engine, manager) = running().await;
        engine
            .fail_next("add_torrent", EngineError::InvalidTorrent("truncated".into()))
            .await;

        let file = fixtures::write_torrent_file(&dir.path().join("incoming"), "bad.torrent");
        let err = manager
            .add_torrent(AddTorrentRequest::new(file, "/d"))
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Engine(EngineError::InvalidTorrent(_))));
        assert!(manager.queue().await.is_empty());
        assert!(!manager.config().torrents_dir().join("bad.torrent").exists());
    }

    #[tokio::test]
    async fn test_unknown_torrent_queries() {
        let (_dir, _engine, manager) = running().await;
        let ghost = SessionHandle(42);

        assert!(matches!(
            manager.get_torrent_state(ghost).await,
            Err(SessionError::UnknownTorrent(h)) if h == ghost
        ));
        assert!(matches!(
            manager.get_torrent_peer_info(ghost).await,
            Err(SessionError::UnknownTorrent(_))
        ));
        assert!(matches!(
            manager.remove_torrent(ghost, false).await,
            Err(SessionError::UnknownTorrent(_))
        ));
        assert!(matches!(
            manager.move_up(ghost).await,
            Err(SessionError::Queue(QueueError::UnknownHandle(_)))
        ));
    }

    #[tokio::test]
    async fn test_torrent_state_is_cached() {
        let (dir, engine, manager) = running().await;
        let handle = add(&dir, &manager, "a.torrent").await;

        manager.get_torrent_state(handle).await.unwrap();
        let before = engine.state_queries();
        manager.get_torrent_state(handle).await.unwrap();
        assert_eq!(engine.state_queries(), before);
    }

    #[tokio::test]
    async fn test_torrent_status_fields() {
        let (dir, engine, manager) = running().await;
        let handle = add(&dir, &manager, "a.torrent").await;
        engine
            .update_torrent(handle, |s| {
                s.total_done = 1000;
                s.total_upload = 1500;
            })
            .await;

        let status = manager.get_torrent_state(handle).await.unwrap();
        assert_eq!(status.queue_position, 0);
        assert_eq!(status.total_uploaded, 1500);
        assert_eq!(status.ratio, Some(1.5));
        assert_eq!(status.annotations, TorrentAnnotations::default());
    }

    #[tokio::test]
    async fn test_session_state() {
        let (dir, _engine, manager) = running().await;
        add(&dir, &manager, "a.torrent").await;

        let status = manager.get_session_state().await.unwrap();
        assert_eq!(status.torrent_count, 1);
        assert!(status.is_listening);
        assert_eq!(status.listening_port, 6881);
        assert_eq!(status.dht_nodes, Some(0));
    }

    #[tokio::test]
    async fn test_user_pause_pauses_and_releases() {
        let (dir, engine, manager) = running().await;
        let handle = add(&dir, &manager, "a.torrent").await;

        let report = manager.set_user_pause(handle, true).await.unwrap();
        assert_eq!(report.paused, vec![handle]);
        assert!(engine.torrent_state(handle).await.unwrap().is_paused);

        let report = manager.set_user_pause(handle, false).await.unwrap();
        assert_eq!(report.resumed, vec![handle]);
    }

    #[tokio::test]
    async fn test_failed_state_read_keeps_its_queue_slot() {
        let (dir, engine, manager) = running().await;
        let a = add(&dir, &manager, "a.torrent").await;
        let b = add(&dir, &manager, "b.torrent").await;
        manager
            .set_pref("max_active_torrents", PrefValue::Int(1))
            .await
            .unwrap();
        manager.apply_queue(false).await.unwrap();
        assert!(!engine.torrent_state(a).await.unwrap().is_paused);
        assert!(engine.torrent_state(b).await.unwrap().is_paused);

        // The first fresh read is a's.
        engine
            .fail_next("torrent_state", EngineError::Unavailable("busy".into()))
            .await;
        let report = manager.apply_queue(false).await.unwrap();

        assert_eq!(report.failed, vec![a]);
        assert!(report.resumed.is_empty());
        assert!(engine.torrent_state(b).await.unwrap().is_paused);
    }

    #[tokio::test]
    async fn test_pause_all_then_resume_all_restores_limit() {
        let (dir, engine, manager) = running().await;
        let a = add(&dir, &manager, "a.torrent").await;
        let b = add(&dir, &manager, "b.torrent").await;
        manager
            .set_pref("max_active_torrents", PrefValue::Int(3))
            .await
            .unwrap();

        let report = manager.pause_all().await.unwrap();
        assert_eq!(report.paused, vec![a, b]);
        assert_eq!(
            manager.get_pref("max_active_torrents").await.unwrap(),
            PrefValue::Int(0)
        );

        // Pausing again must not overwrite the kept limit with zero.
        assert!(manager.pause_all().await.unwrap().is_noop());

        let report = manager.resume_all().await.unwrap();
        assert_eq!(report.resumed, vec![a, b]);
        assert_eq!(
            manager.get_pref("max_active_torrents").await.unwrap(),
            PrefValue::Int(3)
        );
        assert!(!engine.torrent_state(b).await.unwrap().is_paused);
    }

    #[tokio::test]
    async fn test_resume_all_without_pause_all_uses_default_limit() {
        let (dir, _engine, manager) = running().await;
        let a = add(&dir, &manager, "a.torrent").await;
        manager
            .set_pref("max_active_torrents", PrefValue::Int(0))
            .await
            .unwrap();
        manager.apply_queue(false).await.unwrap();

        let report = manager.resume_all().await.unwrap();
        assert_eq!(report.resumed, vec![a]);
        assert_eq!(
            manager.get_pref("max_active_torrents").await.unwrap(),
            PrefValue::Int(-1)
        );
    }

    #[tokio::test]
    async fn test_auto_end_seeding_user_pauses_seed() {
        let (dir, engine, manager) = running().await;
        let a = add(&dir, &manager, "a.torrent").await;
        let b = add(&dir, &manager, "b.torrent").await;
        manager
            .set_pref("auto_seed_ratio", PrefValue::Float(1.0))
            .await
            .unwrap();
        manager
            .set_pref("auto_end_seeding", PrefValue::Bool(true))
            .await
            .unwrap();
        seed_past_ratio(&engine, a).await;

        let report = manager.apply_queue(false).await.unwrap();
        assert_eq!(report.demoted, vec![a]);
        assert_eq!(report.ended_seeding, vec![a]);
        assert_eq!(report.paused, vec![a]);
        assert_eq!(manager.queue().await, vec![b, a]);
        assert!(manager.get_torrent_state(a).await.unwrap().user_paused);

        // Ended once; later passes leave it alone.
        assert!(manager.apply_queue(false).await.unwrap().is_noop());
    }

    #[tokio::test]
    async fn test_clear_max_ratio_removes_seed_and_keeps_data() {
        let (dir, engine, manager) = running().await;
        let a = add(&dir, &manager, "a.torrent").await;
        let b = add(&dir, &manager, "b.torrent").await;
        manager
            .set_pref("auto_seed_ratio", PrefValue::Float(1.0))
            .await
            .unwrap();
        manager
            .set_pref("clear_max_ratio_torrents", PrefValue::Bool(true))
            .await
            .unwrap();
        let data = dir.path().join("downloads").join("a").join("data.bin");
        std::fs::create_dir_all(data.parent().unwrap()).unwrap();
        std::fs::write(&data, b"payload").unwrap();
        seed_past_ratio(&engine, a).await;

        let report = manager.apply_queue(false).await.unwrap();
        assert_eq!(report.removed, vec![a]);
        assert!(report.demoted.is_empty());
        assert_eq!(manager.queue().await, vec![b]);
        assert!(!engine.has_torrent(a).await);
        assert!(!manager.config().torrents_dir().join("a.torrent").exists());
        assert!(data.is_file());
    }

    #[tokio::test]
    async fn test_download_without_room_is_held() {
        let disk = Arc::new(FixedDiskSpace::new(1024));
        let (dir, engine, manager) = running_with_disk(Arc::clone(&disk)).await;
        let sparse = add(&dir, &manager, "a.torrent").await;
        let compact = manager
            .add_torrent(
                AddTorrentRequest::new(
                    fixtures::write_torrent_file(&dir.path().join("incoming"), "b.torrent"),
                    dir.path().join("downloads"),
                )
                .with_storage_mode(StorageMode::Compact),
            )
            .await
            .unwrap();
        engine.pause(sparse).await.unwrap();
        engine.pause(compact).await.unwrap();

        let report = manager.apply_queue(false).await.unwrap();
        assert_eq!(report.held, vec![sparse]);
        assert_eq!(report.resumed, vec![compact]);
        assert!(engine.torrent_state(sparse).await.unwrap().is_paused);
        assert!(manager.get_torrent_state(sparse).await.unwrap().user_paused);

        disk.set(u64::MAX);
        let report = manager.set_user_pause(sparse, false).await.unwrap();
        assert_eq!(report.resumed, vec![sparse]);
    }

    #[tokio::test]
    async fn test_file_filter_validation_and_storage() {
        let (dir, engine, manager) = running().await;
        let handle = add(&dir, &manager, "a.torrent").await;
        assert_eq!(manager.file_filter(handle).await.unwrap(), None);

        let err = manager
            .set_file_filter(handle, vec![true, false])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidFileFilter {
                expected: 1,
                actual: 2,
                ..
            }
        ));

        manager.set_file_filter(handle, vec![true]).await.unwrap();
        assert_eq!(
            manager.file_filter(handle).await.unwrap(),
            Some(FileFilter::new(vec![true]))
        );
        assert_eq!(engine.file_filter(handle).await, Some(vec![true]));
    }

    #[tokio::test]
    async fn test_tracker_events_annotate_torrent() {
        let (dir, engine, manager) = running().await;
        let handle = add(&dir, &manager, "a.torrent").await;

        engine
            .push_event(EngineEvent::TrackerAlert {
                handle,
                message: r#"tracker: "http://t.example/announce" timed out"#.to_string(),
                status_code: 503,
                times_in_row: 2,
            })
            .await;
        let events = manager.handle_events().await.unwrap();
        assert_eq!(events.len(), 1);

        let status = manager.get_torrent_state(handle).await.unwrap();
        assert_eq!(
            status.annotations.tracker_status.as_deref(),
            Some("Alert: timed out (HTTP code=503, times in a row=2)")
        );
        assert!(status.annotations.tracker_message.is_some());
        assert!(status.annotations.updated_at.is_some());

        engine.push_event(EngineEvent::TrackerReply { handle }).await;
        manager.handle_events().await.unwrap();
        let status = manager.get_torrent_state(handle).await.unwrap();
        assert_eq!(status.annotations.tracker_status.as_deref(), Some("Announce OK"));
    }

    #[tokio::test]
    async fn test_events_popped_before_a_failed_pop_are_handled() {
        let (dir, engine, manager) = running().await;
        let handle = add(&dir, &manager, "a.torrent").await;
        engine
            .push_event(EngineEvent::Finished {
                handle,
                message: FINISHED_DOWNLOADING.to_string(),
            })
            .await;
        engine.push_event(EngineEvent::TrackerReply { handle }).await;
        engine
            .fail_after("pop_event", 1, EngineError::Unavailable("alert queue closed".into()))
            .await;

        let events = manager.handle_events().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "finished");
        assert!(engine.calls().await.contains(&EngineCall::SaveFastresume(handle)));

        // The rest is picked up by the next drain.
        let events = manager.handle_events().await.unwrap();
        assert_eq!(events.len(), 1);
        let status = manager.get_torrent_state(handle).await.unwrap();
        assert_eq!(status.annotations.tracker_status.as_deref(), Some("Announce OK"));
    }

    #[tokio::test]
    async fn test_events_for_unmanaged_handles_are_returned_only() {
        let (_dir, engine, manager) = running().await;
        let mut rx = manager.subscribe();
        let ghost = SessionHandle(99);
        engine
            .push_event(EngineEvent::Finished {
                handle: ghost,
                message: FINISHED_DOWNLOADING.to_string(),
            })
            .await;

        let events = manager.handle_events().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(rx.recv().await.unwrap().handle(), Some(ghost));
        assert!(!engine
            .calls()
            .await
            .iter()
            .any(|c| matches!(c, EngineCall::SaveFastresume(_))));
    }

    #[tokio::test]
    async fn test_finished_saves_fastresume_and_queues_to_bottom() {
        let (dir, engine, manager) = running().await;
        let a = add(&dir, &manager, "a.torrent").await;
        let b = add(&dir, &manager, "b.torrent").await;
        manager
            .set_pref("queue_seeds_to_bottom", PrefValue::Bool(true))
            .await
            .unwrap();

        engine.set_progress(a, 1.0).await;
        engine
            .push_event(EngineEvent::Finished {
                handle: a,
                message: FINISHED_DOWNLOADING.to_string(),
            })
            .await;
        manager.handle_events().await.unwrap();

        assert_eq!(manager.queue().await, vec![b, a]);
        assert!(engine.calls().await.contains(&EngineCall::SaveFastresume(a)));
        let torrent_file = manager.config().torrents_dir().join("a.torrent");
        assert!(fastresume_path(&torrent_file).is_file());
    }

    #[tokio::test]
    async fn test_clear_completed_removes_only_finished() {
        let (dir, engine, manager) = running().await;
        let a = add(&dir, &manager, "a.torrent").await;
        let b = add(&dir, &manager, "b.torrent").await;
        engine.set_progress(b, 1.0).await;

        let removed = manager.clear_completed().await.unwrap();
        assert_eq!(removed, vec![b]);
        assert_eq!(manager.queue().await, vec![a]);
        assert!(!engine.has_torrent(b).await);
        assert!(!manager.config().torrents_dir().join("b.torrent").exists());
    }

    #[tokio::test]
    async fn test_remove_with_data_deletes_files() {
        let (dir, _engine, manager) = running().await;
        let handle = add(&dir, &manager, "a.torrent").await;

        let data = dir.path().join("downloads").join("a").join("data.bin");
        std::fs::create_dir_all(data.parent().unwrap()).unwrap();
        std::fs::write(&data, b"payload").unwrap();

        manager.remove_torrent(handle, true).await.unwrap();
        assert!(!data.exists());
        assert!(!dir.path().join("downloads").join("a").exists());
        assert!(manager.queue().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_failure_keeps_torrent_managed() {
        let (dir, engine, manager) = running().await;
        let handle = add(&dir, &manager, "a.torrent").await;
        engine
            .fail_next("remove_torrent", EngineError::Unavailable("busy".into()))
            .await;

        let err = manager.remove_torrent(handle, false).await.unwrap_err();
        assert!(matches!(err, SessionError::Engine(EngineError::Unavailable(_))));
        assert_eq!(manager.queue().await, vec![handle]);
        assert!(manager.get_torrent_state(handle).await.is_ok());
    }

    #[tokio::test]
    async fn test_stop_is_best_effort() {
        let (dir, engine, manager) = running().await;
        add(&dir, &manager, "a.torrent").await;
        engine
            .fail_next("stop_dht", EngineError::Internal("dht wedged".into()))
            .await;

        let report = manager.stop().await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].step, "stop_dht");
        assert_eq!(report.credited, 1);
        assert_eq!(report.fastresume_saved, 1);
        assert_eq!(engine.calls().await.last(), Some(&EngineCall::Shutdown));
        assert_eq!(manager.lifecycle().await, Lifecycle::Stopped);
        assert!(manager.config().catalog_path().is_file());
        assert!(manager.config().prefs_path().is_file());
    }

    #[tokio::test]
    async fn test_poll_loop_stops_with_session() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(MockEngine::new());
        let mut config = SessionConfig::with_base_dir(dir.path().join("state"));
        config.poll_interval_ms = 10;
        let manager = Arc::new(SessionManager::new(config, Arc::clone(&engine) as Arc<dyn Engine>));
        manager.start().await.unwrap();

        let handle = add(&dir, &manager, "a.torrent").await;
        engine.push_event(EngineEvent::TrackerAnnounce { handle }).await;

        let poller = manager.spawn_poll_loop();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let status = manager.get_torrent_state(handle).await.unwrap();
        assert_eq!(status.annotations.tracker_status.as_deref(), Some("Announce sent"));

        manager.stop().await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), poller)
            .await
            .unwrap()
            .unwrap();
    }
}
