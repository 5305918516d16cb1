//! Reconciles the catalog with the engine.
//!
//! The synchronizer is the only code that adds torrents to or removes them
//! from the engine, and the only writer of the handle map. Callers prove they
//! hold the writer gate by passing its guard.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::registry::TorrentRegistry;
use super::{SyncFailure, SyncReport};
use crate::catalog::{RecordId, TorrentRecord};
use crate::engine::{Engine, EngineError, SessionHandle};
use crate::metrics::{SYNC_DURATION, SYNC_RUNS, TORRENTS_ADDED, TORRENTS_MANAGED, TORRENTS_REMOVED};

/// Token guarded by the synchronizer's writer lock.
#[derive(Debug)]
pub struct WriterGate {
    _private: (),
}

/// Reconciles the registry with the engine.
pub struct Synchronizer {
    engine: Arc<dyn Engine>,
    registry: Arc<Mutex<TorrentRegistry>>,
    gate: Mutex<WriterGate>,
}

impl Synchronizer {
    pub fn new(engine: Arc<dyn Engine>, registry: Arc<Mutex<TorrentRegistry>>) -> Self {
        Self {
            engine,
            registry,
            gate: Mutex::new(WriterGate { _private: () }),
        }
    }

    /// Take the writer gate. Hold it across a catalog change and the `sync`
    /// that publishes it.
    pub async fn lock(&self) -> MutexGuard<'_, WriterGate> {
        self.gate.lock().await
    }

    /// Bring the engine and handle map in line with the catalog.
    ///
    /// Adds every record without a handle, removes every handle whose record
    /// is pending removal, then appends new handles to the queue.
    ///
    /// # Panics
    ///
    /// Panics if afterwards the handle map, catalog, queue and engine do not
    /// all agree on the number of torrents.
    pub async fn sync(&self, _writer: &MutexGuard<'_, WriterGate>) -> SyncReport {
        let started = Instant::now();
        let mut report = SyncReport::default();

        self.add_unmapped(&mut report).await;
        self.remove_pending(&mut report).await;
        let queued = self.extend_queue().await;

        let engine_count = match self.engine.torrent_count().await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!(error = %e, "Could not read engine torrent count, skipping engine check");
                None
            }
        };
        if let Err(violation) = self.registry.lock().await.check_invariant(engine_count) {
            panic!("{}", violation);
        }

        SYNC_RUNS.inc();
        SYNC_DURATION.observe(started.elapsed().as_secs_f64());
        TORRENTS_MANAGED.set(queued as i64);

        if !report.is_empty() {
            info!(
                added = report.added.len(),
                removed = report.removed.len(),
                failed = report.failed.len(),
                queued,
                "Sync complete"
            );
        }
        report
    }

    async fn add_unmapped(&self, report: &mut SyncReport) {
        let (to_add, abandoned) = {
            let registry = self.registry.lock().await;
            let unmapped: Vec<&TorrentRecord> = registry
                .catalog()
                .iter()
                .filter(|r| registry.handles().handle_of(r.id).is_none())
                .collect();
            let to_add: Vec<TorrentRecord> = unmapped
                .iter()
                .filter(|r| !r.pending_delete)
                .map(|r| (*r).clone())
                .collect();
            let abandoned: Vec<RecordId> = unmapped
                .iter()
                .filter(|r| r.pending_delete)
                .map(|r| r.id)
                .collect();
            (to_add, abandoned)
        };

        // Never reached the engine; nothing to remove there.
        for id in abandoned {
            self.discard(id).await;
        }

        for record in to_add {
            if !record.source_path.is_file() {
                warn!(
                    record = %record.id,
                    path = %record.source_path.display(),
                    "Managed torrent file is missing, dropping record"
                );
                self.discard(record.id).await;
                report.failed.push(SyncFailure {
                    record: record.id,
                    handle: None,
                    error: EngineError::InvalidTorrent(format!(
                        "{} is missing",
                        record.source_path.display()
                    )),
                });
                continue;
            }

            match self
                .engine
                .add_torrent(&record.source_path, &record.save_directory, record.storage_mode)
                .await
            {
                Ok(handle) => {
                    self.registry
                        .lock()
                        .await
                        .handles_mut()
                        .insert(handle, record.id);
                    TORRENTS_ADDED.inc();
                    debug!(record = %record.id, handle = %handle, "Torrent added to engine");
                    report.added.push(handle);
                }
                Err(e) => {
                    warn!(
                        record = %record.id,
                        file = %record.file_name(),
                        error = %e,
                        "Engine rejected torrent, dropping record"
                    );
                    self.discard(record.id).await;
                    report.failed.push(SyncFailure {
                        record: record.id,
                        handle: None,
                        error: e,
                    });
                }
            }
        }
    }

    async fn remove_pending(&self, report: &mut SyncReport) {
        let pending: Vec<(SessionHandle, RecordId)> = {
            let registry = self.registry.lock().await;
            registry
                .handles()
                .handles()
                .filter_map(|h| {
                    let id = registry.handles().record_of(h)?;
                    let record = registry.catalog().get(id)?;
                    record.pending_delete.then_some((h, id))
                })
                .collect()
        };

        for (handle, id) in pending {
            match self.engine.remove_torrent(handle).await {
                // Already gone from the engine counts as removed.
                Ok(()) | Err(EngineError::TorrentNotFound(_)) => {
                    {
                        let mut registry = self.registry.lock().await;
                        registry.queue_mut().remove(handle);
                        registry.handles_mut().remove_handle(handle);
                    }
                    self.discard(id).await;
                    TORRENTS_REMOVED.inc();
                    debug!(record = %id, handle = %handle, "Torrent removed from engine");
                    report.removed.push(handle);
                }
                Err(e) => {
                    warn!(record = %id, handle = %handle, error = %e, "Engine failed to remove torrent");
                    if let Some(record) = self.registry.lock().await.catalog_mut().get_mut(id) {
                        record.pending_delete = false;
                    }
                    report.failed.push(SyncFailure {
                        record: id,
                        handle: Some(handle),
                        error: e,
                    });
                }
            }
        }
    }

    /// Append mapped handles missing from the queue. Returns the queue length.
    async fn extend_queue(&self) -> usize {
        let mut registry = self.registry.lock().await;

        let saved: Vec<SessionHandle> = registry
            .catalog_mut()
            .take_saved_order()
            .into_iter()
            .filter_map(|id| registry.handles().handle_of(id))
            .collect();
        let rest: Vec<SessionHandle> = registry.handles().handles().collect();

        let queue = registry.queue_mut();
        for handle in saved.into_iter().chain(rest) {
            queue.push_back(handle);
        }
        queue.len()
    }

    /// Drop a record and its managed files.
    async fn discard(&self, id: RecordId) {
        let record = self.registry.lock().await.catalog_mut().remove(id);
        if let Some(record) = record {
            if let Err(e) = record.remove_managed_files() {
                warn!(record = %id, error = %e, "Failed to delete managed torrent file");
            }
        }
    }
}
