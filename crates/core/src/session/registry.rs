use std::collections::{BTreeMap, HashMap};

use super::InvariantViolation;
use crate::catalog::{Catalog, RecordId, TorrentRecord};
use crate::engine::SessionHandle;
use crate::queue::QueueOrder;

/// Two-way mapping between engine handles and catalog records.
#[derive(Debug, Default)]
pub struct HandleMap {
    by_handle: BTreeMap<SessionHandle, RecordId>,
    by_record: HashMap<RecordId, SessionHandle>,
}

impl HandleMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `handle` to `record`, replacing any earlier mapping of either.
    pub fn insert(&mut self, handle: SessionHandle, record: RecordId) {
        if let Some(old) = self.by_handle.insert(handle, record) {
            self.by_record.remove(&old);
        }
        if let Some(old) = self.by_record.insert(record, handle) {
            if old != handle {
                self.by_handle.remove(&old);
            }
        }
    }

    pub fn remove_handle(&mut self, handle: SessionHandle) -> Option<RecordId> {
        let record = self.by_handle.remove(&handle)?;
        self.by_record.remove(&record);
        Some(record)
    }

    pub fn record_of(&self, handle: SessionHandle) -> Option<RecordId> {
        self.by_handle.get(&handle).copied()
    }

    pub fn handle_of(&self, record: RecordId) -> Option<SessionHandle> {
        self.by_record.get(&record).copied()
    }

    pub fn contains(&self, handle: SessionHandle) -> bool {
        self.by_handle.contains_key(&handle)
    }

    /// Handles in issue order.
    pub fn handles(&self) -> impl Iterator<Item = SessionHandle> + '_ {
        self.by_handle.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_handle.is_empty()
    }
}

/// Catalog, handle map and queue order, kept behind one lock.
#[derive(Debug)]
pub struct TorrentRegistry {
    catalog: Catalog,
    handles: HandleMap,
    queue: QueueOrder,
}

impl TorrentRegistry {
    /// A registry over `catalog` with nothing mapped yet.
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog,
            handles: HandleMap::new(),
            queue: QueueOrder::new(),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn catalog_mut(&mut self) -> &mut Catalog {
        &mut self.catalog
    }

    pub fn handles(&self) -> &HandleMap {
        &self.handles
    }

    pub(crate) fn handles_mut(&mut self) -> &mut HandleMap {
        &mut self.handles
    }

    pub fn queue(&self) -> &QueueOrder {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut QueueOrder {
        &mut self.queue
    }

    /// The record behind `handle`.
    pub fn record(&self, handle: SessionHandle) -> Option<&TorrentRecord> {
        self.handles
            .record_of(handle)
            .and_then(|id| self.catalog.get(id))
    }

    pub fn record_mut(&mut self, handle: SessionHandle) -> Option<&mut TorrentRecord> {
        let id = self.handles.record_of(handle)?;
        self.catalog.get_mut(id)
    }

    /// Queue order expressed as record ids, for persistence.
    pub fn queue_record_ids(&self) -> Vec<RecordId> {
        self.queue
            .as_slice()
            .iter()
            .filter_map(|h| self.handles.record_of(*h))
            .collect()
    }

    /// Check that every count agrees. `engine` is the engine's own count,
    /// when it could be read.
    pub fn check_invariant(&self, engine: Option<usize>) -> Result<(), InvariantViolation> {
        let handles = self.handles.len();
        let records = self.catalog.len();
        let queued = self.queue.len();
        let engine_count = engine.unwrap_or(handles);

        if handles == records && records == queued && queued == engine_count {
            Ok(())
        } else {
            Err(InvariantViolation {
                handles,
                records,
                queued,
                engine: engine_count,
            })
        }
    }
}
