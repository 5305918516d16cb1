//! JSON-backed catalog of managed torrents.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{CatalogError, RecordId, TorrentRecord};
use crate::engine::StorageMode;
use crate::persist::write_atomic;

const CATALOG_VERSION: u32 = 1;

/// On-disk layout: records and queue order are written together.
#[derive(Debug, Serialize, Deserialize)]
struct CatalogFile {
    version: u32,
    next_id: u64,
    torrents: Vec<TorrentRecord>,
    /// Record ids, highest priority first.
    queue: Vec<RecordId>,
}

/// The set of torrents the client manages.
///
/// Torrent files are copied into `torrents_dir` on add, so the catalog owns
/// its own copy independent of where the user found the file.
#[derive(Debug)]
pub struct Catalog {
    torrents_dir: PathBuf,
    next_id: u64,
    records: BTreeMap<RecordId, TorrentRecord>,
    saved_order: Vec<RecordId>,
}

impl Catalog {
    /// Create an empty catalog managing files in `torrents_dir`.
    pub fn new(torrents_dir: impl Into<PathBuf>) -> Self {
        Self {
            torrents_dir: torrents_dir.into(),
            next_id: 1,
            records: BTreeMap::new(),
            saved_order: Vec::new(),
        }
    }

    pub fn torrents_dir(&self) -> &Path {
        &self.torrents_dir
    }

    /// Copy `source` into the torrents directory and create a record for it.
    pub fn add(
        &mut self,
        source: &Path,
        save_directory: &Path,
        storage_mode: StorageMode,
        user_paused: bool,
    ) -> Result<RecordId, CatalogError> {
        let name = source
            .file_name()
            .ok_or_else(|| CatalogError::InvalidSource(source.to_path_buf()))?;
        let managed = self.torrents_dir.join(name);

        if managed.exists() {
            return Err(CatalogError::DuplicateTorrent {
                name: name.to_string_lossy().into_owned(),
            });
        }

        std::fs::create_dir_all(&self.torrents_dir).map_err(|source| CatalogError::Io {
            path: self.torrents_dir.clone(),
            source,
        })?;
        std::fs::copy(source, &managed).map_err(|e| CatalogError::Io {
            path: source.to_path_buf(),
            source: e,
        })?;

        let id = RecordId(self.next_id);
        self.next_id += 1;
        self.records.insert(
            id,
            TorrentRecord {
                id,
                source_path: managed,
                save_directory: save_directory.to_path_buf(),
                storage_mode,
                user_paused,
                uploaded_credit: 0,
                pending_delete: false,
                file_filter: None,
            },
        );

        debug!(record = %id, source = %source.display(), "Catalog record added");
        Ok(id)
    }

    /// Flag a record for the synchronizer to remove. Nothing is deleted yet.
    pub fn mark_for_removal(&mut self, id: RecordId) -> Result<(), CatalogError> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(CatalogError::UnknownRecord(id))?;
        record.pending_delete = true;
        Ok(())
    }

    pub fn get(&self, id: RecordId) -> Option<&TorrentRecord> {
        self.records.get(&id)
    }

    pub fn get_mut(&mut self, id: RecordId) -> Option<&mut TorrentRecord> {
        self.records.get_mut(&id)
    }

    /// Drop a record. The managed files are left to the caller.
    pub fn remove(&mut self, id: RecordId) -> Option<TorrentRecord> {
        self.records.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TorrentRecord> {
        self.records.values()
    }

    pub fn ids(&self) -> Vec<RecordId> {
        self.records.keys().copied().collect()
    }

    /// Number of records, including those pending removal.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records not pending removal.
    pub fn live_len(&self) -> usize {
        self.records.values().filter(|r| !r.pending_delete).count()
    }

    /// Queue order read from disk, by record id. Returned once; later calls
    /// get an empty list.
    pub fn take_saved_order(&mut self) -> Vec<RecordId> {
        std::mem::take(&mut self.saved_order)
    }

    /// Serialize the records and `queue` as JSON.
    pub fn to_json(&self, queue: &[RecordId]) -> Result<String, serde_json::Error> {
        let file = CatalogFile {
            version: CATALOG_VERSION,
            next_id: self.next_id,
            torrents: self
                .records
                .values()
                .filter(|r| !r.pending_delete)
                .cloned()
                .collect(),
            queue: queue.to_vec(),
        };
        serde_json::to_string_pretty(&file)
    }

    /// Parse a catalog written by `to_json`.
    pub fn from_json(text: &str, torrents_dir: impl Into<PathBuf>) -> Result<Self, serde_json::Error> {
        let file: CatalogFile = serde_json::from_str(text)?;
        if file.version != CATALOG_VERSION {
            warn!(
                version = file.version,
                expected = CATALOG_VERSION,
                "Catalog written by a different version, loading anyway"
            );
        }

        let mut catalog = Self::new(torrents_dir);
        for record in file.torrents {
            catalog.records.insert(record.id, record);
        }

        // Never reissue an id that is already in use.
        let max_id = catalog.records.keys().map(|id| id.0).max().unwrap_or(0);
        catalog.next_id = file.next_id.max(max_id + 1);
        catalog.saved_order = file
            .queue
            .into_iter()
            .filter(|id| catalog.records.contains_key(id))
            .collect();

        Ok(catalog)
    }

    /// Atomically write the records and `queue` to `path`.
    pub fn save(&self, path: &Path, queue: &[RecordId]) -> Result<(), CatalogError> {
        let json = self.to_json(queue).map_err(|e| CatalogError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        write_atomic(path, json.as_bytes()).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), records = self.live_len(), "Catalog saved");
        Ok(())
    }

    /// Read a catalog from `path`.
    pub fn load(path: &Path, torrents_dir: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text, torrents_dir).map_err(|e| CatalogError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Read a catalog from `path`, starting empty if it is missing or corrupt.
    pub fn load_or_empty(path: &Path, torrents_dir: impl Into<PathBuf>) -> Self {
        let torrents_dir = torrents_dir.into();
        match Self::load(path, torrents_dir.clone()) {
            Ok(catalog) => {
                info!(path = %path.display(), records = catalog.len(), "Loaded catalog");
                catalog
            }
            Err(e) if e.is_not_found() => {
                info!(path = %path.display(), "No saved catalog, starting empty");
                Self::new(torrents_dir)
            }
            Err(e) => {
                warn!(error = %e, "Saved catalog unusable, starting empty");
                Self::new(torrents_dir)
            }
        }
    }
}
