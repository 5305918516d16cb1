pub mod cache;
pub mod catalog;
pub mod config;
pub mod disk;
pub mod engine;
pub mod metrics;
pub mod persist;
pub mod prefs;
pub mod queue;
pub mod session;
pub mod testing;

pub use catalog::{Catalog, CatalogError, FileFilter, RecordId, TorrentRecord};
pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, SessionConfig,
};
pub use disk::{DiskSpace, FsDiskSpace};
pub use engine::{Engine, EngineError, EngineEvent, SessionHandle, StorageMode, TorrentSnapshot};
pub use prefs::{PrefValue, Preference, PreferenceError, PreferenceStore, PreferenceTable};
pub use queue::{QueueOrder, QueueReport};
pub use session::{
    AddTorrentRequest, Lifecycle, SessionError, SessionManager, SessionStatus, ShutdownReport,
    SyncReport, TorrentStatus,
};
