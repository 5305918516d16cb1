//! Testing utilities and mock implementations.
//!
//! This module provides a mock engine, a manual clock and a fixed-size disk,
//! allowing the session layer to be exercised end to end without a real
//! torrent engine.
//!
//! # Example
//!
//! ```rust,ignore
//! use seedwarden_core::testing::{fixtures, MockEngine};
//!
//! let engine = Arc::new(MockEngine::new());
//! let file = fixtures::write_torrent_file(dir.path(), "debian.torrent");
//!
//! // Drive engine state from the test...
//! engine.set_progress(handle, 0.5).await;
//! ```

mod clock;
mod disk;
mod mock_engine;

pub use clock::ManualClock;
pub use disk::FixedDiskSpace;
pub use mock_engine::{EngineCall, MockEngine};

/// Test fixtures and helper functions.
pub mod fixtures {
    use std::path::{Path, PathBuf};

    use crate::engine::{PeerInfo, TorrentSnapshot};

    /// Write a placeholder torrent file named `name` into `dir`.
    pub fn write_torrent_file(dir: &Path, name: &str) -> PathBuf {
        std::fs::create_dir_all(dir).expect("create fixture dir");
        let path = dir.join(name);
        std::fs::write(&path, format!("d4:infod4:name{}:{}ee", name.len(), name))
            .expect("write fixture torrent");
        path
    }

    /// A downloading torrent snapshot with reasonable defaults.
    pub fn snapshot(name: &str, progress: f64) -> TorrentSnapshot {
        let total_wanted = 100 * 1024 * 1024; // 100 MB
        TorrentSnapshot {
            name: name.to_string(),
            progress,
            is_seed: progress >= 1.0,
            total_wanted,
            total_wanted_done: (total_wanted as f64 * progress) as u64,
            total_done: (total_wanted as f64 * progress) as u64,
            num_files: 1,
            ..Default::default()
        }
    }

    /// A connected peer.
    pub fn peer(address: &str) -> PeerInfo {
        PeerInfo {
            address: address.to_string(),
            client: "Transmission 4.0".to_string(),
            download_rate: 10_240,
            upload_rate: 2_048,
            is_seed: false,
        }
    }
}
