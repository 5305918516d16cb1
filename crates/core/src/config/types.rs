use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
}

/// Session manager configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Directory holding preferences, catalog, DHT state and torrent files.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    /// Subdirectory of `base_dir` where managed torrent files are kept.
    #[serde(default = "default_torrents_subdir")]
    pub torrents_subdir: String,
    /// Ignore saved preferences, catalog and DHT state on start.
    #[serde(default)]
    pub blank_slate: bool,
    /// How long cached engine answers stay valid.
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
    /// Interval between event drains and queue passes.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            torrents_subdir: default_torrents_subdir(),
            blank_slate: false,
            cache_ttl_ms: default_cache_ttl_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl SessionConfig {
    /// A configuration rooted at `base_dir` with default settings.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    pub fn prefs_path(&self) -> PathBuf {
        self.base_dir.join(PREFS_FILENAME)
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.base_dir.join(CATALOG_FILENAME)
    }

    pub fn dht_state_path(&self) -> PathBuf {
        self.base_dir.join(DHT_FILENAME)
    }

    pub fn torrents_dir(&self) -> PathBuf {
        self.base_dir.join(&self.torrents_subdir)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

pub const PREFS_FILENAME: &str = "prefs.json";
pub const CATALOG_FILENAME: &str = "catalog.json";
pub const DHT_FILENAME: &str = "dht.state";

fn default_base_dir() -> PathBuf {
    PathBuf::from(".seedwarden")
}

fn default_torrents_subdir() -> String {
    "torrentfiles".to_string()
}

fn default_cache_ttl_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths() {
        let config = SessionConfig::with_base_dir("/var/lib/seedwarden");
        assert_eq!(
            config.prefs_path(),
            PathBuf::from("/var/lib/seedwarden/prefs.json")
        );
        assert_eq!(
            config.catalog_path(),
            PathBuf::from("/var/lib/seedwarden/catalog.json")
        );
        assert_eq!(
            config.dht_state_path(),
            PathBuf::from("/var/lib/seedwarden/dht.state")
        );
        assert_eq!(
            config.torrents_dir(),
            PathBuf::from("/var/lib/seedwarden/torrentfiles")
        );
        assert_eq!(config.cache_ttl(), Duration::from_secs(1));
    }
}
