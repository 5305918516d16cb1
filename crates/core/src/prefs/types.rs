//! Preference names, values and their engine apply functions.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::{Engine, EngineError};

/// Errors for preference operations.
#[derive(Debug, Error)]
pub enum PreferenceError {
    #[error("Unknown preference: {0}")]
    Unknown(String),

    #[error("Preference {name} expects a {expected} value, got {actual}")]
    TypeMismatch {
        name: &'static str,
        expected: PrefKind,
        actual: PrefKind,
    },

    #[error("Failed to apply preference {name}: {source}")]
    Apply {
        name: &'static str,
        #[source]
        source: EngineError,
    },

    #[error("Preferences file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PreferenceError {
    /// Whether this is a missing-file error (nothing saved yet).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// The type of value a preference holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefKind {
    Bool,
    Int,
    Float,
    Ports,
}

impl fmt::Display for PrefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PrefKind::Bool => "bool",
            PrefKind::Int => "int",
            PrefKind::Float => "float",
            PrefKind::Ports => "port pair",
        })
    }
}

/// A typed preference value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrefValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Ports([u16; 2]),
}

impl PrefValue {
    pub fn kind(&self) -> PrefKind {
        match self {
            PrefValue::Bool(_) => PrefKind::Bool,
            PrefValue::Int(_) => PrefKind::Int,
            PrefValue::Float(_) => PrefKind::Float,
            PrefValue::Ports(_) => PrefKind::Ports,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PrefValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PrefValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Float value; integers are widened.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            PrefValue::Float(x) => Some(*x),
            PrefValue::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_ports(&self) -> Option<(u16, u16)> {
        match self {
            PrefValue::Ports([first, last]) => Some((*first, *last)),
            _ => None,
        }
    }
}

impl fmt::Display for PrefValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrefValue::Bool(b) => write!(f, "{}", b),
            PrefValue::Int(n) => write!(f, "{}", n),
            PrefValue::Float(x) => write!(f, "{}", x),
            PrefValue::Ports([first, last]) => write!(f, "[{}, {}]", first, last),
        }
    }
}

/// Pushes a preference value into the engine.
pub type ApplyFn =
    for<'a> fn(&'a dyn Engine, &'a PrefValue) -> BoxFuture<'a, Result<(), EngineError>>;

/// Every preference the client understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Preference {
    /// Upload slots.
    MaxUploads,
    /// Port range to listen on.
    ListenOn,
    /// Global connection limit.
    MaxConnections,
    /// Start the DHT at startup.
    UseDht,
    /// Torrents allowed to run at once, -1 = unlimited.
    MaxActiveTorrents,
    /// Seeding ratio that demotes a torrent, -1 = disabled.
    AutoSeedRatio,
    /// Global download limit, -1 = unlimited.
    MaxDownloadRate,
    /// Global upload limit, -1 = unlimited.
    MaxUploadRate,
    /// Move finished torrents to the bottom of the queue.
    QueueSeedsToBottom,
    /// User-pause seeds once they reach the auto-seed ratio.
    AutoEndSeeding,
    /// Remove seeds once they reach the auto-seed ratio. Data is kept.
    ClearMaxRatioTorrents,
}

impl Preference {
    pub const ALL: [Preference; 11] = [
        Preference::MaxUploads,
        Preference::ListenOn,
        Preference::MaxConnections,
        Preference::UseDht,
        Preference::MaxActiveTorrents,
        Preference::AutoSeedRatio,
        Preference::MaxDownloadRate,
        Preference::MaxUploadRate,
        Preference::QueueSeedsToBottom,
        Preference::AutoEndSeeding,
        Preference::ClearMaxRatioTorrents,
    ];

    /// Persisted key.
    pub fn name(self) -> &'static str {
        match self {
            Preference::MaxUploads => "max_uploads",
            Preference::ListenOn => "listen_on",
            Preference::MaxConnections => "max_connections",
            Preference::UseDht => "use_DHT",
            Preference::MaxActiveTorrents => "max_active_torrents",
            Preference::AutoSeedRatio => "auto_seed_ratio",
            Preference::MaxDownloadRate => "max_download_rate",
            Preference::MaxUploadRate => "max_upload_rate",
            Preference::QueueSeedsToBottom => "queue_seeds_to_bottom",
            Preference::AutoEndSeeding => "auto_end_seeding",
            Preference::ClearMaxRatioTorrents => "clear_max_ratio_torrents",
        }
    }

    pub fn kind(self) -> PrefKind {
        self.default_value().kind()
    }

    pub fn default_value(self) -> PrefValue {
        match self {
            Preference::MaxUploads => PrefValue::Int(2),
            Preference::ListenOn => PrefValue::Ports([6881, 9999]),
            Preference::MaxConnections => PrefValue::Int(80),
            Preference::UseDht => PrefValue::Bool(true),
            Preference::MaxActiveTorrents => PrefValue::Int(-1),
            Preference::AutoSeedRatio => PrefValue::Float(-1.0),
            Preference::MaxDownloadRate => PrefValue::Int(-1),
            Preference::MaxUploadRate => PrefValue::Int(-1),
            Preference::QueueSeedsToBottom => PrefValue::Bool(false),
            Preference::AutoEndSeeding => PrefValue::Bool(false),
            Preference::ClearMaxRatioTorrents => PrefValue::Bool(false),
        }
    }

    /// The engine setter for this preference. `None` for preferences read by
    /// the session itself.
    pub fn apply_fn(self) -> Option<ApplyFn> {
        match self {
            Preference::MaxUploads => Some(apply_max_uploads as ApplyFn),
            Preference::ListenOn => Some(apply_listen_on as ApplyFn),
            Preference::MaxConnections => Some(apply_max_connections as ApplyFn),
            Preference::MaxDownloadRate => Some(apply_max_download_rate as ApplyFn),
            Preference::MaxUploadRate => Some(apply_max_upload_rate as ApplyFn),
            Preference::UseDht
            | Preference::MaxActiveTorrents
            | Preference::AutoSeedRatio
            | Preference::QueueSeedsToBottom
            | Preference::AutoEndSeeding
            | Preference::ClearMaxRatioTorrents => None,
        }
    }

    /// Check `value` against this preference's kind, widening int to float.
    pub fn conform(self, value: PrefValue) -> Result<PrefValue, PreferenceError> {
        match (self.kind(), value) {
            (PrefKind::Float, PrefValue::Int(n)) => Ok(PrefValue::Float(n as f64)),
            (expected, value) if value.kind() == expected => Ok(value),
            (expected, value) => Err(PreferenceError::TypeMismatch {
                name: self.name(),
                expected,
                actual: value.kind(),
            }),
        }
    }
}

impl fmt::Display for Preference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Preference {
    type Err = PreferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Preference::ALL
            .into_iter()
            .find(|p| p.name() == s)
            .ok_or_else(|| PreferenceError::Unknown(s.to_string()))
    }
}

fn int_arg(pref: Preference, value: &PrefValue) -> Result<i64, EngineError> {
    value.as_int().ok_or_else(|| {
        EngineError::InvalidArgument(format!("{} expects an integer, got {}", pref, value))
    })
}

fn apply_max_uploads<'a>(
    engine: &'a dyn Engine,
    value: &'a PrefValue,
) -> BoxFuture<'a, Result<(), EngineError>> {
    Box::pin(async move {
        let limit = int_arg(Preference::MaxUploads, value)?;
        engine.set_max_uploads(limit).await
    })
}

fn apply_listen_on<'a>(
    engine: &'a dyn Engine,
    value: &'a PrefValue,
) -> BoxFuture<'a, Result<(), EngineError>> {
    Box::pin(async move {
        let (first, last) = value.as_ports().ok_or_else(|| {
            EngineError::InvalidArgument(format!("listen_on expects a port pair, got {}", value))
        })?;
        engine.set_listen_on(first, last).await
    })
}

fn apply_max_connections<'a>(
    engine: &'a dyn Engine,
    value: &'a PrefValue,
) -> BoxFuture<'a, Result<(), EngineError>> {
    Box::pin(async move {
        let limit = int_arg(Preference::MaxConnections, value)?;
        engine.set_max_connections(limit).await
    })
}

fn apply_max_download_rate<'a>(
    engine: &'a dyn Engine,
    value: &'a PrefValue,
) -> BoxFuture<'a, Result<(), EngineError>> {
    Box::pin(async move {
        let limit = int_arg(Preference::MaxDownloadRate, value)?;
        engine.set_download_rate_limit(limit).await
    })
}

fn apply_max_upload_rate<'a>(
    engine: &'a dyn Engine,
    value: &'a PrefValue,
) -> BoxFuture<'a, Result<(), EngineError>> {
    Box::pin(async move {
        let limit = int_arg(Preference::MaxUploadRate, value)?;
        engine.set_upload_rate_limit(limit).await
    })
}
