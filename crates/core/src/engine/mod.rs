//! Torrent engine abstraction.
//!
//! The engine owns the wire protocol, piece I/O, DHT and trackers. This crate
//! only talks to it through the `Engine` trait: add/remove/pause/resume
//! commands, state polling, an event queue and global limit setters.

mod types;

pub use types::*;
