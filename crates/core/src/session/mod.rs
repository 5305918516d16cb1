//! The session manager and the pieces it is built from.
//!
//! `SessionManager` owns the catalog, the handle map and the queue order
//! (together the `TorrentRegistry`) and keeps the engine in line with them.
//! Membership changes go through the `Synchronizer`; everything else is
//! state queries, queue policy and event handling on top.

mod events;
mod manager;
mod registry;
pub mod sync;
mod types;

pub use events::{alert_message, tracker_update, FINISHED_DOWNLOADING};
pub use manager::SessionManager;
pub use registry::{HandleMap, TorrentRegistry};
pub use sync::{Synchronizer, WriterGate};
pub use types::*;
