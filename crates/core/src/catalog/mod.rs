//! Persistent catalog of managed torrents.
//!
//! The catalog owns one record per torrent, survives restarts as a single
//! JSON file together with the queue order, and keeps its own copy of every
//! torrent file. It knows nothing about engine handles; the session layer
//! maps records to handles on each start.

mod store;
mod types;

pub use store::Catalog;
pub use types::*;
