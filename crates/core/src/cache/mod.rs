//! Short-lived memoization of engine queries.
//!
//! UI refreshes poll torrent state far more often than it changes. A
//! `CachedQuery` keeps the last answer per key for a short TTL so repeated
//! reads within that window do not reach the engine.

mod clock;
mod query;

pub use clock::{Clock, SystemClock};
pub use query::{CachedQuery, CachedValue, Fetcher, CACHED_DATA_EXPIRATION};
