//! Validated preferences with defaults.
//!
//! `PreferenceTable` is the plain data side (defaults, validation,
//! persistence) and can be used without an engine. `PreferenceStore` wraps a
//! table and pushes changed values to the engine through each preference's
//! apply function.

mod store;
mod table;
mod types;

pub use store::PreferenceStore;
pub use table::PreferenceTable;
pub use types::*;
