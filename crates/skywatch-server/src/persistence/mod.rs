//! Persistence layer for the SkyWatch server.
//!
//! SQLite-backed key-value storage for user preferences and alert history.

pub mod db;
pub mod prefs;

pub use db::{init_database, Database};
pub use prefs::PreferenceStore;
