//! Database module
//!
//! SQLite storage backing the durable preference store.

pub mod manager;
pub mod migrations;

pub use manager::DatabaseManager;
