//! Source Runtime Library
//!
//! Resource management for untrusted content-source plugins: a bounded pool
//! of script engines, persistent per-source rate limiting, and resilient,
//! challenge-aware network access.

pub mod core;
pub mod db;
pub mod plugin;

// Re-export commonly used types
pub use crate::core::{Config, RateLimiter, SourceRuntime};
pub use db::DatabaseManager;
pub use plugin::{EnginePool, EngineProvider};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
