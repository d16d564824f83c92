//! Core runtime module
//!
//! This module provides the runtime services around the engine pool:
//! - Configuration management
//! - Structured logging system
//! - Error handling and type system
//! - Preference storage and per-source rate limiting
//! - Resilient execution and challenge-aware fetching

pub mod challenge;
pub mod config;
pub mod error;
pub mod logging;
pub mod preferences;
pub mod rate_limiter;
pub mod retry;
pub mod services;

pub use challenge::{ChallengeAwareFetcher, ChallengeSolver, FetchRequest, FetchResponse, HttpTransport, ReqwestTransport};
pub use config::Config;
pub use error::{ErrorContext, ErrorReport, Result, RuntimeError};
pub use logging::Logger;
pub use preferences::{InMemoryPreferenceStore, PreferenceStore, SqlitePreferenceStore};
pub use rate_limiter::{RateLimiter, RefillMode, TokenBucket};
pub use retry::{Failure, ResilientExecutor, RetryPolicy};
pub use services::{SourceFetch, SourceRuntime};
