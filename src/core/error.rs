//! Error type system for the source runtime
//!
//! This module provides the crate-wide error type with:
//! - Classification of engine, network and persistence failures
//! - Retryability checks used by the resilient executor
//! - Actionable user-facing messages for states a person has to resolve
//! - Error context support for foreign error types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Main error type for the source runtime
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    // Engine lifecycle errors
    #[error("Engine initialization failed for '{key}': {reason}")]
    EngineInitialization { key: String, reason: String },

    #[error("No script engine available: {0}")]
    EngineNotAvailable(String),

    #[error("Engine for '{0}' has been disposed")]
    EngineDisposed(String),

    #[error("Script error: {0}")]
    ScriptError(String),

    #[error("Engine plugin not found: {0}")]
    PluginNotFound(String),

    // Resilient execution errors
    #[error("Operation failed after {attempts} attempt(s): {last_error}")]
    OperationExhausted { attempts: u32, last_error: String },

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Bot challenge detected (HTTP {status}, marker '{marker}')")]
    ChallengeDetected { status: u16, marker: String },

    #[error("HTTP {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    // Rate limiter persistence
    #[error("Invalid rate bucket state: {0}")]
    InvalidBucketState(String),

    #[error("Preference store error: {0}")]
    PreferenceStore(String),

    // System-level errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Task error: {0}")]
    TaskError(String),
}

impl RuntimeError {
    /// Get the error type name used in logs and serialized reports
    pub fn error_type(&self) -> &'static str {
        match self {
            RuntimeError::EngineInitialization { .. } => "EngineInitializationError",
            RuntimeError::EngineNotAvailable(_) => "EngineNotAvailableError",
            RuntimeError::EngineDisposed(_) => "EngineDisposed",
            RuntimeError::ScriptError(_) => "ScriptError",
            RuntimeError::PluginNotFound(_) => "PluginNotFound",
            RuntimeError::OperationExhausted { .. } => "OperationExhaustedError",
            RuntimeError::OperationFailed(_) => "OperationFailed",
            RuntimeError::ChallengeDetected { .. } => "ChallengeDetectedError",
            RuntimeError::HttpStatus { .. } => "HttpStatus",
            RuntimeError::Timeout(_) => "Timeout",
            RuntimeError::Network(_) => "NetworkError",
            RuntimeError::InvalidBucketState(_) => "InvalidBucketState",
            RuntimeError::PreferenceStore(_) => "PreferenceStoreError",
            RuntimeError::ConfigError(_) => "ConfigError",
            RuntimeError::DatabaseError(_) => "DatabaseError",
            RuntimeError::IoError(_) => "IoError",
            RuntimeError::SerializationError(_) => "SerializationError",
            RuntimeError::ValidationError(_) => "ValidationError",
            RuntimeError::TaskError(_) => "TaskError",
        }
    }

    /// Check if retrying the failed operation can help
    ///
    /// A detected challenge is never retryable: the remote side will keep
    /// answering with the same verification page.
    pub fn is_retryable(&self) -> bool {
        match self {
            RuntimeError::Network(_)
            | RuntimeError::Timeout(_)
            | RuntimeError::DatabaseError(_)
            | RuntimeError::IoError(_) => true,
            RuntimeError::HttpStatus { status, .. } => matches!(status, 429 | 503),
            _ => false,
        }
    }

    /// Human-readable, actionable message for the surrounding application
    ///
    /// Returns `None` for errors that need no user intervention.
    pub fn user_message(&self) -> Option<String> {
        match self {
            RuntimeError::EngineNotAvailable(_) => Some(
                "No JavaScript engine is available. Install an engine plugin to use this source."
                    .to_string(),
            ),
            RuntimeError::OperationExhausted { attempts, .. } => Some(format!(
                "The source did not respond after {} attempts. Check your connection and try again later.",
                attempts
            )),
            RuntimeError::ChallengeDetected { .. } => Some(
                "This site is protected by a bot challenge. Open it in the browser to verify, then try again."
                    .to_string(),
            ),
            RuntimeError::Timeout(_) => Some(
                "The source took too long to respond. Try again later.".to_string(),
            ),
            _ => None,
        }
    }
}

/// Serializable error report for the command-line surface
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Error type identifier
    pub error: String,
    /// Human-readable error message
    pub message: String,
    /// Actionable hint, when the error needs user intervention
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorReport {
    /// Build a report from a RuntimeError
    pub fn from_error(error: &RuntimeError) -> Self {
        Self {
            error: error.error_type().to_string(),
            message: error.to_string(),
            hint: error.user_message(),
        }
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.error, self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, " ({})", hint)?;
        }
        Ok(())
    }
}

/// Result type alias for operations that can fail with RuntimeError
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Context extension trait for adding context to errors
pub trait ErrorContext<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context to an error using a closure
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| RuntimeError::TaskError(format!("{}: {}", context.into(), e)))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| RuntimeError::TaskError(format!("{}: {}", f(), e)))
    }
}
