//! Resilient operation execution
//!
//! Wraps a fallible async operation in retry-with-exponential-backoff. The
//! operation reports failures through [`Failure`], which decides whether a
//! further attempt is worth making.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::config::RetryConfig;
use crate::core::error::{Result, RuntimeError};

/// Substrings that mark a reported failure as transient (matched case-insensitively)
const RETRYABLE_SIGNATURES: &[&str] = &["timeout", "connection", "network", "503", "429"];

/// Exponential backoff policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_backoff.as_millis() as u64;
        let max_ms = self.max_backoff.as_millis() as u64;
        let delay_ms = base_ms.saturating_mul(1u64 << attempt.min(32));
        Duration::from_millis(delay_ms.min(max_ms))
    }

    /// Total number of attempts the policy allows
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// How an attempt failed
#[derive(Debug)]
pub enum Failure {
    /// The operation returned a failure description. Retried only when the
    /// text carries a transient signature.
    Reported(String),
    /// The operation faulted. Always retried.
    Fault(RuntimeError),
    /// Permanent failure; returned to the caller unchanged without retrying.
    Abort(RuntimeError),
}

impl Failure {
    fn is_retryable(&self) -> bool {
        match self {
            Failure::Reported(message) => is_retryable_message(message),
            Failure::Fault(_) => true,
            Failure::Abort(_) => false,
        }
    }

    fn describe(&self) -> String {
        match self {
            Failure::Reported(message) => message.clone(),
            Failure::Fault(e) | Failure::Abort(e) => e.to_string(),
        }
    }
}

impl From<RuntimeError> for Failure {
    fn from(error: RuntimeError) -> Self {
        Failure::Fault(error)
    }
}

/// Whether a reported failure message looks transient
pub fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    RETRYABLE_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

/// Bookkeeping for one in-flight resilient operation
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub attempt: u32,
    pub last_error: Option<String>,
    pub backoff: Duration,
}

/// Runs operations under a [`RetryPolicy`]
#[derive(Debug, Clone, Default)]
pub struct ResilientExecutor {
    policy: RetryPolicy,
}

impl ResilientExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails permanently, or runs out of attempts
    ///
    /// The closure receives the 0-based attempt index. A panic inside the
    /// operation counts as a fault. After the last attempt the final failure
    /// is wrapped in [`RuntimeError::OperationExhausted`].
    pub async fn with_retry<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, Failure>>,
    {
        let mut state = RetryState::default();
        let max_attempts = self.policy.max_attempts();

        while state.attempt < max_attempts {
            let outcome = AssertUnwindSafe(operation(state.attempt))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(Failure::Fault(panic_error(panic))));

            let failure = match outcome {
                Ok(value) => {
                    if state.attempt > 0 {
                        debug!(attempt = state.attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(failure) => failure,
            };

            if !failure.is_retryable() {
                debug!(attempt = state.attempt, error = %failure.describe(), "Permanent failure, not retrying");
                return Err(match failure {
                    Failure::Abort(e) | Failure::Fault(e) => e,
                    Failure::Reported(message) => RuntimeError::OperationFailed(message),
                });
            }

            state.last_error = Some(failure.describe());

            if state.attempt + 1 < max_attempts {
                state.backoff = self.policy.delay_for(state.attempt);
                debug!(
                    attempt = state.attempt,
                    max_retries = self.policy.max_retries,
                    delay_ms = state.backoff.as_millis() as u64,
                    error = state.last_error.as_deref().unwrap_or_default(),
                    "Retrying after backoff"
                );
                tokio::time::sleep(state.backoff).await;
            }

            state.attempt += 1;
        }

        let last_error = state.last_error.unwrap_or_default();
        warn!(attempts = state.attempt, error = %last_error, "Retries exhausted");
        Err(RuntimeError::OperationExhausted {
            attempts: state.attempt,
            last_error,
        })
    }
}

fn panic_error(panic: Box<dyn std::any::Any + Send>) -> RuntimeError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    RuntimeError::TaskError(format!("operation panicked: {}", message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(10_000),
        }
    }

    #[test]
    fn test_delay_schedule() {
        let policy = policy();
        assert_eq!(policy.delay_for(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(10_000));
        assert_eq!(policy.delay_for(60), Duration::from_millis(10_000));
    }

    #[test]
    fn test_retryable_messages() {
        assert!(is_retryable_message("Connection reset by peer"));
        assert!(is_retryable_message("request TIMEOUT"));
        assert!(is_retryable_message("HTTP 503 Service Unavailable"));
        assert!(is_retryable_message("429 Too Many Requests"));
        assert!(!is_retryable_message("404 Not Found"));
        assert!(!is_retryable_message("parse error"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_waits_full_backoff() {
        let executor = ResilientExecutor::new(policy());
        let attempts = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();

        let counter = attempts.clone();
        let result: Result<()> = executor
            .with_retry(|_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Failure::Reported("connection refused".to_string()))
                }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(started.elapsed(), Duration::from_millis(7000));
        match result {
            Err(RuntimeError::OperationExhausted { attempts, last_error }) => {
                assert_eq!(attempts, 4);
                assert_eq!(last_error, "connection refused");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_returns_immediately() {
        let executor = ResilientExecutor::new(policy());
        let attempts = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();

        let counter = attempts.clone();
        let result: Result<()> = executor
            .with_retry(|_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Failure::Reported("404 not found".to_string()))
                }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(matches!(result, Err(RuntimeError::OperationFailed(m)) if m == "404 not found"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_preserves_error() {
        let executor = ResilientExecutor::new(policy());
        let result: Result<()> = executor
            .with_retry(|_| async {
                Err(Failure::Abort(RuntimeError::ChallengeDetected {
                    status: 403,
                    marker: "Just a moment".to_string(),
                }))
            })
            .await;

        assert!(matches!(result, Err(RuntimeError::ChallengeDetected { status: 403, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_is_retried_until_success() {
        let executor = ResilientExecutor::new(policy());
        let started = tokio::time::Instant::now();

        let value = executor
            .with_retry(|attempt| async move {
                if attempt < 2 {
                    Err(Failure::Fault(RuntimeError::ScriptError("boom".to_string())))
                } else {
                    Ok(attempt)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(started.elapsed(), Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_counts_as_fault() {
        let executor = ResilientExecutor::new(RetryPolicy {
            max_retries: 1,
            ..policy()
        });

        let value = executor
            .with_retry(|attempt| async move {
                if attempt == 0 {
                    panic!("first attempt blows up");
                }
                Ok::<_, Failure>("recovered")
            })
            .await
            .unwrap();

        assert_eq!(value, "recovered");
    }
}
