//! Per-source token bucket rate limiting
//!
//! Each content source gets its own [`TokenBucket`]. Buckets refill lazily on
//! every consume attempt and are written back to a [`PreferenceStore`] in the
//! compact `capacity;refillRate;tokens;refillTime` form, so throttling state
//! survives a process restart.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::config::RateLimitConfig;
use crate::core::error::{Result, RuntimeError};
use crate::core::preferences::PreferenceStore;

/// Prefix for rate bucket keys in the preference store
const BUCKET_KEY_PREFIX: &str = "rate_bucket.";

/// How the refill boundary moves after a refill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefillMode {
    /// Advance the boundary by one interval on every refill, whether or not a
    /// token was added. Matches buckets persisted by earlier releases.
    Compatible,
    /// Advance the boundary by exactly the intervals that were credited.
    Exact,
}

/// Current wall clock in epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Token bucket for one content source
///
/// Invariant: `0 <= tokens <= capacity` at every observation point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBucket {
    capacity: u32,
    refill_rate_ms: u64,
    tokens: u32,
    refill_time: i64,
    mode: RefillMode,
}

impl TokenBucket {
    /// Create a bucket holding `tokens` with its refill boundary at `refill_time`
    pub fn new(capacity: u32, refill_rate_ms: u64, tokens: u32, refill_time: i64) -> Result<Self> {
        if capacity == 0 {
            return Err(RuntimeError::InvalidBucketState(
                "capacity must be greater than 0".to_string(),
            ));
        }
        if refill_rate_ms == 0 {
            return Err(RuntimeError::InvalidBucketState(
                "refill rate must be greater than 0".to_string(),
            ));
        }
        if tokens > capacity {
            return Err(RuntimeError::InvalidBucketState(format!(
                "tokens ({}) exceed capacity ({})",
                tokens, capacity
            )));
        }

        Ok(Self {
            capacity,
            refill_rate_ms,
            tokens,
            refill_time,
            mode: RefillMode::Compatible,
        })
    }

    /// Create a full bucket starting now
    pub fn full(capacity: u32, refill_rate_ms: u64) -> Result<Self> {
        Self::new(capacity, refill_rate_ms, capacity, now_millis())
    }

    /// Select the refill boundary policy
    pub fn with_mode(mut self, mode: RefillMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_rate_ms(&self) -> u64 {
        self.refill_rate_ms
    }

    /// Last computed token count; does not refill
    pub fn tokens(&self) -> u32 {
        self.tokens
    }

    pub fn refill_time(&self) -> i64 {
        self.refill_time
    }

    pub fn mode(&self) -> RefillMode {
        self.mode
    }

    /// Consume one token at the current wall clock
    pub fn try_consume(&mut self) -> bool {
        self.try_consume_at(1, now_millis())
    }

    /// Consume `n` tokens at the current wall clock
    pub fn try_consume_n(&mut self, n: u32) -> bool {
        self.try_consume_at(n, now_millis())
    }

    /// Refill as of `now`, then consume `n` tokens if available
    ///
    /// Fails without touching the token count when fewer than `n` tokens are
    /// available or `n` exceeds the capacity.
    pub fn try_consume_at(&mut self, n: u32, now: i64) -> bool {
        self.refill(now);

        if n > self.capacity || self.tokens < n {
            return false;
        }

        self.tokens -= n;
        true
    }

    /// Credit whole elapsed intervals since the refill boundary
    pub fn refill(&mut self, now: i64) {
        let rate = self.refill_rate_ms as i64;
        // A boundary in the future credits nothing.
        let elapsed = now.saturating_sub(self.refill_time).max(0);
        let whole_intervals = elapsed / rate;

        let refilled = (self.tokens as i64).saturating_add(whole_intervals);
        let saturated = refilled >= self.capacity as i64;
        self.tokens = if saturated { self.capacity } else { refilled as u32 };

        match self.mode {
            RefillMode::Compatible => {
                if saturated {
                    self.refill_time = now;
                }
                self.refill_time = self.refill_time.saturating_add(rate);
            }
            RefillMode::Exact => {
                if saturated {
                    self.refill_time = now;
                } else {
                    self.refill_time = self
                        .refill_time
                        .saturating_add(whole_intervals.saturating_mul(rate));
                }
            }
        }
    }
}

impl fmt::Display for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{};{};{};{}",
            self.capacity, self.refill_rate_ms, self.tokens, self.refill_time
        )
    }
}

impl FromStr for TokenBucket {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.split(';').collect();
        if fields.len() != 4 {
            return Err(RuntimeError::InvalidBucketState(format!(
                "expected 4 fields, found {} in '{}'",
                fields.len(),
                s
            )));
        }

        let parse_err = |name: &str, value: &str| {
            RuntimeError::InvalidBucketState(format!("invalid {} '{}'", name, value))
        };

        let capacity = fields[0]
            .trim()
            .parse::<u32>()
            .map_err(|_| parse_err("capacity", fields[0]))?;
        let refill_rate_ms = fields[1]
            .trim()
            .parse::<u64>()
            .map_err(|_| parse_err("refill rate", fields[1]))?;
        let tokens = fields[2]
            .trim()
            .parse::<u32>()
            .map_err(|_| parse_err("tokens", fields[2]))?;
        let refill_time = fields[3]
            .trim()
            .parse::<i64>()
            .map_err(|_| parse_err("refill time", fields[3]))?;

        TokenBucket::new(capacity, refill_rate_ms, tokens, refill_time)
    }
}

/// Keyed rate limiter backed by a preference store
///
/// The limiter is the only writer of bucket state. Buckets are loaded from
/// the store on first use and written back after every consume attempt.
pub struct RateLimiter {
    store: Arc<dyn PreferenceStore>,
    buckets: Mutex<HashMap<String, TokenBucket>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a limiter whose new buckets follow `config`
    pub fn new(store: Arc<dyn PreferenceStore>, config: RateLimitConfig) -> Self {
        Self {
            store,
            buckets: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Source key for a URL: its host, lowercased
    pub fn source_key_for_url(url: &str) -> Result<String> {
        let parsed = url::Url::parse(url)
            .map_err(|e| RuntimeError::ValidationError(format!("Invalid URL '{}': {}", url, e)))?;
        parsed
            .host_str()
            .map(|h| h.to_ascii_lowercase())
            .ok_or_else(|| RuntimeError::ValidationError(format!("URL '{}' has no host", url)))
    }

    /// Try to take one token for `source`
    ///
    /// Returns `Ok(false)` when throttled; errors only come from the store.
    pub async fn try_acquire(&self, source: &str) -> Result<bool> {
        self.try_acquire_n(source, 1).await
    }

    /// Try to take `n` tokens for `source`
    pub async fn try_acquire_n(&self, source: &str, n: u32) -> Result<bool> {
        let mut buckets = self.buckets.lock().await;
        let bucket = self.load_bucket(&mut buckets, source).await?;

        // Committed only once the store has accepted the new state.
        let mut next = bucket.clone();
        let allowed = next.try_consume_at(n, now_millis());
        let remaining = next.tokens();

        self.store.set(&bucket_key(source), &next.to_string()).await?;
        *bucket = next;

        if allowed {
            debug!(source = %source, tokens = remaining, "Rate limit token consumed");
        } else {
            debug!(source = %source, requested = n, tokens = remaining, "Source throttled");
        }

        Ok(allowed)
    }

    /// Last computed token count for `source`, without refilling
    pub async fn tokens(&self, source: &str) -> Result<u32> {
        let mut buckets = self.buckets.lock().await;
        let bucket = self.load_bucket(&mut buckets, source).await?;
        Ok(bucket.tokens())
    }

    /// Snapshot of the bucket for `source`
    pub async fn bucket(&self, source: &str) -> Result<TokenBucket> {
        let mut buckets = self.buckets.lock().await;
        let bucket = self.load_bucket(&mut buckets, source).await?;
        Ok(bucket.clone())
    }

    /// Replace the bucket for `source` with a full one using a custom policy
    pub async fn set_policy(&self, source: &str, capacity: u32, refill_rate_ms: u64) -> Result<()> {
        let bucket = TokenBucket::full(capacity, refill_rate_ms)?.with_mode(self.config.refill_mode);
        self.store.set(&bucket_key(source), &bucket.to_string()).await?;
        self.buckets.lock().await.insert(source.to_string(), bucket);
        Ok(())
    }

    /// Forget the bucket for `source`; the next acquire starts full
    pub async fn reset(&self, source: &str) -> Result<()> {
        self.buckets.lock().await.remove(source);
        self.store.remove(&bucket_key(source)).await
    }

    async fn load_bucket<'a>(
        &self,
        buckets: &'a mut HashMap<String, TokenBucket>,
        source: &str,
    ) -> Result<&'a mut TokenBucket> {
        if !buckets.contains_key(source) {
            let bucket = match self.store.get(&bucket_key(source)).await? {
                Some(raw) => match raw.parse::<TokenBucket>() {
                    Ok(bucket) => bucket.with_mode(self.config.refill_mode),
                    Err(e) => {
                        warn!(source = %source, error = %e, "Discarding corrupt rate bucket");
                        self.default_bucket()?
                    }
                },
                None => self.default_bucket()?,
            };
            buckets.insert(source.to_string(), bucket);
        }

        buckets
            .get_mut(source)
            .ok_or_else(|| RuntimeError::TaskError(format!("Rate bucket for '{}' vanished", source)))
    }

    fn default_bucket(&self) -> Result<TokenBucket> {
        Ok(TokenBucket::full(self.config.capacity, self.config.refill_rate_ms)?
            .with_mode(self.config.refill_mode))
    }
}

fn bucket_key(source: &str) -> String {
    format!("{}{}", BUCKET_KEY_PREFIX, source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::preferences::InMemoryPreferenceStore;
    use proptest::prelude::*;

    #[test]
    fn test_refill_scenario() {
        let mut bucket = TokenBucket::new(5, 1000, 0, 0).unwrap();

        assert!(bucket.try_consume_at(1, 3500));
        assert_eq!(bucket.tokens(), 2);
    }

    #[test]
    fn test_empty_bucket_rejects() {
        let mut bucket = TokenBucket::new(5, 1000, 0, 0).unwrap();
        assert!(!bucket.try_consume_at(1, 999));
        assert_eq!(bucket.tokens(), 0);
    }

    #[test]
    fn test_compatible_mode_advances_boundary_every_call() {
        let mut bucket = TokenBucket::new(5, 1000, 0, 0).unwrap();

        bucket.refill(500);
        assert_eq!(bucket.tokens(), 0);
        assert_eq!(bucket.refill_time(), 1000);

        bucket.refill(600);
        assert_eq!(bucket.refill_time(), 2000);
    }

    #[test]
    fn test_exact_mode_advances_by_credited_intervals() {
        let mut bucket = TokenBucket::new(5, 1000, 0, 0)
            .unwrap()
            .with_mode(RefillMode::Exact);

        bucket.refill(500);
        assert_eq!(bucket.refill_time(), 0);

        bucket.refill(3500);
        assert_eq!(bucket.tokens(), 3);
        assert_eq!(bucket.refill_time(), 3000);
    }

    #[test]
    fn test_saturation_resets_boundary() {
        let mut bucket = TokenBucket::new(5, 1000, 4, 0)
            .unwrap()
            .with_mode(RefillMode::Exact);

        bucket.refill(60_000);
        assert_eq!(bucket.tokens(), 5);
        assert_eq!(bucket.refill_time(), 60_000);

        let mut compat = TokenBucket::new(5, 1000, 4, 0).unwrap();
        compat.refill(60_000);
        assert_eq!(compat.tokens(), 5);
        assert_eq!(compat.refill_time(), 61_000);
    }

    #[test]
    fn test_consume_more_than_capacity_fails() {
        let mut bucket = TokenBucket::new(3, 1000, 3, 0).unwrap();
        assert!(!bucket.try_consume_at(4, 0));
        assert_eq!(bucket.tokens(), 3);
        assert!(bucket.try_consume_at(3, 0));
        assert_eq!(bucket.tokens(), 0);
    }

    #[test]
    fn test_serialization_format() {
        let bucket = TokenBucket::new(5, 1000, 2, 1_700_000_000_123).unwrap();
        assert_eq!(bucket.to_string(), "5;1000;2;1700000000123");

        let parsed: TokenBucket = "5;1000;2;1700000000123".parse().unwrap();
        assert_eq!(parsed, bucket);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!("5;1000;2".parse::<TokenBucket>().is_err());
        assert!("5;1000;9;0".parse::<TokenBucket>().is_err());
        assert!("5;0;2;0".parse::<TokenBucket>().is_err());
        assert!("five;1000;2;0".parse::<TokenBucket>().is_err());
    }

    proptest! {
        #[test]
        fn prop_round_trip(capacity in 1u32..1000, rate in 1u64..100_000, fill in 0u32..1000, time in any::<i64>()) {
            let tokens = fill % (capacity + 1);
            let bucket = TokenBucket::new(capacity, rate, tokens, time).unwrap();
            let parsed: TokenBucket = bucket.to_string().parse().unwrap();
            prop_assert_eq!(parsed.capacity(), bucket.capacity());
            prop_assert_eq!(parsed.refill_rate_ms(), bucket.refill_rate_ms());
            prop_assert_eq!(parsed.tokens(), bucket.tokens());
            prop_assert_eq!(parsed.refill_time(), bucket.refill_time());
        }

        #[test]
        fn prop_tokens_stay_in_bounds(
            capacity in 1u32..20,
            rate in 1u64..5000,
            steps in proptest::collection::vec((0i64..10_000, 0u32..25), 1..60),
            exact in any::<bool>(),
        ) {
            let mode = if exact { RefillMode::Exact } else { RefillMode::Compatible };
            let mut bucket = TokenBucket::new(capacity, rate, 0, 0).unwrap().with_mode(mode);
            let mut now = 0i64;
            for (advance, n) in steps {
                now += advance;
                let before = bucket.clone();
                let ok = bucket.try_consume_at(n, now);
                prop_assert!(bucket.tokens() <= capacity);
                if n > capacity {
                    prop_assert!(!ok);
                }
                if !ok {
                    let mut refilled_only = before;
                    refilled_only.refill(now);
                    prop_assert_eq!(bucket.tokens(), refilled_only.tokens());
                }
            }
        }
    }

    #[tokio::test]
    async fn test_limiter_throttles_per_source() {
        let store = Arc::new(InMemoryPreferenceStore::new());
        let config = RateLimitConfig {
            capacity: 2,
            refill_rate_ms: 60_000,
            refill_mode: RefillMode::Compatible,
        };
        let limiter = RateLimiter::new(store, config);

        assert!(limiter.try_acquire("novel-a").await.unwrap());
        assert!(limiter.try_acquire("novel-a").await.unwrap());
        assert!(!limiter.try_acquire("novel-a").await.unwrap());

        assert!(limiter.try_acquire("novel-b").await.unwrap());
        assert_eq!(limiter.tokens("novel-b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_limiter_state_survives_restart() {
        let store: Arc<dyn PreferenceStore> = Arc::new(InMemoryPreferenceStore::new());
        let config = RateLimitConfig {
            capacity: 3,
            refill_rate_ms: 60_000,
            refill_mode: RefillMode::Compatible,
        };

        {
            let limiter = RateLimiter::new(store.clone(), config.clone());
            assert!(limiter.try_acquire_n("source", 3).await.unwrap());
        }

        let raw = store.get("rate_bucket.source").await.unwrap().unwrap();
        let persisted: TokenBucket = raw.parse().unwrap();
        assert_eq!(persisted.tokens(), 0);

        let restarted = RateLimiter::new(store, config);
        assert!(!restarted.try_acquire("source").await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_bucket_is_replaced() {
        let store = Arc::new(InMemoryPreferenceStore::new());
        store.set("rate_bucket.bad", "not-a-bucket").await.unwrap();

        let limiter = RateLimiter::new(store, RateLimitConfig::default());
        assert!(limiter.try_acquire("bad").await.unwrap());
        assert_eq!(limiter.tokens("bad").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_set_policy_and_reset() {
        let store = Arc::new(InMemoryPreferenceStore::new());
        let limiter = RateLimiter::new(store.clone(), RateLimitConfig::default());

        limiter.set_policy("slow", 1, 60_000).await.unwrap();
        assert!(limiter.try_acquire("slow").await.unwrap());
        assert!(!limiter.try_acquire("slow").await.unwrap());

        limiter.reset("slow").await.unwrap();
        assert!(store.get("rate_bucket.slow").await.unwrap().is_none());
        assert_eq!(limiter.tokens("slow").await.unwrap(), 5);
    }

    /// Store whose next `set` fails once
    struct FlakyStore {
        inner: InMemoryPreferenceStore,
        fail_next_set: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl PreferenceStore for FlakyStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<()> {
            if self.fail_next_set.swap(false, std::sync::atomic::Ordering::SeqCst) {
                return Err(RuntimeError::PreferenceStore("disk full".to_string()));
            }
            self.inner.set(key, value).await
        }

        async fn remove(&self, key: &str) -> Result<()> {
            self.inner.remove(key).await
        }
    }

    #[tokio::test]
    async fn test_failed_write_keeps_token() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryPreferenceStore::new(),
            fail_next_set: std::sync::atomic::AtomicBool::new(true),
        });
        let config = RateLimitConfig {
            capacity: 1,
            refill_rate_ms: 60_000,
            refill_mode: RefillMode::Compatible,
        };
        let limiter = RateLimiter::new(store.clone(), config);

        assert!(matches!(
            limiter.try_acquire("source").await,
            Err(RuntimeError::PreferenceStore(_))
        ));
        assert_eq!(limiter.tokens("source").await.unwrap(), 1);
        assert!(store.inner.get("rate_bucket.source").await.unwrap().is_none());

        assert!(limiter.try_acquire("source").await.unwrap());
        assert!(!limiter.try_acquire("source").await.unwrap());
    }

    #[test]
    fn test_source_key_for_url() {
        assert_eq!(
            RateLimiter::source_key_for_url("https://Example.COM/novel/1").unwrap(),
            "example.com"
        );
        assert!(RateLimiter::source_key_for_url("not a url").is_err());
    }
}
