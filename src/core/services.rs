//! Source runtime service
//!
//! Entry point the surrounding application calls into. It consults the rate
//! limiter before every outbound fetch, routes fetches through the
//! challenge-aware fetcher, and runs scripts on pooled engines under the
//! configured evaluation timeout.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::core::challenge::{ChallengeAwareFetcher, FetchRequest, FetchResponse};
use crate::core::error::Result;
use crate::core::rate_limiter::RateLimiter;
use crate::plugin::code_cache::code_cache_key;
use crate::plugin::provider::EngineProvider;

/// Outcome of a rate-limited fetch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SourceFetch {
    Completed(FetchResponse),
    /// The source's bucket was empty; nothing was sent
    Throttled { source: String },
}

/// Runtime shared by every content source
pub struct SourceRuntime {
    provider: Arc<EngineProvider>,
    limiter: Arc<RateLimiter>,
    fetcher: Arc<ChallengeAwareFetcher>,
    evaluation_timeout: Duration,
}

impl SourceRuntime {
    pub fn new(
        provider: Arc<EngineProvider>,
        limiter: Arc<RateLimiter>,
        fetcher: Arc<ChallengeAwareFetcher>,
        evaluation_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            limiter,
            fetcher,
            evaluation_timeout,
        }
    }

    pub fn provider(&self) -> &Arc<EngineProvider> {
        &self.provider
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Fetch `request` on behalf of `source`
    ///
    /// The source key defaults to the request URL's host. A throttled source
    /// is reported as [`SourceFetch::Throttled`], not as an error.
    pub async fn fetch(&self, source: Option<&str>, request: &FetchRequest) -> Result<SourceFetch> {
        let source = match source {
            Some(source) => source.to_string(),
            None => RateLimiter::source_key_for_url(&request.url)?,
        };

        if !self.limiter.try_acquire(&source).await? {
            info!(source = %source, url = %request.url, "Fetch throttled");
            return Ok(SourceFetch::Throttled { source });
        }

        debug!(source = %source, url = %request.url, method = %request.method, "Fetching");
        let response = self.fetcher.fetch(request).await?;
        Ok(SourceFetch::Completed(response))
    }

    /// Evaluate `script` on the engine pooled for `key`
    pub async fn evaluate(&self, key: &str, script: &str) -> Result<Value> {
        let code = self
            .provider
            .pool()
            .get_cached_code(&code_cache_key(script), script)
            .await;
        self.provider.evaluate(key, &code, self.evaluation_timeout).await
    }

    /// Call a global function on the engine pooled for `key`
    pub async fn call_function(&self, key: &str, name: &str, args: Vec<Value>) -> Result<Value> {
        self.provider
            .execute(key, self.evaluation_timeout, |handle| async move {
                handle.call_function(name, args).await
            })
            .await
    }

    /// Dispose every pooled engine
    pub async fn shutdown(&self) {
        self.provider.pool().clear().await;
        info!("Source runtime shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::challenge::HttpTransport;
    use crate::core::config::{PoolConfig, RateLimitConfig, RetryConfig};
    use crate::core::error::RuntimeError;
    use crate::core::preferences::{InMemoryPreferenceStore, PreferenceStore};
    use crate::core::rate_limiter::RefillMode;
    use crate::plugin::engine::{EngineCapabilities, EngineFactory, ScriptEngine};
    use crate::plugin::pool::EnginePool;
    use crate::plugin::registry::InMemoryEngineRegistry;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct OkTransport {
        calls: AtomicU32,
    }

    #[async_trait]
    impl HttpTransport for OkTransport {
        async fn send(&self, request: &FetchRequest, _attempt: u32) -> Result<FetchResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(FetchResponse::new(200, format!("body of {}", request.url)))
        }
    }

    struct EchoEngine;

    #[async_trait]
    impl ScriptEngine for EchoEngine {
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }

        async fn evaluate_script(&self, script: &str) -> Result<Value> {
            Ok(Value::String(script.to_string()))
        }

        async fn call_function(&self, name: &str, args: Vec<Value>) -> Result<Value> {
            Ok(serde_json::json!({ "called": name, "args": args }))
        }

        async fn set_global_object(&self, _name: &str, _value: Value) -> Result<()> {
            Ok(())
        }

        async fn get_global_object(&self, _name: &str) -> Result<Option<Value>> {
            Ok(None)
        }

        async fn dispose(&self) -> Result<()> {
            Ok(())
        }
    }

    struct EchoFactory;

    #[async_trait]
    impl EngineFactory for EchoFactory {
        fn id(&self) -> &str {
            "bundled"
        }

        fn name(&self) -> &str {
            "Echo"
        }

        fn capabilities(&self) -> EngineCapabilities {
            EngineCapabilities::default()
        }

        async fn create(&self, _key: &str) -> Result<Box<dyn ScriptEngine>> {
            Ok(Box::new(EchoEngine))
        }
    }

    async fn runtime(capacity: u32) -> (SourceRuntime, Arc<OkTransport>, Arc<InMemoryPreferenceStore>) {
        let store = Arc::new(InMemoryPreferenceStore::new());
        let limiter = Arc::new(RateLimiter::new(
            store.clone(),
            RateLimitConfig {
                capacity,
                refill_rate_ms: 60_000,
                refill_mode: RefillMode::Compatible,
            },
        ));
        let transport = Arc::new(OkTransport {
            calls: AtomicU32::new(0),
        });
        let fetcher = Arc::new(ChallengeAwareFetcher::new(transport.clone(), &RetryConfig::default()));

        let bundled: Arc<dyn EngineFactory> = Arc::new(EchoFactory);
        let pool = Arc::new(EnginePool::new(PoolConfig::default(), bundled.clone()));
        let provider = Arc::new(
            EngineProvider::new(pool, Arc::new(InMemoryEngineRegistry::new()), bundled).await,
        );

        let runtime = SourceRuntime::new(provider, limiter, fetcher, Duration::from_secs(30));
        (runtime, transport, store)
    }

    #[tokio::test]
    async fn test_fetch_is_throttled_per_source() {
        let (runtime, transport, store) = runtime(2).await;
        let request = FetchRequest::get("https://Example.org/novel/1");

        for _ in 0..2 {
            let outcome = runtime.fetch(None, &request).await.unwrap();
            assert!(matches!(outcome, SourceFetch::Completed(ref r) if r.status == 200));
        }

        let throttled = runtime.fetch(None, &request).await.unwrap();
        assert_eq!(
            throttled,
            SourceFetch::Throttled {
                source: "example.org".to_string()
            }
        );
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);

        // Another source has its own bucket.
        let other = runtime
            .fetch(Some("other-source"), &request)
            .await
            .unwrap();
        assert!(matches!(other, SourceFetch::Completed(_)));

        let persisted = store.get("rate_bucket.example.org").await.unwrap().unwrap();
        assert!(persisted.starts_with("2;60000;0;"));
    }

    #[tokio::test]
    async fn test_fetch_rejects_url_without_host() {
        let (runtime, _, _) = runtime(2).await;
        let result = runtime.fetch(None, &FetchRequest::get("not a url")).await;
        assert!(matches!(result, Err(RuntimeError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_evaluate_and_call_use_pool() {
        let (runtime, _, _) = runtime(2).await;

        let value = runtime.evaluate("novelfull", "return 1").await.unwrap();
        assert_eq!(value, Value::String("return 1".to_string()));
        assert_eq!(runtime.provider().pool().cache_size().await, 8);

        let value = runtime
            .call_function("novelfull", "search", vec![serde_json::json!("dune")])
            .await
            .unwrap();
        assert_eq!(value["called"], "search");

        let metrics = runtime.provider().pool().get_metrics("novelfull").unwrap();
        assert_eq!(metrics.call_count, 2);

        runtime.shutdown().await;
        assert_eq!(runtime.provider().pool().size().await, 0);
    }
}
