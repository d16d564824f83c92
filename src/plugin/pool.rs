//! Keyed pool of script engines
//!
//! The pool owns every engine it creates. Handles are evicted least recently
//! used when the pool is full, on explicit removal, or when the pool is
//! cleared. Idle handles are never disposed behind a caller's back.
//!
//! Three independent locks guard the pool: the engine map (together with the
//! active factory), the code cache, and the metrics table. No call path holds
//! two of them at once.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::code_cache::CodeCache;
use super::engine::{EngineFactory, ScriptEngine};
use super::metrics::PerformanceMetrics;
use crate::core::config::PoolConfig;
use crate::core::error::{Result, RuntimeError};

/// Pooled engine bound to one key
pub struct EngineHandle {
    key: String,
    instance_id: Uuid,
    factory_id: String,
    engine: Box<dyn ScriptEngine>,
    created_at: DateTime<Utc>,
    disposed: AtomicBool,
}

impl EngineHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Id of the factory that built this engine
    pub fn factory_id(&self) -> &str {
        &self.factory_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub async fn evaluate_script(&self, script: &str) -> Result<Value> {
        self.ensure_live()?;
        self.engine.evaluate_script(script).await
    }

    pub async fn call_function(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        self.ensure_live()?;
        self.engine.call_function(name, args).await
    }

    pub async fn set_global_object(&self, name: &str, value: Value) -> Result<()> {
        self.ensure_live()?;
        self.engine.set_global_object(name, value).await
    }

    pub async fn get_global_object(&self, name: &str) -> Result<Option<Value>> {
        self.ensure_live()?;
        self.engine.get_global_object(name).await
    }

    /// Ask the engine to abort the running script
    pub fn interrupt(&self) {
        self.engine.interrupt();
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            Err(RuntimeError::EngineDisposed(self.key.clone()))
        } else {
            Ok(())
        }
    }

    /// Dispose the engine once; later calls are no-ops
    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.engine.dispose().await {
            warn!(key = %self.key, instance = %self.instance_id, error = %e, "Engine dispose failed");
        }
    }
}

struct PoolEntry {
    handle: Arc<EngineHandle>,
    last_used_time: DateTime<Utc>,
    last_used_tick: u64,
}

struct PoolState {
    entries: HashMap<String, PoolEntry>,
    factory: Arc<dyn EngineFactory>,
    tick: u64,
}

impl PoolState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn lru_key(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used_tick)
            .map(|(key, _)| key.clone())
    }
}

/// Snapshot of one pooled engine
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolEntryInfo {
    pub key: String,
    pub instance_id: Uuid,
    pub factory_id: String,
    pub created_at: DateTime<Utc>,
    pub last_used_time: DateTime<Utc>,
}

/// Bounded, keyed engine pool
pub struct EnginePool {
    state: Mutex<PoolState>,
    cache: Mutex<CodeCache>,
    metrics: std::sync::Mutex<HashMap<String, PerformanceMetrics>>,
    gate: Arc<Semaphore>,
    config: PoolConfig,
}

impl EnginePool {
    pub fn new(config: PoolConfig, factory: Arc<dyn EngineFactory>) -> Self {
        info!(
            max_pool_size = config.max_pool_size,
            max_concurrent_executions = config.max_concurrent_executions,
            max_cache_size_bytes = config.max_cache_size_bytes,
            factory = factory.id(),
            "Engine pool created"
        );

        Self {
            state: Mutex::new(PoolState {
                entries: HashMap::new(),
                factory,
                tick: 0,
            }),
            cache: Mutex::new(CodeCache::new(config.max_cache_size_bytes)),
            metrics: std::sync::Mutex::new(HashMap::new()),
            gate: Arc::new(Semaphore::new(config.max_concurrent_executions.max(1))),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get the engine for `key`, creating it if needed
    ///
    /// A new engine is constructed and initialized before anything is
    /// evicted, so a construction failure leaves the pool untouched.
    pub async fn acquire(&self, key: &str) -> Result<Arc<EngineHandle>> {
        let mut state = self.state.lock().await;
        let tick = state.next_tick();

        if let Some(entry) = state.entries.get_mut(key) {
            entry.last_used_time = Utc::now();
            entry.last_used_tick = tick;
            return Ok(entry.handle.clone());
        }

        let factory = state.factory.clone();
        let engine = factory.create(key).await.map_err(|e| init_error(key, e))?;
        if let Err(e) = engine.initialize().await {
            if let Err(dispose_err) = engine.dispose().await {
                warn!(key = %key, error = %dispose_err, "Failed to dispose engine after init failure");
            }
            return Err(init_error(key, e));
        }

        let evicted = if state.entries.len() >= self.config.max_pool_size.max(1) {
            state
                .lru_key()
                .and_then(|lru| state.entries.remove(&lru))
        } else {
            None
        };

        let handle = Arc::new(EngineHandle {
            key: key.to_string(),
            instance_id: Uuid::new_v4(),
            factory_id: factory.id().to_string(),
            engine,
            created_at: Utc::now(),
            disposed: AtomicBool::new(false),
        });

        state.entries.insert(
            key.to_string(),
            PoolEntry {
                handle: handle.clone(),
                last_used_time: Utc::now(),
                last_used_tick: tick,
            },
        );
        let size = state.entries.len();
        drop(state);

        debug!(key = %key, instance = %handle.instance_id, factory = factory.id(), size, "Engine created");

        if let Some(entry) = evicted {
            info!(key = %entry.handle.key, "Evicting least recently used engine");
            entry.handle.dispose().await;
        }

        Ok(handle)
    }

    /// Mark `key` as used now; never disposes
    pub async fn release(&self, key: &str) {
        let mut state = self.state.lock().await;
        let tick = state.next_tick();
        if let Some(entry) = state.entries.get_mut(key) {
            entry.last_used_time = Utc::now();
            entry.last_used_tick = tick;
        }
    }

    /// Dispose and evict `key`; absent keys are ignored
    pub async fn remove(&self, key: &str) {
        let removed = self.state.lock().await.entries.remove(key);
        if let Some(entry) = removed {
            entry.handle.dispose().await;
            debug!(key = %key, "Engine removed");
        }
    }

    /// Dispose every engine and empty the pool
    pub async fn clear(&self) {
        let drained: Vec<PoolEntry> = {
            let mut state = self.state.lock().await;
            state.entries.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            entry.handle.dispose().await;
        }
        if count > 0 {
            info!(count, "Engine pool cleared");
        }
    }

    /// Swap the engine implementation, disposing every existing engine first
    pub async fn replace_factory(&self, factory: Arc<dyn EngineFactory>) {
        let drained: Vec<PoolEntry> = {
            let mut state = self.state.lock().await;
            state.factory = factory;
            state.entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            entry.handle.dispose().await;
        }
    }

    /// Id of the factory new engines are built with
    pub async fn factory_id(&self) -> String {
        self.state.lock().await.factory.id().to_string()
    }

    /// Whether new engines are built by exactly this factory instance
    pub async fn uses_factory(&self, factory: &Arc<dyn EngineFactory>) -> bool {
        Arc::ptr_eq(&self.state.lock().await.factory, factory)
    }

    pub async fn size(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.state.lock().await.entries.contains_key(key)
    }

    /// Pooled engines, least recently used first
    pub async fn entries(&self) -> Vec<PoolEntryInfo> {
        let state = self.state.lock().await;
        let mut entries: Vec<(&PoolEntry, PoolEntryInfo)> = state
            .entries
            .values()
            .map(|entry| {
                (
                    entry,
                    PoolEntryInfo {
                        key: entry.handle.key.clone(),
                        instance_id: entry.handle.instance_id,
                        factory_id: entry.handle.factory_id.clone(),
                        created_at: entry.handle.created_at,
                        last_used_time: entry.last_used_time,
                    },
                )
            })
            .collect();
        entries.sort_by_key(|(entry, _)| entry.last_used_tick);
        entries.into_iter().map(|(_, info)| info).collect()
    }

    /// Number of free execution slots
    pub fn available_permits(&self) -> usize {
        self.gate.available_permits()
    }

    /// Run `operation` on the engine for `key` under the concurrency gate
    ///
    /// Exactly one metrics update is recorded per call, including when the
    /// engine cannot be acquired, the operation fails, or the returned future
    /// is dropped before completion.
    pub async fn execute_with_limit<F, Fut, T>(&self, key: &str, operation: F) -> Result<T>
    where
        F: FnOnce(Arc<EngineHandle>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = self
            .gate
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| RuntimeError::TaskError(format!("Execution gate closed: {}", e)))?;

        let mut recorder = MetricsRecorder {
            metrics: &self.metrics,
            key,
            started: Instant::now(),
            success: false,
            memory_bytes: self.config.estimated_engine_memory_bytes,
        };

        let handle = self.acquire(key).await?;
        let result = operation(handle).await;
        recorder.success = result.is_ok();
        result
    }

    /// [`execute_with_limit`](Self::execute_with_limit) with a time budget
    ///
    /// An overrun interrupts the engine and fails with
    /// [`RuntimeError::Timeout`], distinct from script errors.
    pub async fn execute_with_timeout<F, Fut, T>(
        &self,
        key: &str,
        budget: Duration,
        operation: F,
    ) -> Result<T>
    where
        F: FnOnce(Arc<EngineHandle>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_limit(key, |handle| async move {
            let running = handle.clone();
            match tokio::time::timeout(budget, operation(handle)).await {
                Ok(result) => result,
                Err(_) => {
                    running.interrupt();
                    warn!(key = %key, budget_ms = budget.as_millis() as u64, "Engine evaluation timed out");
                    Err(RuntimeError::Timeout(format!(
                        "evaluation for '{}' exceeded {} ms",
                        key,
                        budget.as_millis()
                    )))
                }
            }
        })
        .await
    }

    /// Cached text for `cache_key`, caching `code` on a miss
    pub async fn get_cached_code(&self, cache_key: &str, code: &str) -> String {
        self.cache.lock().await.get_or_insert(cache_key, code)
    }

    /// Bytes currently held by the code cache
    pub async fn cache_size(&self) -> u64 {
        self.cache.lock().await.current_size()
    }

    pub fn get_metrics(&self, key: &str) -> Option<PerformanceMetrics> {
        self.lock_metrics().get(key).cloned()
    }

    pub fn get_all_metrics(&self) -> HashMap<String, PerformanceMetrics> {
        self.lock_metrics().clone()
    }

    pub fn clear_metrics(&self, key: &str) {
        self.lock_metrics().remove(key);
    }

    fn lock_metrics(&self) -> std::sync::MutexGuard<'_, HashMap<String, PerformanceMetrics>> {
        self.metrics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn init_error(key: &str, e: RuntimeError) -> RuntimeError {
    match e {
        RuntimeError::EngineInitialization { .. } => e,
        other => RuntimeError::EngineInitialization {
            key: key.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Records one metrics update when dropped
struct MetricsRecorder<'a> {
    metrics: &'a std::sync::Mutex<HashMap<String, PerformanceMetrics>>,
    key: &'a str,
    started: Instant,
    success: bool,
    memory_bytes: u64,
}

impl Drop for MetricsRecorder<'_> {
    fn drop(&mut self) {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        let mut metrics = self
            .metrics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        metrics
            .entry(self.key.to_string())
            .or_default()
            .record(elapsed_ms, self.success, self.memory_bytes);
    }
}
