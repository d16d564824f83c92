//! Engine provider
//!
//! Chooses which engine implementation the pool builds: the bundled engine,
//! or an installed engine plugin. Every mutating call recomputes an
//! [`EngineSnapshot`] and publishes it on a watch channel, so UI code can
//! observe installed engines and capabilities without polling.

use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::info;

use super::engine::{EngineCapabilities, EngineFactory};
use super::pool::{EngineHandle, EnginePool};
use super::registry::{EngineDescriptor, EngineRegistry};
use crate::core::error::{Result, RuntimeError};

/// Which implementation backs the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", content = "engine_id", rename_all = "snake_case")]
pub enum EngineMode {
    NoEngine,
    BundledEngineActive,
    PluginEngineActive(String),
}

/// Observable provider state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub mode: EngineMode,
    pub use_plugin_engines: bool,
    pub active_engine_id: Option<String>,
    pub active_engine_name: Option<String>,
    pub installed_engines: Vec<EngineDescriptor>,
    pub capabilities: EngineCapabilities,
    pub has_engine: bool,
    pub plugin_engine_available: bool,
}

struct ProviderState {
    mode: EngineMode,
    use_plugin_engines: bool,
    preferred_plugin: Option<String>,
}

/// Facade over the engine pool and the engine registry
pub struct EngineProvider {
    pool: Arc<EnginePool>,
    registry: Arc<dyn EngineRegistry>,
    bundled: Arc<dyn EngineFactory>,
    state: Mutex<ProviderState>,
    snapshot_tx: watch::Sender<EngineSnapshot>,
}

impl EngineProvider {
    /// Create a provider with the bundled engine active
    pub async fn new(
        pool: Arc<EnginePool>,
        registry: Arc<dyn EngineRegistry>,
        bundled: Arc<dyn EngineFactory>,
    ) -> Self {
        if pool.factory_id().await != bundled.id() {
            pool.replace_factory(bundled.clone()).await;
        }

        let state = ProviderState {
            mode: EngineMode::BundledEngineActive,
            use_plugin_engines: false,
            preferred_plugin: None,
        };
        let initial = Self::compute_snapshot(&state, registry.as_ref(), bundled.as_ref());
        let (snapshot_tx, _) = watch::channel(initial);

        Self {
            pool,
            registry,
            bundled,
            state: Mutex::new(state),
            snapshot_tx,
        }
    }

    pub fn pool(&self) -> &Arc<EnginePool> {
        &self.pool
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Receive every snapshot published from now on
    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Prefer installed engine plugins over the bundled engine
    ///
    /// With no plugin installed the bundled engine stays active and the
    /// preference is kept for the next [`refresh`](Self::refresh).
    pub async fn set_use_plugin_engines(&self, enabled: bool) -> Result<EngineSnapshot> {
        let mut state = self.state.lock().await;
        state.use_plugin_engines = enabled;

        if enabled {
            if let Some(id) = self.pick_plugin(&state) {
                self.activate_plugin(&mut state, &id).await?;
            }
        } else {
            self.activate_bundled(&mut state).await;
        }

        Ok(self.publish(&state))
    }

    /// Make `id` the active engine; `bundled` selects the built-in one
    pub async fn set_active_engine(&self, id: &str) -> Result<EngineSnapshot> {
        let mut state = self.state.lock().await;

        if id == self.bundled.id() {
            state.use_plugin_engines = false;
            self.activate_bundled(&mut state).await;
        } else {
            if !self.registry.is_installed(id) {
                return Err(RuntimeError::PluginNotFound(id.to_string()));
            }
            state.use_plugin_engines = true;
            state.preferred_plugin = Some(id.to_string());
            self.activate_plugin(&mut state, id).await?;
        }

        Ok(self.publish(&state))
    }

    /// Re-read the registry after an external install or uninstall
    ///
    /// An active plugin that disappeared falls back to the bundled engine;
    /// one that was upgraded in place has its pooled engines rebuilt.
    /// When plugins are preferred and one has become available, it is
    /// activated.
    pub async fn refresh(&self) -> Result<EngineSnapshot> {
        let mut state = self.state.lock().await;

        if let EngineMode::PluginEngineActive(id) = state.mode.clone() {
            match self.registry.factory(&id) {
                None => {
                    info!(engine = %id, "Active engine plugin uninstalled, falling back to bundled engine");
                    self.activate_bundled(&mut state).await;
                }
                Some(factory) if !self.pool.uses_factory(&factory).await => {
                    info!(engine = %id, "Active engine plugin upgraded, replacing pooled engines");
                    self.pool.replace_factory(factory).await;
                }
                Some(_) => {}
            }
        }

        if state.use_plugin_engines && state.mode == EngineMode::BundledEngineActive {
            if let Some(id) = self.pick_plugin(&state) {
                self.activate_plugin(&mut state, &id).await?;
            }
        }

        Ok(self.publish(&state))
    }

    /// Fail with an actionable error when no engine can run scripts
    pub fn require_engine(&self) -> Result<()> {
        if self.snapshot().has_engine {
            Ok(())
        } else {
            Err(RuntimeError::EngineNotAvailable(
                "no engine implementation is reachable".to_string(),
            ))
        }
    }

    pub fn is_plugin_engine_active(&self) -> bool {
        matches!(self.snapshot().mode, EngineMode::PluginEngineActive(_))
    }

    pub fn active_engine_id(&self) -> Option<String> {
        self.snapshot().active_engine_id
    }

    pub fn capabilities(&self) -> EngineCapabilities {
        self.snapshot().capabilities
    }

    pub fn installed_engines(&self) -> Vec<EngineDescriptor> {
        self.registry.installed()
    }

    /// Engine for `key` from the pool
    pub async fn acquire(&self, key: &str) -> Result<Arc<EngineHandle>> {
        self.require_engine()?;
        self.pool.acquire(key).await
    }

    pub async fn release(&self, key: &str) {
        self.pool.release(key).await
    }

    /// Run `operation` on the engine for `key` under the pool's limits
    pub async fn execute<F, Fut, T>(&self, key: &str, budget: Duration, operation: F) -> Result<T>
    where
        F: FnOnce(Arc<EngineHandle>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.require_engine()?;
        self.pool.execute_with_timeout(key, budget, operation).await
    }

    /// Evaluate `script` on the engine for `key`
    pub async fn evaluate(&self, key: &str, script: &str, budget: Duration) -> Result<Value> {
        self.execute(key, budget, |handle| async move {
            handle.evaluate_script(script).await
        })
        .await
    }

    fn pick_plugin(&self, state: &ProviderState) -> Option<String> {
        state
            .preferred_plugin
            .as_ref()
            .filter(|id| self.registry.is_installed(id))
            .cloned()
            .or_else(|| self.registry.installed().into_iter().next().map(|d| d.id))
    }

    async fn activate_plugin(&self, state: &mut ProviderState, id: &str) -> Result<()> {
        let factory = self
            .registry
            .factory(id)
            .ok_or_else(|| RuntimeError::PluginNotFound(id.to_string()))?;
        if state.mode == EngineMode::PluginEngineActive(id.to_string())
            && self.pool.uses_factory(&factory).await
        {
            return Ok(());
        }

        self.pool.replace_factory(factory).await;
        state.mode = EngineMode::PluginEngineActive(id.to_string());
        info!(engine = %id, "Engine plugin activated");
        Ok(())
    }

    async fn activate_bundled(&self, state: &mut ProviderState) {
        if state.mode == EngineMode::BundledEngineActive {
            return;
        }
        self.pool.replace_factory(self.bundled.clone()).await;
        state.mode = EngineMode::BundledEngineActive;
        info!("Bundled engine activated");
    }

    fn publish(&self, state: &ProviderState) -> EngineSnapshot {
        let snapshot = Self::compute_snapshot(state, self.registry.as_ref(), self.bundled.as_ref());
        self.snapshot_tx.send_replace(snapshot.clone());
        snapshot
    }

    fn compute_snapshot(
        state: &ProviderState,
        registry: &dyn EngineRegistry,
        bundled: &dyn EngineFactory,
    ) -> EngineSnapshot {
        let installed_engines = registry.installed();

        let (active_engine_id, active_engine_name, capabilities) = match &state.mode {
            EngineMode::NoEngine => (None, None, EngineCapabilities::default()),
            EngineMode::BundledEngineActive => (
                Some(bundled.id().to_string()),
                Some(bundled.name().to_string()),
                bundled.capabilities(),
            ),
            EngineMode::PluginEngineActive(id) => {
                let descriptor = installed_engines.iter().find(|d| &d.id == id);
                (
                    Some(id.clone()),
                    descriptor.map(|d| d.name.clone()),
                    descriptor.map(|d| d.capabilities).unwrap_or_default(),
                )
            }
        };

        EngineSnapshot {
            has_engine: state.mode != EngineMode::NoEngine,
            plugin_engine_available: !installed_engines.is_empty(),
            mode: state.mode.clone(),
            use_plugin_engines: state.use_plugin_engines,
            active_engine_id,
            active_engine_name,
            installed_engines,
            capabilities,
        }
    }
}
