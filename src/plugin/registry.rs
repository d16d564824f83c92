//! Engine plugin registry
//!
//! Installing and uninstalling engine plugins happens outside the runtime.
//! The registry is the runtime's read view of what is installed; after an
//! external change the provider is asked to `refresh()`.

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::info;

use super::engine::{EngineCapabilities, EngineFactory};
use crate::core::error::{Result, RuntimeError};

/// Metadata of an installable engine implementation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineDescriptor {
    pub id: String,
    pub name: String,
    pub version: Version,
    pub description: Option<String>,
    pub capabilities: EngineCapabilities,
}

impl EngineDescriptor {
    pub fn new(id: &str, name: &str, version: &str, capabilities: EngineCapabilities) -> Result<Self> {
        let version = Version::parse(version).map_err(|e| {
            RuntimeError::ValidationError(format!("Invalid version '{}' for engine '{}': {}", version, id, e))
        })?;
        Ok(Self {
            id: id.to_string(),
            name: name.to_string(),
            version,
            description: None,
            capabilities,
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Read access to installed engine plugins
pub trait EngineRegistry: Send + Sync {
    /// All installed engines, sorted by id
    fn installed(&self) -> Vec<EngineDescriptor>;

    fn descriptor(&self, id: &str) -> Option<EngineDescriptor>;

    fn factory(&self, id: &str) -> Option<Arc<dyn EngineFactory>>;

    fn is_installed(&self, id: &str) -> bool {
        self.descriptor(id).is_some()
    }
}

struct RegisteredEngine {
    descriptor: EngineDescriptor,
    factory: Arc<dyn EngineFactory>,
}

/// Process-local registry
#[derive(Default)]
pub struct InMemoryEngineRegistry {
    engines: RwLock<HashMap<String, RegisteredEngine>>,
}

impl InMemoryEngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an engine plugin
    ///
    /// Installing a newer version of an installed id upgrades it; the same or
    /// an older version is rejected.
    pub fn install(&self, descriptor: EngineDescriptor, factory: Arc<dyn EngineFactory>) -> Result<()> {
        let mut engines = self.write();

        if let Some(existing) = engines.get(&descriptor.id) {
            if existing.descriptor.version >= descriptor.version {
                return Err(RuntimeError::ValidationError(format!(
                    "Engine {} {} is already installed",
                    existing.descriptor.id, existing.descriptor.version
                )));
            }
        }

        info!(engine = %descriptor.id, version = %descriptor.version, "Engine plugin installed");
        engines.insert(
            descriptor.id.clone(),
            RegisteredEngine { descriptor, factory },
        );
        Ok(())
    }

    pub fn uninstall(&self, id: &str) -> Result<EngineDescriptor> {
        let removed = self
            .write()
            .remove(id)
            .ok_or_else(|| RuntimeError::PluginNotFound(id.to_string()))?;
        info!(engine = %id, "Engine plugin uninstalled");
        Ok(removed.descriptor)
    }

    /// Installed engines whose version satisfies `requirement`
    pub fn find_compatible(&self, requirement: &VersionReq) -> Vec<EngineDescriptor> {
        self.installed()
            .into_iter()
            .filter(|d| requirement.matches(&d.version))
            .collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, RegisteredEngine>> {
        self.engines.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, RegisteredEngine>> {
        self.engines.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EngineRegistry for InMemoryEngineRegistry {
    fn installed(&self) -> Vec<EngineDescriptor> {
        let mut installed: Vec<EngineDescriptor> =
            self.read().values().map(|e| e.descriptor.clone()).collect();
        installed.sort_by(|a, b| a.id.cmp(&b.id));
        installed
    }

    fn descriptor(&self, id: &str) -> Option<EngineDescriptor> {
        self.read().get(id).map(|e| e.descriptor.clone())
    }

    fn factory(&self, id: &str) -> Option<Arc<dyn EngineFactory>> {
        self.read().get(id).map(|e| e.factory.clone())
    }
}
