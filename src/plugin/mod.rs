//! Script engine management
//!
//! Engines are created through an [`EngineFactory`], kept in a bounded
//! [`EnginePool`], and selected by the [`EngineProvider`] from the bundled
//! engine and installed engine plugins.

pub mod bundled;
pub mod code_cache;
pub mod engine;
pub mod metrics;
pub mod pool;
pub mod provider;
pub mod registry;

pub use bundled::{BundledEngine, BundledEngineFactory, BUNDLED_ENGINE_ID};
pub use code_cache::{code_cache_key, CodeCache};
pub use engine::{EngineCapabilities, EngineFactory, ScriptEngine};
pub use metrics::PerformanceMetrics;
pub use pool::{EngineHandle, EnginePool};
pub use provider::{EngineMode, EngineProvider, EngineSnapshot};
pub use registry::{EngineDescriptor, EngineRegistry, InMemoryEngineRegistry};
