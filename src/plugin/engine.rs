//! Script engine abstraction
//!
//! Every engine backend, bundled or supplied by a plugin, exposes the same
//! lifecycle: `initialize` once after construction, any number of script
//! calls, `dispose` once before it is dropped. The pool only ever talks to
//! engines through these traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::Result;

/// Feature flags advertised by an engine implementation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCapabilities {
    /// `async` functions and promises are driven to completion
    pub promises: bool,
    /// ES module syntax is accepted
    pub es_modules: bool,
    /// Engine can be interrupted while a script is running
    pub interruptible: bool,
}

/// One isolated script execution context
///
/// Values cross the boundary as JSON. Methods take `&self` so a handle can be
/// shared by the pool and the caller running an operation on it.
#[async_trait]
pub trait ScriptEngine: Send + Sync {
    /// Prepare the context; called exactly once, right after construction
    async fn initialize(&self) -> Result<()>;

    /// Evaluate `script` and return its completion value
    async fn evaluate_script(&self, script: &str) -> Result<Value>;

    /// Call the global function `name` with positional arguments
    async fn call_function(&self, name: &str, args: Vec<Value>) -> Result<Value>;

    async fn set_global_object(&self, name: &str, value: Value) -> Result<()>;

    /// Read a global; `None` when it is undefined
    async fn get_global_object(&self, name: &str) -> Result<Option<Value>>;

    /// Release the context; called exactly once, on removal from the pool
    async fn dispose(&self) -> Result<()>;

    /// Abort the script currently running, if the backend supports it
    fn interrupt(&self) {}
}

/// Constructs engines of one implementation
#[async_trait]
pub trait EngineFactory: Send + Sync {
    /// Stable identifier (`bundled` for the built-in engine, plugin id otherwise)
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn capabilities(&self) -> EngineCapabilities;

    /// Construct an uninitialized engine for `key`
    async fn create(&self, key: &str) -> Result<Box<dyn ScriptEngine>>;
}
