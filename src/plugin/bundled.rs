//! Bundled V8 engine
//!
//! `JsRuntime` is neither `Send` nor `Sync`, so each engine owns a dedicated
//! thread running a current-thread tokio runtime. The [`BundledEngine`]
//! handle talks to it through a command channel with oneshot replies, which
//! makes the handle itself `Send + Sync`.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use deno_core::v8;
use deno_core::{JsRuntime, RuntimeOptions};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use super::engine::{EngineCapabilities, EngineFactory, ScriptEngine};
use crate::core::error::{Result, RuntimeError};

/// Factory id of the built-in engine
pub const BUNDLED_ENGINE_ID: &str = "bundled";

const BOOTSTRAP: &str = r#"
globalThis.__engine_invoke = async function (name, args) {
    globalThis.__engine_status = 'pending';
    globalThis.__engine_result = undefined;
    globalThis.__engine_error = undefined;
    try {
        const func = globalThis[name];
        if (typeof func !== 'function') {
            throw new Error(`Function ${name} not found`);
        }
        const result = await func(...args);
        globalThis.__engine_result = JSON.stringify(result === undefined ? null : result);
        globalThis.__engine_status = 'success';
    } catch (e) {
        globalThis.__engine_error = e && e.stack ? e.stack : String(e);
        globalThis.__engine_status = 'error';
    }
};
"#;

enum EngineCommand {
    Initialize {
        resp: oneshot::Sender<Result<()>>,
    },
    Evaluate {
        script: String,
        resp: oneshot::Sender<Result<Value>>,
    },
    CallFunction {
        name: String,
        args: Vec<Value>,
        resp: oneshot::Sender<Result<Value>>,
    },
    SetGlobal {
        name: String,
        value: Value,
        resp: oneshot::Sender<Result<()>>,
    },
    GetGlobal {
        name: String,
        resp: oneshot::Sender<Result<Option<Value>>>,
    },
    Dispose {
        resp: oneshot::Sender<Result<()>>,
    },
}

/// Runtime state living on the worker thread
struct Worker {
    runtime: JsRuntime,
}

impl Worker {
    fn new() -> Self {
        Self {
            runtime: JsRuntime::new(RuntimeOptions::default()),
        }
    }

    fn initialize(&mut self) -> anyhow::Result<()> {
        self.runtime
            .execute_script("<engine_bootstrap>", BOOTSTRAP.to_string().into())
            .context("Failed to install engine bootstrap")?;
        Ok(())
    }

    async fn evaluate(&mut self, script: String) -> anyhow::Result<Value> {
        let completion = self.runtime.execute_script("<evaluate>", script.into())?;
        self.runtime.run_event_loop(Default::default()).await?;

        let scope = &mut self.runtime.handle_scope();
        let value = v8::Local::new(scope, completion);
        to_json(scope, value)
    }

    async fn call_function(&mut self, name: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        let args_json = serde_json::to_string(&args)?;

        {
            let scope = &mut self.runtime.handle_scope();
            let context = scope.get_current_context();
            let global = context.global(scope);

            let invoke_name = v8_string(scope, "__engine_invoke")?;
            let invoke_val = global
                .get(scope, invoke_name.into())
                .ok_or_else(|| anyhow!("engine is not initialized"))?;
            let invoke_func = v8::Local::<v8::Function>::try_from(invoke_val)
                .map_err(|_| anyhow!("engine is not initialized"))?;

            let func_name = v8_string(scope, name)?;
            let args_text = v8_string(scope, &args_json)?;
            let args_val = v8::json::parse(scope, args_text)
                .ok_or_else(|| anyhow!("Failed to parse arguments"))?;

            let recv = v8::undefined(scope).into();
            if invoke_func
                .call(scope, recv, &[func_name.into(), args_val])
                .is_none()
            {
                return Err(anyhow!("Failed to call '{}'", name));
            }
        }

        self.runtime
            .run_event_loop(Default::default())
            .await
            .context("Failed to run event loop")?;

        let outcome = {
            let scope = &mut self.runtime.handle_scope();
            let status = global_string(scope, "__engine_status")
                .ok_or_else(|| anyhow!("Failed to retrieve execution status"))?;

            match status.as_str() {
                "success" => global_string(scope, "__engine_result")
                    .ok_or_else(|| anyhow!("'{}' finished without a result", name)),
                "error" => Err(anyhow!(global_string(scope, "__engine_error")
                    .unwrap_or_else(|| "Unknown error".to_string()))),
                "pending" => Err(anyhow!("Event loop finished but '{}' is still pending", name)),
                other => Err(anyhow!("Invalid execution status: {}", other)),
            }
        };

        // Large results stay reachable from the globals otherwise.
        let _ = self.runtime.execute_script(
            "<cleanup>",
            "globalThis.__engine_result = undefined; globalThis.__engine_error = undefined; globalThis.__engine_status = undefined;"
                .to_string()
                .into(),
        );

        let text = outcome?;
        serde_json::from_str(&text).with_context(|| format!("Invalid result from '{}'", name))
    }

    fn set_global(&mut self, name: &str, value: &Value) -> anyhow::Result<()> {
        let text = serde_json::to_string(value)?;

        let scope = &mut self.runtime.handle_scope();
        let context = scope.get_current_context();
        let global = context.global(scope);

        let key = v8_string(scope, name)?;
        let json = v8_string(scope, &text)?;
        let parsed =
            v8::json::parse(scope, json).ok_or_else(|| anyhow!("Failed to parse value for '{}'", name))?;
        global
            .set(scope, key.into(), parsed)
            .ok_or_else(|| anyhow!("Failed to set global '{}'", name))?;
        Ok(())
    }

    fn get_global(&mut self, name: &str) -> anyhow::Result<Option<Value>> {
        let scope = &mut self.runtime.handle_scope();
        let context = scope.get_current_context();
        let global = context.global(scope);

        let key = v8_string(scope, name)?;
        match global.get(scope, key.into()) {
            Some(value) if !value.is_undefined() => to_json(scope, value).map(Some),
            _ => Ok(None),
        }
    }

    /// Clear a termination left over from an interrupted script
    fn reset_termination(&mut self) {
        self.runtime.v8_isolate().cancel_terminate_execution();
    }
}

fn v8_string<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: &str,
) -> anyhow::Result<v8::Local<'s, v8::String>> {
    v8::String::new(scope, value).ok_or_else(|| anyhow!("String too large for V8"))
}

fn global_string(scope: &mut v8::HandleScope, key: &str) -> Option<String> {
    let context = scope.get_current_context();
    let global = context.global(scope);
    let key = v8::String::new(scope, key)?;
    let value = global.get(scope, key.into())?;
    if value.is_undefined() || value.is_null() {
        return None;
    }
    Some(value.to_string(scope)?.to_rust_string_lossy(scope))
}

fn to_json<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
) -> anyhow::Result<Value> {
    if value.is_undefined() || value.is_null() || value.is_function() || value.is_symbol() {
        return Ok(Value::Null);
    }
    let text = v8::json::stringify(scope, value)
        .ok_or_else(|| anyhow!("Value is not JSON-serializable"))?
        .to_rust_string_lossy(scope);
    serde_json::from_str(&text).context("Value is not JSON-serializable")
}

fn script_error(e: anyhow::Error) -> RuntimeError {
    RuntimeError::ScriptError(format!("{:#}", e))
}

/// Handle to a V8 context running on its own thread
pub struct BundledEngine {
    key: String,
    tx: mpsc::Sender<EngineCommand>,
    isolate: v8::IsolateHandle,
    disposed: AtomicBool,
}

impl BundledEngine {
    /// Start the worker thread and wait until its runtime exists
    pub async fn spawn(key: &str) -> Result<Self> {
        let (tx, mut rx) = mpsc::channel::<EngineCommand>(32);
        let (ready_tx, ready_rx) = oneshot::channel::<std::result::Result<v8::IsolateHandle, String>>();
        let worker_key = key.to_string();

        thread::Builder::new()
            .name(format!("engine-{}", key))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(key = %worker_key, error = %e, "Failed to create engine runtime");
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };

                let local = tokio::task::LocalSet::new();
                local.block_on(&rt, async move {
                    let mut worker = Worker::new();
                    let handle = worker.runtime.v8_isolate().thread_safe_handle();
                    if ready_tx.send(Ok(handle)).is_err() {
                        return;
                    }

                    debug!(key = %worker_key, "Engine worker ready");

                    while let Some(command) = rx.recv().await {
                        worker.reset_termination();
                        match command {
                            EngineCommand::Initialize { resp } => {
                                let _ = resp.send(worker.initialize().map_err(script_error));
                            }
                            EngineCommand::Evaluate { script, resp } => {
                                let _ = resp.send(worker.evaluate(script).await.map_err(script_error));
                            }
                            EngineCommand::CallFunction { name, args, resp } => {
                                let result = worker.call_function(&name, args).await.map_err(script_error);
                                let _ = resp.send(result);
                            }
                            EngineCommand::SetGlobal { name, value, resp } => {
                                let _ = resp.send(worker.set_global(&name, &value).map_err(script_error));
                            }
                            EngineCommand::GetGlobal { name, resp } => {
                                let _ = resp.send(worker.get_global(&name).map_err(script_error));
                            }
                            EngineCommand::Dispose { resp } => {
                                let _ = resp.send(Ok(()));
                                break;
                            }
                        }
                    }

                    debug!(key = %worker_key, "Engine worker exiting");
                });
            })
            .map_err(|e| RuntimeError::EngineInitialization {
                key: key.to_string(),
                reason: format!("Failed to spawn engine thread: {}", e),
            })?;

        let isolate = ready_rx
            .await
            .map_err(|_| RuntimeError::EngineInitialization {
                key: key.to_string(),
                reason: "Engine thread exited during startup".to_string(),
            })?
            .map_err(|reason| RuntimeError::EngineInitialization {
                key: key.to_string(),
                reason,
            })?;

        Ok(Self {
            key: key.to_string(),
            tx,
            isolate,
            disposed: AtomicBool::new(false),
        })
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T>>) -> EngineCommand,
    ) -> Result<T> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(RuntimeError::EngineDisposed(self.key.clone()));
        }

        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(command(resp_tx))
            .await
            .map_err(|_| RuntimeError::EngineDisposed(self.key.clone()))?;

        resp_rx
            .await
            .map_err(|_| RuntimeError::EngineDisposed(self.key.clone()))?
    }
}

#[async_trait]
impl ScriptEngine for BundledEngine {
    async fn initialize(&self) -> Result<()> {
        self.request(|resp| EngineCommand::Initialize { resp }).await
    }

    async fn evaluate_script(&self, script: &str) -> Result<Value> {
        let script = script.to_string();
        self.request(|resp| EngineCommand::Evaluate { script, resp }).await
    }

    async fn call_function(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let name = name.to_string();
        self.request(|resp| EngineCommand::CallFunction { name, args, resp })
            .await
    }

    async fn set_global_object(&self, name: &str, value: Value) -> Result<()> {
        let name = name.to_string();
        self.request(|resp| EngineCommand::SetGlobal { name, value, resp })
            .await
    }

    async fn get_global_object(&self, name: &str) -> Result<Option<Value>> {
        let name = name.to_string();
        self.request(|resp| EngineCommand::GetGlobal { name, resp }).await
    }

    async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // A script stuck in a loop would never read the dispose command.
        self.isolate.terminate_execution();

        let (resp_tx, resp_rx) = oneshot::channel();
        if self.tx.send(EngineCommand::Dispose { resp: resp_tx }).await.is_ok() {
            let _ = resp_rx.await;
        }
        info!(key = %self.key, "Bundled engine disposed");
        Ok(())
    }

    fn interrupt(&self) {
        self.isolate.terminate_execution();
    }
}

/// Factory for [`BundledEngine`]s
#[derive(Debug, Default, Clone)]
pub struct BundledEngineFactory;

impl BundledEngineFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EngineFactory for BundledEngineFactory {
    fn id(&self) -> &str {
        BUNDLED_ENGINE_ID
    }

    fn name(&self) -> &str {
        "Bundled V8"
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            promises: true,
            es_modules: false,
            interruptible: true,
        }
    }

    async fn create(&self, key: &str) -> Result<Box<dyn ScriptEngine>> {
        Ok(Box::new(BundledEngine::spawn(key).await?))
    }
}
