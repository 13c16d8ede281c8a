//! WASM Plugin Host
//!
//! Loads plugin directories (`plugin.json` + WebAssembly module) with
//! wasmtime and turns the module's exports into a function table. Every call
//! runs in a fresh store with fuel metering and a memory cap, on a blocking
//! thread so a busy plugin never stalls the async runtime.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use wasmtime::*;

use super::manifest::{PluginManifest, MANIFEST_FILE};
use crate::core::bus::EventBus;
use crate::core::registry::{
    CallContext, FunctionTable, HandlerError, HandlerResult, InitHook, PluginFunction,
    PluginRegistration,
};
use crate::core::settings::PluginSettings;
use crate::core::{CoreError, CoreResult, EventName};

/// Limits applied to every plugin call.
#[derive(Debug, Clone)]
pub struct WasmRuntimeConfig {
    /// Fuel granted to each call
    pub fuel_per_call: u64,
    /// Maximum linear memory per instance (bytes)
    pub max_memory_bytes: usize,
}

impl Default for WasmRuntimeConfig {
    fn default() -> Self {
        Self {
            fuel_per_call: 10_000_000,
            max_memory_bytes: 64 * 1024 * 1024, // 64MB
        }
    }
}

impl From<&PluginSettings> for WasmRuntimeConfig {
    fn from(settings: &PluginSettings) -> Self {
        Self {
            fuel_per_call: settings.fuel_per_call,
            max_memory_bytes: (settings.max_memory_mb as usize) * 1024 * 1024,
        }
    }
}

/// Per-call store state
pub struct PluginStoreState {
    pub plugin_id: String,
    limits: StoreLimits,
    /// Events queued by `host_emit`, published once the call returns
    emitted: Vec<(EventName, Value)>,
}

// =============================================================================
// Host
// =============================================================================

/// Owns the wasmtime engine shared by all plugins.
pub struct WasmPluginHost {
    engine: Engine,
    linker: Linker<PluginStoreState>,
    config: WasmRuntimeConfig,
}

impl WasmPluginHost {
    pub fn new(config: WasmRuntimeConfig) -> CoreResult<Self> {
        let mut wasmtime_config = Config::new();
        wasmtime_config.consume_fuel(true);

        let engine = Engine::new(&wasmtime_config)
            .map_err(|e| CoreError::Internal(format!("Failed to create WASM engine: {}", e)))?;

        let mut linker = Linker::new(&engine);
        Self::add_host_functions(&mut linker)?;

        Ok(Self {
            engine,
            linker,
            config,
        })
    }

    pub fn config(&self) -> &WasmRuntimeConfig {
        &self.config
    }

    /// Plugin directories under `root`: every directory (root included)
    /// holding a `plugin.json`, sorted by path.
    pub fn discover(root: &Path) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = walkdir::WalkDir::new(root)
            .max_depth(2)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file() && entry.file_name() == MANIFEST_FILE)
            .filter_map(|entry| entry.path().parent().map(Path::to_path_buf))
            .collect();
        dirs.sort();
        dirs
    }

    /// Loads a plugin directory. Fails when the manifest is invalid, the
    /// module does not compile or a declared export is missing.
    pub fn load(&self, plugin_dir: &Path) -> CoreResult<Arc<WasmPlugin>> {
        let manifest = PluginManifest::load_from_file(&plugin_dir.join(MANIFEST_FILE))?;

        let wasm_path = crate::core::fs::resolve_within(plugin_dir, &manifest.entry, "entry")
            .map_err(CoreError::InvalidPluginManifest)?;
        let wasm_bytes = std::fs::read(&wasm_path).map_err(|e| {
            CoreError::PluginLoadFailed(format!(
                "Failed to read module {}: {}",
                wasm_path.display(),
                e
            ))
        })?;

        let module = Module::new(&self.engine, &wasm_bytes).map_err(|e| {
            CoreError::PluginLoadFailed(format!("Failed to compile {}: {}", manifest.id, e))
        })?;
        Self::check_exports(&manifest, &module)?;

        tracing::info!(
            "Loaded WASM plugin: {} v{} ({} functions)",
            manifest.name,
            manifest.version,
            manifest.functions.len()
        );

        Ok(Arc::new(WasmPlugin {
            manifest,
            dir: plugin_dir.to_path_buf(),
            engine: self.engine.clone(),
            linker: self.linker.clone(),
            module,
            config: self.config.clone(),
        }))
    }

    fn check_exports(manifest: &PluginManifest, module: &Module) -> CoreResult<()> {
        let has_func = |name: &str| {
            module
                .get_export(name)
                .is_some_and(|ty| matches!(ty, ExternType::Func(_)))
        };
        let missing = |name: &str| {
            CoreError::PluginLoadFailed(format!(
                "Plugin {} does not export '{}'",
                manifest.id, name
            ))
        };

        if !matches!(module.get_export("memory"), Some(ExternType::Memory(_))) {
            return Err(missing("memory"));
        }
        if !has_func("alloc") {
            return Err(missing("alloc"));
        }
        if manifest.init && !has_func("init") {
            return Err(missing("init"));
        }
        for function in &manifest.functions {
            if !has_func(function) {
                return Err(missing(function));
            }
        }
        Ok(())
    }

    /// Adds host functions to the linker
    fn add_host_functions(linker: &mut Linker<PluginStoreState>) -> CoreResult<()> {
        linker
            .func_wrap(
                "env",
                "host_log",
                |mut caller: Caller<'_, PluginStoreState>, level: i32, ptr: i32, len: i32| {
                    let Some(bytes) = read_caller_bytes(&mut caller, ptr, len) else {
                        return;
                    };
                    let message = String::from_utf8_lossy(&bytes);
                    let plugin_id = &caller.data().plugin_id;
                    match level {
                        0 => tracing::debug!("[plugin:{}] {}", plugin_id, message),
                        1 => tracing::info!("[plugin:{}] {}", plugin_id, message),
                        2 => tracing::warn!("[plugin:{}] {}", plugin_id, message),
                        _ => tracing::error!("[plugin:{}] {}", plugin_id, message),
                    }
                },
            )
            .map_err(|e| CoreError::Internal(format!("Failed to add host_log: {}", e)))?;

        linker
            .func_wrap("env", "host_time_now", || -> i64 {
                chrono::Utc::now().timestamp_millis()
            })
            .map_err(|e| CoreError::Internal(format!("Failed to add host_time_now: {}", e)))?;

        linker
            .func_wrap(
                "env",
                "host_emit",
                |mut caller: Caller<'_, PluginStoreState>,
                 name_ptr: i32,
                 name_len: i32,
                 payload_ptr: i32,
                 payload_len: i32| {
                    let name = read_caller_bytes(&mut caller, name_ptr, name_len)
                        .and_then(|bytes| String::from_utf8(bytes).ok());
                    let payload = read_caller_bytes(&mut caller, payload_ptr, payload_len)
                        .map(|bytes| serde_json::from_slice(&bytes).unwrap_or(Value::Null));
                    match (name, payload) {
                        (Some(name), Some(payload)) if !name.trim().is_empty() => {
                            caller.data_mut().emitted.push((name, payload));
                        }
                        _ => tracing::warn!(
                            "[plugin:{}] host_emit with invalid arguments",
                            caller.data().plugin_id
                        ),
                    }
                },
            )
            .map_err(|e| CoreError::Internal(format!("Failed to add host_emit: {}", e)))?;

        Ok(())
    }
}

fn read_caller_bytes(caller: &mut Caller<'_, PluginStoreState>, ptr: i32, len: i32) -> Option<Vec<u8>> {
    let memory = caller.get_export("memory").and_then(|e| e.into_memory())?;
    let start = usize::try_from(ptr).ok()?;
    let end = start.checked_add(usize::try_from(len).ok()?)?;
    memory.data(&*caller).get(start..end).map(<[u8]>::to_vec)
}

// =============================================================================
// Loaded Plugin
// =============================================================================

/// A compiled plugin, ready to be registered.
pub struct WasmPlugin {
    pub manifest: PluginManifest,
    pub dir: PathBuf,
    engine: Engine,
    linker: Linker<PluginStoreState>,
    module: Module,
    config: WasmRuntimeConfig,
}

/// Result of one plugin call.
struct CallOutput {
    result: Value,
    emitted: Vec<(EventName, Value)>,
}

impl WasmPlugin {
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    /// Builds the registry entry: one handler per declared function, the
    /// declared automation events and, when requested, the `init` hook.
    pub fn registration(self: &Arc<Self>, bus: Arc<EventBus>) -> CoreResult<PluginRegistration> {
        let mut builder = FunctionTable::builder();
        for function in &self.manifest.functions {
            builder = builder.handler(
                function.clone(),
                Arc::new(WasmFunction {
                    plugin: Arc::clone(self),
                    function: function.clone(),
                    bus: Arc::clone(&bus),
                }),
            );
        }

        let mut registration = PluginRegistration::new(self.manifest.id.clone(), builder.build()?)?
            .with_automation_events(self.manifest.automation_events.clone());
        if self.manifest.init {
            registration = registration.with_init_hook(Arc::new(WasmInitHook {
                plugin: Arc::clone(self),
            }));
        }
        Ok(registration)
    }

    fn instantiate(&self) -> Result<(Store<PluginStoreState>, Instance), String> {
        let state = PluginStoreState {
            plugin_id: self.manifest.id.clone(),
            limits: StoreLimitsBuilder::new()
                .memory_size(self.config.max_memory_bytes)
                .build(),
            emitted: Vec::new(),
        };
        let mut store = Store::new(&self.engine, state);
        store.limiter(|state| &mut state.limits);
        store
            .set_fuel(self.config.fuel_per_call)
            .map_err(|e| format!("Failed to set fuel: {}", e))?;

        let instance = self
            .linker
            .instantiate(&mut store, &self.module)
            .map_err(|e| describe_trap(&e))?;
        Ok((store, instance))
    }

    fn invoke_blocking(&self, function: &str, input: &[u8]) -> Result<CallOutput, String> {
        let (mut store, instance) = self.instantiate()?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| "Module has no memory export".to_string())?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, "alloc")
            .map_err(|e| format!("Invalid alloc export: {}", e))?;
        let func = instance
            .get_typed_func::<(i32, i32), i64>(&mut store, function)
            .map_err(|e| format!("Invalid export '{}': {}", function, e))?;

        let len = i32::try_from(input.len()).map_err(|_| "Arguments are too large".to_string())?;
        let ptr = alloc.call(&mut store, len).map_err(|e| describe_trap(&e))?;
        let offset = usize::try_from(ptr).map_err(|_| "alloc returned a negative pointer".to_string())?;
        memory
            .write(&mut store, offset, input)
            .map_err(|e| format!("Failed to write arguments: {}", e))?;

        let packed = func
            .call(&mut store, (ptr, len))
            .map_err(|e| describe_trap(&e))?;
        let reply = reply_slice(memory.data(&store), packed)?;
        let result = decode_reply(reply)?;
        let emitted = std::mem::take(&mut store.data_mut().emitted);
        Ok(CallOutput { result, emitted })
    }

    fn init_blocking(&self) -> Result<(), String> {
        let (mut store, instance) = self.instantiate()?;
        let init = instance
            .get_typed_func::<(), i32>(&mut store, "init")
            .map_err(|e| format!("Invalid init export: {}", e))?;
        match init.call(&mut store, ()).map_err(|e| describe_trap(&e))? {
            0 => Ok(()),
            code => Err(format!("init returned {}", code)),
        }
    }
}

fn describe_trap(err: &wasmtime::Error) -> String {
    match err.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => "Plugin ran out of fuel".to_string(),
        Some(trap) => format!("Plugin trapped: {}", trap),
        None => format!("Plugin failed: {}", err),
    }
}

/// Guest reply as `(ptr << 32) | len`, checked against linear memory before
/// anything is copied.
fn reply_slice(memory: &[u8], packed: i64) -> Result<&[u8], String> {
    let ptr = ((packed as u64) >> 32) as usize;
    let len = ((packed as u64) & 0xffff_ffff) as usize;
    ptr.checked_add(len)
        .and_then(|end| memory.get(ptr..end))
        .ok_or_else(|| {
            format!(
                "Reply ({} bytes at {}) is outside guest memory ({} bytes)",
                len,
                ptr,
                memory.len()
            )
        })
}

/// `{"ok":false,"error":..}` is a fault, `{"ok":true,"result":..}` a
/// success, anything else the raw result.
fn decode_reply(reply: &[u8]) -> Result<Value, String> {
    if reply.is_empty() {
        return Ok(Value::Null);
    }
    let value: Value =
        serde_json::from_slice(reply).map_err(|e| format!("Reply is not valid JSON: {}", e))?;
    match value.get("ok").and_then(Value::as_bool) {
        Some(false) => Err(value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("Plugin reported an error")
            .to_string()),
        Some(true) => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
        None => Ok(value),
    }
}

struct WasmFunction {
    plugin: Arc<WasmPlugin>,
    function: String,
    bus: Arc<EventBus>,
}

#[async_trait]
impl PluginFunction for WasmFunction {
    async fn invoke(&self, ctx: CallContext, args: Vec<Value>) -> HandlerResult {
        let input = serde_json::to_vec(&args)?;
        let plugin = Arc::clone(&self.plugin);
        let function = self.function.clone();
        tracing::debug!(
            "WASM call {}.{} ({})",
            plugin.id(),
            function,
            ctx.correlation_id
        );

        let output = tokio::task::spawn_blocking(move || plugin.invoke_blocking(&function, &input))
            .await
            .map_err(|e| HandlerError::new(format!("Plugin task failed: {}", e)))?
            .map_err(HandlerError::from)?;

        for (event_name, payload) in &output.emitted {
            self.bus.emit(event_name, payload).await;
        }
        Ok(output.result)
    }
}

struct WasmInitHook {
    plugin: Arc<WasmPlugin>,
}

#[async_trait]
impl InitHook for WasmInitHook {
    async fn init(&self, plugin_id: &str) -> CoreResult<()> {
        let plugin = Arc::clone(&self.plugin);
        tokio::task::spawn_blocking(move || plugin.init_blocking())
            .await
            .map_err(|e| CoreError::Internal(format!("Init task failed: {}", e)))?
            .map_err(|e| CoreError::PluginLoadFailed(format!("{} init failed: {}", plugin_id, e)))
    }
}

// ============================================================================
// Tests
// ============================================================================
