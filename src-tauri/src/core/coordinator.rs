//! Coordinator
//!
//! Owns every registry of a running host: plugin registry, call router,
//! event bus, config store, bridge table and template orchestrator. Nothing
//! here is a process-wide singleton; the desktop shell and the CLI each hold
//! one `Coordinator`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use specta::Type;

use crate::core::bridge::{Bridge, BridgeTable, WindowControl};
use crate::core::bus::{validate_event_name, EventBus, EventSink, ListenerHandle};
use crate::core::market::{market_plugin, CatalogService};
use crate::core::plugin::{WasmPluginHost, WasmRuntimeConfig};
use crate::core::registry::{PluginRegistration, PluginRegistry, PluginSummary};
use crate::core::router::{CallResponse, CallRouter};
use crate::core::settings::{HostSettings, TemplateSettings};
use crate::core::store::{ConfigStore, MemoryConfigStore};
use crate::core::surface::{HeadlessSurfaceHost, SurfaceHost};
use crate::core::template::{template_plugin, TemplateDefaults, TemplateOrchestrator, WindowMode};
use crate::core::{CallerRef, CoreError, CoreResult, PluginId};

impl From<&TemplateSettings> for TemplateDefaults {
    fn from(settings: &TemplateSettings) -> Self {
        Self {
            shell_url: settings.shell_url.clone(),
            floating_percent: settings.default_floating_percent,
            window_mode: WindowMode::parse(&settings.default_window_mode).unwrap_or_default(),
        }
    }
}

/// Outcome of loading a plugin directory tree.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct PluginLoadReport {
    pub loaded: Vec<PluginId>,
    pub failed: Vec<PluginLoadFailure>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct PluginLoadFailure {
    pub path: String,
    pub error: String,
}

pub struct Coordinator {
    registry: Arc<PluginRegistry>,
    router: Arc<CallRouter>,
    bus: Arc<EventBus>,
    config: Arc<dyn ConfigStore>,
    host: Arc<dyn SurfaceHost>,
    bridges: Arc<BridgeTable>,
    templates: Arc<TemplateOrchestrator>,
    wasm: WasmPluginHost,
}

impl Coordinator {
    /// Builds the registries and registers the `window-template` builtin.
    pub fn new(
        host: Arc<dyn SurfaceHost>,
        config: Arc<dyn ConfigStore>,
        settings: &HostSettings,
    ) -> CoreResult<Self> {
        let registry = Arc::new(PluginRegistry::new());
        let router = Arc::new(CallRouter::new(Arc::clone(&registry)));
        let bus = Arc::new(EventBus::new());
        let bridges = Arc::new(BridgeTable::new(
            Arc::clone(&router),
            Arc::clone(&bus),
            Arc::clone(&config),
            Arc::clone(&host),
        ));
        let templates = Arc::new(TemplateOrchestrator::new(
            Arc::clone(&host),
            Arc::clone(&bridges),
            Arc::clone(&bus),
            TemplateDefaults::from(&settings.templates),
        ));
        registry.register(template_plugin(Arc::clone(&templates))?)?;

        let wasm = WasmPluginHost::new(WasmRuntimeConfig::from(&settings.plugins))?;

        Ok(Self {
            registry,
            router,
            bus,
            config,
            host,
            bridges,
            templates,
            wasm,
        })
    }

    /// In-memory coordinator over the headless surface host.
    pub fn headless(settings: &HostSettings) -> CoreResult<(Self, Arc<HeadlessSurfaceHost>)> {
        let host = Arc::new(HeadlessSurfaceHost::new());
        let coordinator = Self::new(host.clone(), Arc::new(MemoryConfigStore::new()), settings)?;
        Ok((coordinator, host))
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<CallRouter> {
        &self.router
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn config(&self) -> &Arc<dyn ConfigStore> {
        &self.config
    }

    pub fn surface_host(&self) -> &Arc<dyn SurfaceHost> {
        &self.host
    }

    pub fn bridges(&self) -> &Arc<BridgeTable> {
        &self.bridges
    }

    pub fn templates(&self) -> &Arc<TemplateOrchestrator> {
        &self.templates
    }

    // =========================================================================
    // Plugin Lifecycle
    // =========================================================================

    /// Registers a plugin and runs its init hook. A failing hook leaves the
    /// plugin unregistered.
    pub async fn load_plugin(&self, registration: PluginRegistration) -> CoreResult<()> {
        let plugin_id = registration.plugin_id.clone();
        let init_hook = registration.init_hook.clone();
        self.registry.register(registration)?;

        if let Some(hook) = init_hook {
            if let Err(err) = hook.init(&plugin_id).await {
                tracing::warn!("Init hook of {} failed: {}", plugin_id, err);
                let _ = self.registry.unregister(&plugin_id);
                return Err(match err {
                    failed @ CoreError::PluginLoadFailed(_) => failed,
                    other => CoreError::PluginLoadFailed(format!("{plugin_id}: {other}")),
                });
            }
        }

        tracing::info!("Plugin loaded: {}", plugin_id);
        Ok(())
    }

    pub fn unload_plugin(&self, plugin_id: &str) -> CoreResult<()> {
        self.registry.unregister(plugin_id)?;
        tracing::info!("Plugin unloaded: {}", plugin_id);
        Ok(())
    }

    /// Registers the `market` builtin over a catalog service.
    pub async fn register_catalog(&self, service: Arc<dyn CatalogService>) -> CoreResult<()> {
        self.load_plugin(market_plugin(service)?).await
    }

    /// Loads every WASM plugin found under `root`. One broken plugin does
    /// not stop the others.
    pub async fn load_wasm_plugins(&self, root: &Path) -> PluginLoadReport {
        let mut report = PluginLoadReport::default();
        for dir in WasmPluginHost::discover(root) {
            match self.load_wasm_plugin(&dir).await {
                Ok(plugin_id) => report.loaded.push(plugin_id),
                Err(err) => {
                    tracing::warn!("Skipping plugin at {}: {}", dir.display(), err);
                    report.failed.push(PluginLoadFailure {
                        path: dir.display().to_string(),
                        error: err.to_string(),
                    });
                }
            }
        }
        report
    }

    pub async fn load_wasm_plugin(&self, dir: &Path) -> CoreResult<PluginId> {
        let plugin = self.wasm.load(dir)?;
        let registration = plugin.registration(Arc::clone(&self.bus))?;
        self.load_plugin(registration).await?;
        Ok(plugin.id().to_string())
    }

    pub fn describe_plugins(&self) -> Vec<PluginSummary> {
        self.registry.describe()
    }

    // =========================================================================
    // Calls, Events and Surfaces
    // =========================================================================

    pub async fn call(
        &self,
        caller: CallerRef,
        target: &str,
        function: &str,
        args: Vec<Value>,
    ) -> CallResponse {
        self.router.call(caller, target, function, args).await
    }

    /// Emits on the bus. Returns how many subscribers were targeted.
    pub async fn emit(&self, event_name: &str, payload: &Value) -> CoreResult<usize> {
        validate_event_name(event_name)?;
        Ok(self.bus.emit(event_name, payload).await)
    }

    /// Attaches a bridge to a surface the host created outside the
    /// orchestrator. Window control goes through the orchestrator, which
    /// falls back to plain behavior for non-template surfaces.
    pub fn attach_surface(&self, surface_id: &str, owner: Option<PluginId>) -> Arc<Bridge> {
        let windows: Arc<dyn WindowControl> = self.templates.clone();
        self.bridges.attach(surface_id, owner, &windows)
    }

    pub fn detach_surface(&self, surface_id: &str) -> bool {
        self.bridges.detach(surface_id).is_some()
    }

    /// Call and event handle for a native plugin backend.
    pub fn backend(&self, plugin_id: impl Into<PluginId>) -> BackendContext {
        BackendContext {
            plugin_id: plugin_id.into(),
            router: Arc::clone(&self.router),
            bus: Arc::clone(&self.bus),
            templates: Arc::clone(&self.templates),
        }
    }
}

/// Calls and events issued on behalf of one plugin backend.
#[derive(Clone)]
pub struct BackendContext {
    plugin_id: PluginId,
    router: Arc<CallRouter>,
    bus: Arc<EventBus>,
    templates: Arc<TemplateOrchestrator>,
}

impl BackendContext {
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub async fn call(&self, target: &str, function: &str, args: Vec<Value>) -> CoreResult<Value> {
        self.router
            .call_value(CallerRef::plugin(self.plugin_id.clone()), target, function, args)
            .await
    }

    pub async fn emit(&self, event_name: &str, payload: &Value) -> CoreResult<usize> {
        validate_event_name(event_name)?;
        Ok(self.bus.emit(event_name, payload).await)
    }

    /// Registers `sink` and subscribes it to `channels`.
    pub fn listen(&self, sink: Arc<dyn EventSink>, channels: &[&str]) -> CoreResult<ListenerHandle> {
        let handle = self.bus.register_listener(sink);
        for channel in channels {
            if let Err(err) = self.bus.subscribe(channel, &handle) {
                self.bus.remove_listener(handle.id());
                return Err(err);
            }
        }
        Ok(handle)
    }

    /// Pushes `{type:'update', target, value}` into a template window.
    pub async fn update_template(&self, key: &str, target: &str, value: Value) -> CoreResult<usize> {
        self.templates.push_update(key, target, value).await
    }
}

/// Default plugin directory: `{app_data_dir}/plugins`, unless settings
/// name one.
pub fn plugin_directory(app_data_dir: &Path, settings: &HostSettings) -> PathBuf {
    settings
        .plugins
        .directory
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| app_data_dir.join("plugins"))
}
