//! PlugDock Core Library
//!
//! Desktop plugin host: isolated plugins call each other through a router,
//! talk over an event bus and open shared template windows.
//! This library contains the coordination layer, the WASM plugin runtime
//! and, behind the `gui` feature, the Tauri shell.
//!
//! ## TypeScript Bindings
//!
//! All IPC types are exported to TypeScript via tauri-specta.
//! Run the `export_bindings` binary to regenerate `src/bindings.ts`.

pub mod core;
pub mod ipc;

use std::path::Path;
use std::sync::OnceLock;

use crate::core::settings::LoggingSettings;

// =============================================================================
// Logging
// =============================================================================

static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Level from settings; unknown values fall back to INFO.
fn log_level(level: &str) -> tracing::Level {
    level.trim().parse().unwrap_or(tracing::Level::INFO)
}

/// Installs the global subscriber: stdout, plus a daily rolling file under
/// `log_dir` when file output is enabled. `RUST_LOG` overrides the level.
pub fn init_logging(log_dir: Option<&Path>, settings: &LoggingSettings) {
    use tracing_subscriber::prelude::*;

    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(log_level(&settings.level).into())
        .from_env_lossy();

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(cfg!(debug_assertions));

    let file_layer = match log_dir.filter(|_| settings.file_output) {
        Some(dir) => {
            let _ = std::fs::create_dir_all(dir);
            let file_appender = tracing_appender::rolling::daily(dir, "plugdock.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = LOG_GUARD.set(guard);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false),
            )
        }
        None => None,
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer);

    // Avoid panics if already initialized (tests, repeated setup).
    let _ = tracing::subscriber::set_global_default(subscriber);
}

// =============================================================================
// Application State
// =============================================================================

/// Application state shared across all commands.
///
/// The coordinator needs the app handle for its surface host, so it is
/// installed during setup rather than at construction.
#[cfg(feature = "gui")]
pub struct AppState {
    coordinator: OnceLock<std::sync::Arc<crate::core::coordinator::Coordinator>>,
}

#[cfg(feature = "gui")]
impl AppState {
    pub fn new() -> Self {
        Self {
            coordinator: OnceLock::new(),
        }
    }

    /// Installs the coordinator (first call wins).
    pub fn install(&self, coordinator: std::sync::Arc<crate::core::coordinator::Coordinator>) {
        let _ = self.coordinator.set(coordinator);
    }

    pub fn coordinator(&self) -> Option<std::sync::Arc<crate::core::coordinator::Coordinator>> {
        self.coordinator.get().cloned()
    }
}

#[cfg(feature = "gui")]
impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tauri Application Entry Point
// =============================================================================
#[cfg(feature = "gui")]
mod tauri_app {
    use super::*;
    use std::sync::Arc;
    use tauri::Manager;

    use crate::core::coordinator::{plugin_directory, Coordinator};
    use crate::core::settings::{default_data_dir, SettingsManager};
    use crate::core::store::{ConfigStore, JsonConfigStore, MemoryConfigStore};
    use crate::core::surface::SurfaceHost;
    use crate::ipc::surface::TauriSurfaceHost;

    /// Collects all commands for tauri-specta type export.
    /// This is used by the bindings generator.
    #[macro_export]
    macro_rules! collect_commands {
        () => {
            tauri_specta::collect_commands![
                // Bridge
                $crate::ipc::bridge_request,
                $crate::ipc::bridge_call,
                $crate::ipc::bridge_emit,
                $crate::ipc::bridge_subscribe,
                $crate::ipc::bridge_unsubscribe,
                $crate::ipc::bridge_subscriptions,
                $crate::ipc::window_control,
                $crate::ipc::config_get,
                $crate::ipc::config_set,
                // Plugins
                $crate::ipc::list_plugins,
                $crate::ipc::get_host_overview,
                $crate::ipc::scan_plugins,
                $crate::ipc::unload_plugin,
                // Template windows
                $crate::ipc::open_template,
                $crate::ipc::close_template,
                $crate::ipc::list_templates,
                // Settings
                $crate::ipc::get_settings,
                $crate::ipc::set_settings,
                $crate::ipc::update_settings,
                $crate::ipc::reset_settings,
            ]
        };
    }

    fn open_config_store(app_data_dir: &Path) -> Arc<dyn ConfigStore> {
        match JsonConfigStore::open(&app_data_dir.join("config")) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::warn!("Plugin config store unavailable ({}). Using memory store.", e);
                Arc::new(MemoryConfigStore::new())
            }
        }
    }

    /// Initialize and run the Tauri application
    #[cfg_attr(mobile, tauri::mobile_entry_point)]
    pub fn run() {
        tauri::Builder::default()
            .manage(AppState::new())
            .plugin(tauri_plugin_dialog::init())
            .setup(|app| {
                let app_data_dir = app
                    .path()
                    .app_data_dir()
                    .unwrap_or_else(|_| default_data_dir());
                let settings = SettingsManager::new(app_data_dir.clone()).load();

                let log_dir = app.path().app_log_dir().ok();
                init_logging(log_dir.as_deref(), &settings.logging);
                tracing::info!("PlugDock starting...");

                let host: Arc<dyn SurfaceHost> =
                    Arc::new(TauriSurfaceHost::new(app.handle().clone()));
                let config = open_config_store(&app_data_dir);
                let coordinator = Arc::new(Coordinator::new(host, config, &settings)?);

                let app_state: tauri::State<'_, AppState> = app.state();
                app_state.install(Arc::clone(&coordinator));

                #[cfg(feature = "market")]
                {
                    let client = crate::core::market::HttpCatalogClient::new(&settings.market)?;
                    let coordinator = Arc::clone(&coordinator);
                    tauri::async_runtime::spawn(async move {
                        if let Err(e) = coordinator.register_catalog(Arc::new(client)).await {
                            tracing::warn!("Market catalog unavailable: {}", e);
                        }
                    });
                }

                if settings.plugins.autoload {
                    let directory = plugin_directory(&app_data_dir, &settings);
                    tauri::async_runtime::spawn(async move {
                        let report = coordinator.load_wasm_plugins(&directory).await;
                        tracing::info!(
                            "Loaded {} plugin(s) from {} ({} failed)",
                            report.loaded.len(),
                            directory.display(),
                            report.failed.len()
                        );
                    });
                }

                Ok(())
            })
            .invoke_handler(tauri::generate_handler![
                // Bridge
                ipc::bridge_request,
                ipc::bridge_call,
                ipc::bridge_emit,
                ipc::bridge_subscribe,
                ipc::bridge_unsubscribe,
                ipc::bridge_subscriptions,
                ipc::window_control,
                ipc::config_get,
                ipc::config_set,
                // Plugins
                ipc::list_plugins,
                ipc::get_host_overview,
                ipc::scan_plugins,
                ipc::unload_plugin,
                // Template windows
                ipc::open_template,
                ipc::close_template,
                ipc::list_templates,
                // Settings
                ipc::get_settings,
                ipc::set_settings,
                ipc::update_settings,
                ipc::reset_settings,
            ])
            .run(tauri::generate_context!())
            .expect("error while running tauri application");
    }
}

#[cfg(feature = "gui")]
pub use tauri_app::run;

// =============================================================================
// Tests
// =============================================================================
