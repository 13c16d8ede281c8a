//! Plugin Commands
//!
//! Plugin manager panel: overview, directory scans and unloading.

use tauri::{Emitter, State};

use crate::core::coordinator::plugin_directory;
use crate::core::market::MARKET_PLUGIN_ID;
use crate::core::registry::PluginSummary;
use crate::core::settings::SettingsManager;
use crate::core::template::TEMPLATE_PLUGIN_ID;
use crate::ipc::commands::helpers::{coordinator, errors, get_app_data_dir, ToIpcError};
use crate::ipc::dto::{HostOverviewDto, PluginScanDto};
use crate::ipc::events::event_names;
use crate::AppState;

/// Registered plugins, live template windows and attached surfaces.
#[tauri::command]
#[specta::specta]
pub async fn get_host_overview(state: State<'_, AppState>) -> Result<HostOverviewDto, String> {
    let coordinator = coordinator(&state)?;
    Ok(HostOverviewDto {
        plugins: coordinator.describe_plugins(),
        templates: coordinator.templates().records(),
        surfaces: coordinator.bridges().surfaces(),
        pending_calls: coordinator.router().pending_count(),
    })
}

#[tauri::command]
#[specta::specta]
pub async fn list_plugins(state: State<'_, AppState>) -> Result<Vec<PluginSummary>, String> {
    Ok(coordinator(&state)?.describe_plugins())
}

/// Scans the plugin directory and loads plugins not yet registered.
#[tauri::command]
#[specta::specta]
pub async fn scan_plugins(
    app: tauri::AppHandle,
    state: State<'_, AppState>,
) -> Result<PluginScanDto, String> {
    let coordinator = coordinator(&state)?;
    let app_data_dir = get_app_data_dir(&app)?;
    let settings = SettingsManager::new(app_data_dir.clone()).load();
    let directory = plugin_directory(&app_data_dir, &settings);

    let report = coordinator.load_wasm_plugins(&directory).await;
    if !report.loaded.is_empty() {
        let _ = app.emit(event_names::PLUGINS_CHANGED, &report.loaded);
    }

    Ok(PluginScanDto {
        directory: directory.display().to_string(),
        report,
    })
}

#[tauri::command]
#[specta::specta]
pub async fn unload_plugin(
    app: tauri::AppHandle,
    state: State<'_, AppState>,
    plugin_id: String,
) -> Result<(), String> {
    if plugin_id == TEMPLATE_PLUGIN_ID || plugin_id == MARKET_PLUGIN_ID {
        return Err(errors::BUILTIN_PLUGIN.to_string());
    }
    let coordinator = coordinator(&state)?;
    coordinator
        .unload_plugin(&plugin_id)
        .map_err(ToIpcError::to_ipc_error)?;
    let _ = app.emit(event_names::PLUGINS_CHANGED, vec![plugin_id]);
    Ok(())
}
