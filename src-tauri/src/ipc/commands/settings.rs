//! Settings Commands
//!
//! Host settings panel. Saved values take effect on the next start.

use crate::core::settings::{HostSettings, SettingsManager};
use crate::ipc::commands::helpers::{get_app_data_dir, ToIpcError};
use crate::ipc::dto::apply_settings_patch;

fn manager(app: &tauri::AppHandle) -> Result<SettingsManager, String> {
    Ok(SettingsManager::new(get_app_data_dir(app)?))
}

/// Gets host settings
#[tauri::command]
#[specta::specta]
pub async fn get_settings(app: tauri::AppHandle) -> Result<HostSettings, String> {
    Ok(manager(&app)?.load())
}

/// Replaces host settings. Returns the normalized copy that was stored.
#[tauri::command]
#[specta::specta]
pub async fn set_settings(
    app: tauri::AppHandle,
    settings: HostSettings,
) -> Result<HostSettings, String> {
    manager(&app)?
        .save(&settings)
        .map_err(ToIpcError::to_ipc_error)
}

/// Deep-merges `partial` into the stored settings.
#[tauri::command]
#[specta::specta]
pub async fn update_settings(
    app: tauri::AppHandle,
    partial: serde_json::Value,
) -> Result<HostSettings, String> {
    let manager = manager(&app)?;
    let updated = apply_settings_patch(&manager.load(), partial)?;
    manager.save(&updated).map_err(ToIpcError::to_ipc_error)
}

#[tauri::command]
#[specta::specta]
pub async fn reset_settings(app: tauri::AppHandle) -> Result<HostSettings, String> {
    manager(&app)?.reset().map_err(ToIpcError::to_ipc_error)
}
