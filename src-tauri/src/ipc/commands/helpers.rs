//! IPC Command Helpers
//!
//! Shared utilities and error handling for Tauri IPC commands.

use std::sync::Arc;

use tauri::Manager;

use crate::core::coordinator::Coordinator;
use crate::core::CoreError;
use crate::AppState;

/// Converts a CoreError into an IPC-friendly error string.
pub trait ToIpcError {
    fn to_ipc_error(self) -> String;
}

impl ToIpcError for CoreError {
    fn to_ipc_error(self) -> String {
        format!("{}", self)
    }
}

/// Returns the coordinator, or an error while the host is still starting.
pub fn coordinator(state: &AppState) -> Result<Arc<Coordinator>, String> {
    state
        .coordinator()
        .ok_or_else(|| errors::HOST_NOT_READY.to_string())
}

/// Gets the application data directory path.
pub fn get_app_data_dir(app: &tauri::AppHandle) -> Result<std::path::PathBuf, String> {
    app.path()
        .app_data_dir()
        .map_err(|e| format!("Failed to get app data directory: {}", e))
}

/// Standard error messages for consistent user feedback.
pub mod errors {
    pub const HOST_NOT_READY: &str = "Plugin host is still starting";
    pub const BUILTIN_PLUGIN: &str = "Builtin plugins cannot be unloaded";
}
