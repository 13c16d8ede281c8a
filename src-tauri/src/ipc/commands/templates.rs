//! Template Window Commands

use tauri::State;

use crate::core::template::{OpenedTemplate, TemplateDescriptor, TemplateWindowRecord};
use crate::ipc::commands::helpers::{coordinator, ToIpcError};
use crate::AppState;

/// Opens (or reuses) a template window from the host UI.
#[tauri::command]
#[specta::specta]
pub async fn open_template(
    state: State<'_, AppState>,
    descriptor: TemplateDescriptor,
) -> Result<OpenedTemplate, String> {
    let coordinator = coordinator(&state)?;
    coordinator
        .templates()
        .open(descriptor)
        .await
        .map_err(ToIpcError::to_ipc_error)
}

#[tauri::command]
#[specta::specta]
pub async fn close_template(state: State<'_, AppState>, key: String) -> Result<(), String> {
    let coordinator = coordinator(&state)?;
    coordinator
        .templates()
        .close(&key)
        .await
        .map_err(ToIpcError::to_ipc_error)
}

#[tauri::command]
#[specta::specta]
pub async fn list_templates(
    state: State<'_, AppState>,
) -> Result<Vec<TemplateWindowRecord>, String> {
    Ok(coordinator(&state)?.templates().records())
}
