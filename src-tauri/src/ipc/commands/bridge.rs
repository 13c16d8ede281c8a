//! Bridge Commands
//!
//! Entry point for every bridge operation a surface performs. The calling
//! webview's label is its surface id, so a surface can only act as itself.

use serde_json::Value;
use tauri::State;

use crate::core::bridge::{BridgeReply, BridgeRequest};
use crate::core::surface::WindowAction;
use crate::core::{new_correlation_id, CorrelationId, EventName};
use crate::ipc::commands::helpers::{coordinator, ToIpcError};
use crate::AppState;

/// Executes a bridge request on behalf of the calling surface.
///
/// Surfaces the orchestrator did not create (the main window, for instance)
/// get an unowned bridge on first use.
#[tauri::command]
#[specta::specta]
pub async fn bridge_request(
    window: tauri::WebviewWindow,
    state: State<'_, AppState>,
    request: BridgeRequest,
) -> Result<BridgeReply, String> {
    let coordinator = coordinator(&state)?;
    let bridge = coordinator.attach_surface(window.label(), None);
    Ok(bridge.dispatch(request).await)
}

/// Channels the calling surface is subscribed to.
#[tauri::command]
#[specta::specta]
pub async fn bridge_subscriptions(
    window: tauri::WebviewWindow,
    state: State<'_, AppState>,
) -> Result<Vec<EventName>, String> {
    let coordinator = coordinator(&state)?;
    Ok(coordinator
        .bridges()
        .get(window.label())
        .map(|bridge| bridge.subscriptions())
        .unwrap_or_default())
}

/// Routes a call as the calling surface.
#[tauri::command]
#[specta::specta]
pub async fn bridge_call(
    window: tauri::WebviewWindow,
    state: State<'_, AppState>,
    target: String,
    function: String,
    args: Vec<Value>,
    correlation_id: Option<CorrelationId>,
) -> Result<BridgeReply, String> {
    let coordinator = coordinator(&state)?;
    let bridge = coordinator.attach_surface(window.label(), None);
    let correlation_id = correlation_id.unwrap_or_else(new_correlation_id);
    Ok(bridge
        .call_with_id(correlation_id, &target, &function, args)
        .await
        .into())
}

/// Emits on the bus. Returns how many subscribers were targeted.
#[tauri::command]
#[specta::specta]
pub async fn bridge_emit(
    window: tauri::WebviewWindow,
    state: State<'_, AppState>,
    event: EventName,
    payload: Value,
) -> Result<usize, String> {
    let coordinator = coordinator(&state)?;
    let bridge = coordinator.attach_surface(window.label(), None);
    bridge.emit(&event, &payload).await.map_err(ToIpcError::to_ipc_error)
}

#[tauri::command]
#[specta::specta]
pub async fn bridge_subscribe(
    window: tauri::WebviewWindow,
    state: State<'_, AppState>,
    event: EventName,
) -> Result<(), String> {
    let coordinator = coordinator(&state)?;
    let bridge = coordinator.attach_surface(window.label(), None);
    bridge.subscribe(&event).map_err(ToIpcError::to_ipc_error)
}

#[tauri::command]
#[specta::specta]
pub async fn bridge_unsubscribe(
    window: tauri::WebviewWindow,
    state: State<'_, AppState>,
    event: EventName,
) -> Result<bool, String> {
    let coordinator = coordinator(&state)?;
    Ok(coordinator
        .bridges()
        .get(window.label())
        .map(|bridge| bridge.unsubscribe(&event))
        .unwrap_or(false))
}

#[tauri::command]
#[specta::specta]
pub async fn window_control(
    window: tauri::WebviewWindow,
    state: State<'_, AppState>,
    action: WindowAction,
) -> Result<(), String> {
    let coordinator = coordinator(&state)?;
    let bridge = coordinator.attach_surface(window.label(), None);
    bridge
        .window_control(action)
        .await
        .map_err(ToIpcError::to_ipc_error)
}

/// Reads a key from the owning plugin's config scope.
#[tauri::command]
#[specta::specta]
pub async fn config_get(
    window: tauri::WebviewWindow,
    state: State<'_, AppState>,
    key: String,
) -> Result<Option<Value>, String> {
    let coordinator = coordinator(&state)?;
    let bridge = coordinator.attach_surface(window.label(), None);
    bridge.config_get(&key).map_err(ToIpcError::to_ipc_error)
}

#[tauri::command]
#[specta::specta]
pub async fn config_set(
    window: tauri::WebviewWindow,
    state: State<'_, AppState>,
    key: String,
    value: Value,
) -> Result<(), String> {
    let coordinator = coordinator(&state)?;
    let bridge = coordinator.attach_surface(window.label(), None);
    bridge.config_set(&key, value).map_err(ToIpcError::to_ipc_error)
}
