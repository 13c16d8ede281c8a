//! IPC DTO helpers
//!
//! This module is compiled in unit tests (unlike the Tauri command entry points).
//! Keep it free of `tauri` dependencies so we can validate serialization and
//! cross-layer type stability with normal `cargo test`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use specta::Type;

use crate::core::coordinator::PluginLoadReport;
use crate::core::registry::PluginSummary;
use crate::core::settings::HostSettings;
use crate::core::template::TemplateWindowRecord;

/// Host overview shown by the plugin manager panel.
#[derive(Clone, Debug, Serialize, Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct HostOverviewDto {
    pub plugins: Vec<PluginSummary>,
    pub templates: Vec<TemplateWindowRecord>,
    pub surfaces: Vec<String>,
    pub pending_calls: usize,
}

/// Result of a plugin directory (re)scan.
#[derive(Clone, Debug, Serialize, Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct PluginScanDto {
    pub directory: String,
    pub report: PluginLoadReport,
}

/// Applies a partial JSON update to settings (deep merge).
pub fn apply_settings_patch(current: &HostSettings, patch: Value) -> Result<HostSettings, String> {
    let mut current_json = serde_json::to_value(current)
        .map_err(|e| format!("Failed to serialize current settings: {}", e))?;

    merge_json(&mut current_json, patch);

    serde_json::from_value(current_json)
        .map_err(|e| format!("Failed to apply settings update: {}", e))
}

/// Deep merge JSON objects (used for partial settings updates)
pub fn merge_json(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                let base_value = base_map.entry(key).or_insert(Value::Null);
                merge_json(base_value, patch_value);
            }
        }
        (base, patch) => {
            *base = patch;
        }
    }
}
