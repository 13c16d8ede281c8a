//! PlugDock Core Type Definitions
//!
//! Defines identifier and caller types shared by every coordination module.
//! Wire types are exported to TypeScript via tauri-specta.

use serde::{Deserialize, Serialize};
use specta::Type;

// =============================================================================
// ID Types
// =============================================================================

/// Plugin identifier (manifest id, e.g. "com.example.clock")
pub type PluginId = String;

/// Name of a function in a plugin's function table
pub type FunctionName = String;

/// Call correlation identifier (ULID)
pub type CorrelationId = String;

/// Surface identifier ("surface-" + lowercase ULID)
pub type SurfaceId = String;

/// Event channel name
pub type EventName = String;

/// Creates a fresh correlation id.
pub fn new_correlation_id() -> CorrelationId {
    ulid::Ulid::new().to_string()
}

/// Creates a fresh surface id. Surface ids double as window labels, so they
/// stay lowercase alphanumeric plus '-'.
pub fn new_surface_id() -> SurfaceId {
    format!("surface-{}", ulid::Ulid::new().to_string().to_lowercase())
}

// =============================================================================
// Caller
// =============================================================================

/// Identity of the party issuing a call or emitting an event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CallerRef {
    /// The host itself (CLI, IPC commands without a surface)
    Host,
    /// A plugin's backend context
    #[serde(rename_all = "camelCase")]
    Plugin { plugin_id: PluginId },
    /// A UI surface, optionally owned by a plugin
    #[serde(rename_all = "camelCase")]
    Surface {
        surface_id: SurfaceId,
        plugin_id: Option<PluginId>,
    },
}

impl CallerRef {
    pub fn plugin(id: impl Into<PluginId>) -> Self {
        CallerRef::Plugin {
            plugin_id: id.into(),
        }
    }

    /// Plugin the caller acts on behalf of, if any.
    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            CallerRef::Host => None,
            CallerRef::Plugin { plugin_id } => Some(plugin_id),
            CallerRef::Surface { plugin_id, .. } => plugin_id.as_deref(),
        }
    }

    pub fn surface_id(&self) -> Option<&str> {
        match self {
            CallerRef::Surface { surface_id, .. } => Some(surface_id),
            _ => None,
        }
    }
}

impl std::fmt::Display for CallerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallerRef::Host => f.write_str("host"),
            CallerRef::Plugin { plugin_id } => write!(f, "plugin:{plugin_id}"),
            CallerRef::Surface { surface_id, .. } => write!(f, "surface:{surface_id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surface_ids_are_unique_and_label_safe() {
        let a = new_surface_id();
        let b = new_surface_id();
        assert_ne!(a, b);
        assert!(a.starts_with("surface-"));
        assert!(a
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn test_caller_ref_wire_shape() {
        let caller = CallerRef::Surface {
            surface_id: "surface-1".into(),
            plugin_id: Some("clock".into()),
        };
        let json = serde_json::to_value(&caller).unwrap();
        assert_eq!(json["kind"], "surface");
        assert_eq!(json["surfaceId"], "surface-1");
        assert_eq!(json["pluginId"], "clock");
        assert_eq!(caller.plugin_id(), Some("clock"));

        let host: CallerRef = serde_json::from_str(r#"{"kind":"host"}"#).unwrap();
        assert_eq!(host, CallerRef::Host);
        assert_eq!(host.plugin_id(), None);
    }
}
