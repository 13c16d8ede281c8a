//! Surface Event Names
//!
//! Webview events the host emits into plugin surfaces. Shells listen for
//! these with `@tauri-apps/api/event`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use specta::Type;

use crate::core::EventName;

/// Event names used for surface communication
pub mod event_names {
    /// Template initialization message
    pub const TEMPLATE_INIT: &str = "template:init";
    /// Bus event delivered to a subscribed surface
    pub const BRIDGE_EVENT: &str = "bridge:event";
    /// Plugin set changed (load/unload)
    pub const PLUGINS_CHANGED: &str = "plugins:changed";
}

/// Payload of [`event_names::BRIDGE_EVENT`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct BridgeEventPayload {
    pub event: EventName,
    pub payload: Value,
}

impl BridgeEventPayload {
    pub fn new(event: &str, payload: &Value) -> Self {
        Self {
            event: event.to_string(),
            payload: payload.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bridge_event_payload_wire_shape() {
        let payload = BridgeEventPayload::new("clock", &json!({"type": "update"}));
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({"event": "clock", "payload": {"type": "update"}})
        );
    }
}
