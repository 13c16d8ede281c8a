//! Bridge Contract
//!
//! The only channel a surface has into the host. Each surface gets one
//! `Bridge` exposing call, emit, subscribe, unsubscribe, event delivery,
//! window control and config access scoped to the owning plugin. The bridge
//! forwards; it holds no business logic.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use specta::Type;

use crate::core::bus::{validate_event_name, EventBus, EventSink, ListenerHandle};
use crate::core::router::{CallOutcome, CallResponse, CallRouter};
use crate::core::store::ConfigStore;
use crate::core::surface::{SurfaceHost, WindowAction};
use crate::core::{
    new_correlation_id, CallerRef, CoreError, CoreResult, CorrelationId, EventName,
    FunctionName, PluginId, SurfaceId,
};

/// Local handler invoked for every event delivered to a bridge.
pub type EventHandler = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Applies window-control actions to a surface.
#[async_trait]
pub trait WindowControl: Send + Sync {
    async fn window_control(&self, surface_id: &str, action: WindowAction) -> CoreResult<()>;
}

// =============================================================================
// Wire Types
// =============================================================================

/// Serializable bridge request, as sent by a surface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Type)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum BridgeRequest {
    #[serde(rename_all = "camelCase")]
    Call {
        #[serde(default)]
        correlation_id: Option<CorrelationId>,
        target: PluginId,
        #[serde(rename = "fn")]
        function: FunctionName,
        #[serde(default)]
        args: Vec<Value>,
    },
    Emit {
        event: EventName,
        #[serde(default)]
        payload: Value,
    },
    Subscribe {
        event: EventName,
    },
    Unsubscribe {
        event: EventName,
    },
    WindowControl {
        action: WindowAction,
    },
    ConfigGet {
        key: String,
    },
    ConfigSet {
        key: String,
        value: Value,
    },
}

/// Reply to a [`BridgeRequest`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct BridgeReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    #[serde(flatten)]
    pub outcome: CallOutcome,
}

impl BridgeReply {
    fn from_result(result: CoreResult<Value>) -> Self {
        Self {
            correlation_id: None,
            outcome: CallOutcome::from_result(result),
        }
    }
}

impl From<CallResponse> for BridgeReply {
    fn from(response: CallResponse) -> Self {
        Self {
            correlation_id: Some(response.correlation_id),
            outcome: response.outcome,
        }
    }
}

// =============================================================================
// Event Delivery
// =============================================================================

/// Bus listener of a surface: forwards events to the surface host and to
/// local handlers.
pub struct BridgeSink {
    surface_id: SurfaceId,
    host: Arc<dyn SurfaceHost>,
    handlers: RwLock<Vec<EventHandler>>,
}

#[async_trait]
impl EventSink for BridgeSink {
    async fn deliver(&self, event_name: &str, payload: &Value) -> Result<(), String> {
        self.host
            .post_event(&self.surface_id, event_name, payload)
            .await
            .map_err(|e| e.to_string())?;

        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler(event_name, payload);
        }
        Ok(())
    }
}

// =============================================================================
// Bridge
// =============================================================================

pub struct Bridge {
    surface_id: SurfaceId,
    /// Set at attach, or later by the orchestrator for a surface whose shell
    /// used the bridge before its template went live.
    owner: RwLock<Option<PluginId>>,
    router: Arc<CallRouter>,
    bus: Arc<EventBus>,
    config: Arc<dyn ConfigStore>,
    windows: Weak<dyn WindowControl>,
    sink: Arc<BridgeSink>,
    listener: ListenerHandle,
}

impl Bridge {
    pub fn surface_id(&self) -> &str {
        &self.surface_id
    }

    pub fn owner(&self) -> Option<PluginId> {
        self.owner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Gives an unowned bridge its plugin. Returns false when the bridge is
    /// already owned by a different plugin.
    fn claim(&self, owner: PluginId) -> bool {
        let mut current = self.owner.write().unwrap_or_else(PoisonError::into_inner);
        match current.as_ref() {
            Some(existing) => *existing == owner,
            None => {
                *current = Some(owner);
                true
            }
        }
    }

    pub fn caller(&self) -> CallerRef {
        CallerRef::Surface {
            surface_id: self.surface_id.clone(),
            plugin_id: self.owner(),
        }
    }

    pub fn listener(&self) -> &ListenerHandle {
        &self.listener
    }

    pub async fn call(&self, target: &str, function: &str, args: Vec<Value>) -> CallResponse {
        self.router.call(self.caller(), target, function, args).await
    }

    pub async fn call_with_id(
        &self,
        correlation_id: CorrelationId,
        target: &str,
        function: &str,
        args: Vec<Value>,
    ) -> CallResponse {
        self.router
            .call_with_id(correlation_id, self.caller(), target, function, args)
            .await
    }

    /// Emits on the bus. Returns how many subscribers were targeted.
    pub async fn emit(&self, event_name: &str, payload: &Value) -> CoreResult<usize> {
        validate_event_name(event_name)?;
        Ok(self.bus.emit(event_name, payload).await)
    }

    pub fn subscribe(&self, event_name: &str) -> CoreResult<()> {
        self.bus.subscribe(event_name, &self.listener)
    }

    pub fn unsubscribe(&self, event_name: &str) -> bool {
        self.bus.unsubscribe(event_name, self.listener.id())
    }

    /// Channels this surface is subscribed to, sorted.
    pub fn subscriptions(&self) -> Vec<EventName> {
        self.bus
            .subscriptions_of(self.listener.id())
            .into_iter()
            .map(|s| s.event_name)
            .collect()
    }

    /// Registers a local handler for every delivered event.
    pub fn on_event(&self, handler: EventHandler) {
        self.sink
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub async fn window_control(&self, action: WindowAction) -> CoreResult<()> {
        let windows = self
            .windows
            .upgrade()
            .ok_or_else(|| CoreError::Internal("Window control is unavailable".to_string()))?;
        windows.window_control(&self.surface_id, action).await
    }

    fn config_scope(&self) -> CoreResult<PluginId> {
        self.owner().ok_or_else(|| {
            CoreError::InvalidOperation(format!(
                "Surface {} has no owning plugin for config access",
                self.surface_id
            ))
        })
    }

    pub fn config_get(&self, key: &str) -> CoreResult<Option<Value>> {
        self.config.get(&self.config_scope()?, key)
    }

    pub fn config_set(&self, key: &str, value: Value) -> CoreResult<()> {
        self.config.set(&self.config_scope()?, key, value)
    }

    /// Executes a serialized request.
    pub async fn dispatch(&self, request: BridgeRequest) -> BridgeReply {
        match request {
            BridgeRequest::Call {
                correlation_id,
                target,
                function,
                args,
            } => {
                let id = correlation_id.unwrap_or_else(new_correlation_id);
                self.call_with_id(id, &target, &function, args).await.into()
            }
            BridgeRequest::Emit { event, payload } => BridgeReply::from_result(
                self.emit(&event, &payload).await.map(Value::from),
            ),
            BridgeRequest::Subscribe { event } => {
                BridgeReply::from_result(self.subscribe(&event).map(|_| Value::Null))
            }
            BridgeRequest::Unsubscribe { event } => {
                BridgeReply::from_result(Ok(Value::Bool(self.unsubscribe(&event))))
            }
            BridgeRequest::WindowControl { action } => BridgeReply::from_result(
                self.window_control(action).await.map(|_| Value::Null),
            ),
            BridgeRequest::ConfigGet { key } => BridgeReply::from_result(
                self.config_get(&key).map(|v| v.unwrap_or(Value::Null)),
            ),
            BridgeRequest::ConfigSet { key, value } => {
                BridgeReply::from_result(self.config_set(&key, value).map(|_| Value::Null))
            }
        }
    }
}

// =============================================================================
// Bridge Table
// =============================================================================

/// Surface id → bridge. Detaching a surface drops its bus listener and with
/// it every subscription the surface held.
pub struct BridgeTable {
    router: Arc<CallRouter>,
    bus: Arc<EventBus>,
    config: Arc<dyn ConfigStore>,
    host: Arc<dyn SurfaceHost>,
    bridges: RwLock<HashMap<SurfaceId, Arc<Bridge>>>,
}

impl BridgeTable {
    pub fn new(
        router: Arc<CallRouter>,
        bus: Arc<EventBus>,
        config: Arc<dyn ConfigStore>,
        host: Arc<dyn SurfaceHost>,
    ) -> Self {
        Self {
            router,
            bus,
            config,
            host,
            bridges: RwLock::new(HashMap::new()),
        }
    }

    /// Creates the bridge of a surface. Attaching an already attached
    /// surface returns the existing bridge, after handing it `owner` if it
    /// had none.
    pub fn attach(
        &self,
        surface_id: &str,
        owner: Option<PluginId>,
        windows: &Arc<dyn WindowControl>,
    ) -> Arc<Bridge> {
        let mut bridges = self.bridges.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = bridges.get(surface_id) {
            if let Some(owner) = owner {
                if !existing.claim(owner.clone()) {
                    tracing::warn!(
                        "Bridge {} already owned, ignoring owner {}",
                        surface_id,
                        owner
                    );
                }
            }
            return Arc::clone(existing);
        }

        let sink = Arc::new(BridgeSink {
            surface_id: surface_id.to_string(),
            host: Arc::clone(&self.host),
            handlers: RwLock::new(Vec::new()),
        });
        let listener = self.bus.register_listener(sink.clone());
        let bridge = Arc::new(Bridge {
            surface_id: surface_id.to_string(),
            owner: RwLock::new(owner),
            router: Arc::clone(&self.router),
            bus: Arc::clone(&self.bus),
            config: Arc::clone(&self.config),
            windows: Arc::downgrade(windows),
            sink,
            listener,
        });
        bridges.insert(surface_id.to_string(), Arc::clone(&bridge));
        tracing::debug!("Attached bridge for {}", surface_id);
        bridge
    }

    pub fn get(&self, surface_id: &str) -> CoreResult<Arc<Bridge>> {
        self.bridges
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(surface_id)
            .cloned()
            .ok_or_else(|| CoreError::SurfaceNotFound(surface_id.to_string()))
    }

    pub fn detach(&self, surface_id: &str) -> Option<Arc<Bridge>> {
        let removed = self
            .bridges
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(surface_id)?;
        self.bus.remove_listener(removed.listener.id());
        tracing::debug!("Detached bridge for {}", surface_id);
        Some(removed)
    }

    pub fn surfaces(&self) -> Vec<SurfaceId> {
        let mut ids: Vec<SurfaceId> = self
            .bridges
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.bridges
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::{arg, FunctionTable, PluginRegistration, PluginRegistry};
    use crate::core::store::MemoryConfigStore;
    use crate::core::surface::{
        CloseCallback, FloatingPlacement, HeadlessSurfaceHost, SurfaceConstraints, SurfaceSpec,
    };
    use crate::core::ErrorCode;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records every action it receives.
    #[derive(Default)]
    struct RecordingControl {
        actions: Mutex<Vec<(SurfaceId, WindowAction)>>,
    }

    #[async_trait]
    impl WindowControl for RecordingControl {
        async fn window_control(&self, surface_id: &str, action: WindowAction) -> CoreResult<()> {
            self.actions
                .lock()
                .unwrap()
                .push((surface_id.to_string(), action));
            Ok(())
        }
    }

    struct Fixture {
        host: Arc<HeadlessSurfaceHost>,
        bus: Arc<EventBus>,
        table: BridgeTable,
        control: Arc<RecordingControl>,
        windows: Arc<dyn WindowControl>,
    }

    async fn fixture() -> Fixture {
        let registry = Arc::new(PluginRegistry::new());
        let table = FunctionTable::builder()
            .sync_function("echo", |_, args| Ok(args.first().cloned().unwrap_or(Value::Null)))
            .sync_function("caller", |ctx, _| Ok(serde_json::to_value(&ctx.caller)?))
            .sync_function("len", |_, args| {
                let s: String = arg(&args, 0, "s")?;
                Ok(json!(s.len()))
            })
            .build()
            .unwrap();
        registry
            .register(PluginRegistration::new("util", table).unwrap())
            .unwrap();

        let router = Arc::new(CallRouter::new(registry));
        let bus = Arc::new(EventBus::new());
        let host = Arc::new(HeadlessSurfaceHost::new());
        for id in ["s1", "s2"] {
            let cb: CloseCallback = Arc::new(|_: &SurfaceId| {});
            host.create_surface(
                SurfaceSpec {
                    surface_id: id.to_string(),
                    title: id.to_string(),
                    url: "shell".to_string(),
                    constraints: SurfaceConstraints::default(),
                    placement: FloatingPlacement::ScreenPercent { percent: 60 },
                },
                cb,
            )
            .await
            .unwrap();
        }

        let table = BridgeTable::new(
            router,
            Arc::clone(&bus),
            Arc::new(MemoryConfigStore::new()),
            host.clone(),
        );
        let control = Arc::new(RecordingControl::default());
        let windows: Arc<dyn WindowControl> = control.clone();
        Fixture {
            host,
            bus,
            table,
            control,
            windows,
        }
    }

    #[tokio::test]
    async fn test_call_carries_surface_identity() {
        let fx = fixture().await;
        let bridge = fx.table.attach("s1", Some("clock".into()), &fx.windows);

        let response = bridge.call("util", "caller", vec![]).await;
        let caller = response.outcome.result.unwrap();
        assert_eq!(caller["kind"], "surface");
        assert_eq!(caller["surfaceId"], "s1");
        assert_eq!(caller["pluginId"], "clock");
    }

    #[tokio::test]
    async fn test_dispatch_call_echoes_correlation_id() {
        let fx = fixture().await;
        let bridge = fx.table.attach("s1", None, &fx.windows);

        let request: BridgeRequest = serde_json::from_value(json!({
            "op": "call",
            "correlationId": "req-7",
            "target": "util",
            "fn": "len",
            "args": ["abcd"]
        }))
        .unwrap();
        let reply = bridge.dispatch(request).await;
        assert_eq!(reply.correlation_id.as_deref(), Some("req-7"));
        assert_eq!(reply.outcome.result, Some(json!(4)));

        let reply = bridge
            .dispatch(BridgeRequest::Call {
                correlation_id: None,
                target: "ghost".into(),
                function: "x".into(),
                args: vec![],
            })
            .await;
        assert!(reply.correlation_id.is_some());
        assert_eq!(reply.outcome.code, Some(ErrorCode::UnknownPlugin));
    }

    #[tokio::test]
    async fn test_events_reach_subscribed_surfaces_and_handlers() {
        let fx = fixture().await;
        let a = fx.table.attach("s1", None, &fx.windows);
        let b = fx.table.attach("s2", None, &fx.windows);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        a.on_event(Arc::new(move |name: &str, payload: &Value| {
            sink.lock().unwrap().push((name.to_string(), payload.clone()));
        }));

        a.subscribe("clock").unwrap();
        let targeted = b.emit("clock", &json!({"type": "update"})).await.unwrap();
        assert_eq!(targeted, 1);

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(fx.host.snapshot("s1").unwrap().events.len(), 1);
        assert!(fx.host.snapshot("s2").unwrap().events.is_empty());
        assert_eq!(a.subscriptions(), vec!["clock"]);
    }

    #[tokio::test]
    async fn test_emit_rejects_empty_event_name() {
        let fx = fixture().await;
        let bridge = fx.table.attach("s1", None, &fx.windows);
        let reply = bridge
            .dispatch(BridgeRequest::Emit {
                event: "".into(),
                payload: Value::Null,
            })
            .await;
        assert!(!reply.outcome.ok);
        assert_eq!(reply.outcome.code, Some(ErrorCode::InvalidRequest));
    }

    #[tokio::test]
    async fn test_detach_drops_subscriptions() {
        let fx = fixture().await;
        let bridge = fx.table.attach("s1", None, &fx.windows);
        bridge.subscribe("a").unwrap();
        bridge.subscribe("b").unwrap();

        assert!(fx.table.detach("s1").is_some());
        assert!(fx.bus.subscribers("a").is_empty());
        assert!(fx.bus.subscribers("b").is_empty());
        assert!(fx.table.get("s1").is_err());
        assert!(fx.table.detach("s1").is_none());
    }

    #[tokio::test]
    async fn test_config_is_scoped_to_owner() {
        let fx = fixture().await;
        let clock = fx.table.attach("s1", Some("clock".into()), &fx.windows);
        let weather = fx.table.attach("s2", Some("weather".into()), &fx.windows);

        clock.config_set("format", json!("24h")).unwrap();
        assert_eq!(clock.config_get("format").unwrap(), Some(json!("24h")));
        assert_eq!(weather.config_get("format").unwrap(), None);

        let reply = weather
            .dispatch(BridgeRequest::ConfigGet {
                key: "format".into(),
            })
            .await;
        assert_eq!(reply.outcome.result, Some(Value::Null));
    }

    #[tokio::test]
    async fn test_config_requires_owner() {
        let fx = fixture().await;
        let bridge = fx.table.attach("s1", None, &fx.windows);
        assert!(matches!(
            bridge.config_get("x"),
            Err(CoreError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_owned_attach_claims_unowned_bridge() {
        let fx = fixture().await;
        let early = fx.table.attach("s1", None, &fx.windows);
        assert_eq!(early.owner(), None);

        let owned = fx.table.attach("s1", Some("clock".into()), &fx.windows);
        assert!(Arc::ptr_eq(&early, &owned));
        assert_eq!(early.owner().as_deref(), Some("clock"));
        early.config_set("format", json!("24h")).unwrap();

        let other = fx.table.attach("s1", Some("weather".into()), &fx.windows);
        assert_eq!(other.owner().as_deref(), Some("clock"));
        assert_eq!(other.config_get("format").unwrap(), Some(json!("24h")));
    }

    #[tokio::test]
    async fn test_window_control_forwards() {
        let fx = fixture().await;
        let bridge = fx.table.attach("s1", None, &fx.windows);
        let request: BridgeRequest =
            serde_json::from_value(json!({"op": "windowControl", "action": "minimize"})).unwrap();
        let reply = bridge.dispatch(request).await;
        assert!(reply.outcome.ok);
        assert_eq!(
            *fx.control.actions.lock().unwrap(),
            vec![("s1".to_string(), WindowAction::Minimize)]
        );
    }

    #[tokio::test]
    async fn test_attach_is_idempotent() {
        let fx = fixture().await;
        let first = fx.table.attach("s1", None, &fx.windows);
        let second = fx.table.attach("s1", None, &fx.windows);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fx.table.len(), 1);
        assert_eq!(fx.bus.listener_count(), 1);
    }
}
