//! Event Bus
//!
//! Named pub/sub channels that cross context boundaries. Emission is fire
//! and forget: subscribers are snapshotted at emission time and each one is
//! delivered to independently. A failing or panicking listener is logged and
//! reported on the diagnostic channel; the other listeners are unaffected.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use specta::Type;
use tokio::sync::{broadcast, mpsc};

use crate::core::{CoreError, CoreResult, EventName};

const DIAGNOSTIC_CAPACITY: usize = 256;

// =============================================================================
// Listener Types
// =============================================================================

/// Identifier of a registered listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Type)]
pub struct ListenerId(pub u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Proof of registration returned by [`EventBus::register_listener`].
#[derive(Clone, Debug)]
pub struct ListenerHandle {
    id: ListenerId,
}

impl ListenerHandle {
    pub fn id(&self) -> ListenerId {
        self.id
    }
}

/// Receives events for every channel its listener is subscribed to.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event_name: &str, payload: &Value) -> Result<(), String>;
}

/// Sink backed by a synchronous closure.
pub struct FnSink<F>(pub F);

#[async_trait]
impl<F> EventSink for FnSink<F>
where
    F: Fn(&str, &Value) -> Result<(), String> + Send + Sync,
{
    async fn deliver(&self, event_name: &str, payload: &Value) -> Result<(), String> {
        (self.0)(event_name, payload)
    }
}

/// Sink forwarding every event into an unbounded channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<(EventName, Value)>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(EventName, Value)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn deliver(&self, event_name: &str, payload: &Value) -> Result<(), String> {
        self.tx
            .send((event_name.to_string(), payload.clone()))
            .map_err(|_| "Receiver dropped".to_string())
    }
}

/// A listener's membership in one channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub event_name: EventName,
    pub listener: ListenerId,
}

/// A failed delivery, published on the diagnostic channel.
#[derive(Clone, Debug, Serialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryFault {
    pub event_name: EventName,
    pub listener: ListenerId,
    pub error: String,
}

/// Event names are non-empty.
pub fn validate_event_name(event_name: &str) -> CoreResult<()> {
    if event_name.trim().is_empty() {
        return Err(CoreError::InvalidEventName(event_name.to_string()));
    }
    Ok(())
}

// =============================================================================
// Bus
// =============================================================================

#[derive(Default)]
struct BusInner {
    listeners: HashMap<ListenerId, Arc<dyn EventSink>>,
    channels: HashMap<EventName, Vec<ListenerId>>,
}

pub struct EventBus {
    next_id: AtomicU64,
    inner: RwLock<BusInner>,
    faults: broadcast::Sender<DeliveryFault>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (faults, _) = broadcast::channel(DIAGNOSTIC_CAPACITY);
        Self {
            next_id: AtomicU64::new(1),
            inner: RwLock::new(BusInner::default()),
            faults,
        }
    }

    pub fn register_listener(&self, sink: Arc<dyn EventSink>) -> ListenerHandle {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .insert(id, sink);
        ListenerHandle { id }
    }

    /// Subscribes a listener to a channel. Subscribing twice is a no-op.
    pub fn subscribe(&self, event_name: &str, listener: &ListenerHandle) -> CoreResult<()> {
        validate_event_name(event_name)?;
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if !inner.listeners.contains_key(&listener.id) {
            return Err(CoreError::InvalidOperation(format!(
                "{} is no longer registered",
                listener.id
            )));
        }
        let members = inner.channels.entry(event_name.to_string()).or_default();
        if !members.contains(&listener.id) {
            members.push(listener.id);
        }
        Ok(())
    }

    /// Returns whether the listener was subscribed.
    pub fn unsubscribe(&self, event_name: &str, listener: ListenerId) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let Some(members) = inner.channels.get_mut(event_name) else {
            return false;
        };
        let before = members.len();
        members.retain(|id| *id != listener);
        let removed = members.len() != before;
        if members.is_empty() {
            inner.channels.remove(event_name);
        }
        removed
    }

    /// Drops a listener and every channel membership it holds.
    pub fn remove_listener(&self, listener: ListenerId) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let existed = inner.listeners.remove(&listener).is_some();
        inner.channels.retain(|_, members| {
            members.retain(|id| *id != listener);
            !members.is_empty()
        });
        existed
    }

    pub fn subscribers(&self, event_name: &str) -> Vec<ListenerId> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .channels
            .get(event_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Channels a listener currently belongs to.
    pub fn subscriptions_of(&self, listener: ListenerId) -> Vec<Subscription> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut subs: Vec<Subscription> = inner
            .channels
            .iter()
            .filter(|(_, members)| members.contains(&listener))
            .map(|(name, _)| Subscription {
                event_name: name.clone(),
                listener,
            })
            .collect();
        subs.sort_by(|a, b| a.event_name.cmp(&b.event_name));
        subs
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .len()
    }

    /// Receiver for delivery faults.
    pub fn diagnostics(&self) -> broadcast::Receiver<DeliveryFault> {
        self.faults.subscribe()
    }

    /// Delivers `payload` to the channel's current subscribers and returns how
    /// many were targeted. Never fails.
    pub async fn emit(&self, event_name: &str, payload: &Value) -> usize {
        let targets: Vec<(ListenerId, Arc<dyn EventSink>)> = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            inner
                .channels
                .get(event_name)
                .map(|members| {
                    members
                        .iter()
                        .filter_map(|id| inner.listeners.get(id).map(|s| (*id, Arc::clone(s))))
                        .collect()
                })
                .unwrap_or_default()
        };

        if targets.is_empty() {
            tracing::debug!("Event {} has no subscribers", event_name);
            return 0;
        }

        let deliveries = targets.iter().map(|(id, sink)| async move {
            let result = AssertUnwindSafe(sink.deliver(event_name, payload))
                .catch_unwind()
                .await;
            let error = match result {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e,
                Err(_) => "Listener panicked".to_string(),
            };
            tracing::warn!("Delivery of {} to {} failed: {}", event_name, id, error);
            let _ = self.faults.send(DeliveryFault {
                event_name: event_name.to_string(),
                listener: *id,
                error,
            });
        });
        join_all(deliveries).await;

        targets.len()
    }
}
