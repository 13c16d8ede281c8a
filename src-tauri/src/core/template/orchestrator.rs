//! Template Window Orchestrator
//!
//! Creates, deduplicates, rehydrates and tears down template windows. For a
//! given dedup key at most one surface exists at any time: the record table
//! is checked and claimed inside one critical section, concurrent opens of
//! a key that is still being created wait for that creation to settle, and
//! the host's close callback removes the record whatever closed the surface.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use specta::Type;
use tokio::sync::watch;

use super::descriptor::{
    DedupKey, DedupSource, TemplateDefaults, TemplateDescriptor, TemplateEvent, TemplateInit,
    TemplateSnapshot, WindowMode,
};
use crate::core::bridge::{Bridge, BridgeTable, WindowControl};
use crate::core::bus::EventBus;
use crate::core::surface::{
    CloseCallback, SurfaceCapabilities, SurfaceHost, SurfaceSpec, VisualState, WindowAction,
};
use crate::core::{new_surface_id, CoreError, CoreResult, EventName, SurfaceId};

/// Bus event published after every successful open.
pub const TEMPLATE_OPENED_EVENT: &str = "template.opened";

// =============================================================================
// Records
// =============================================================================

/// Phase of a live template window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub enum TemplatePhase {
    /// Initialized, not shown yet
    Ready,
    Visible,
}

/// One live template window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct TemplateWindowRecord {
    pub dedup_key: String,
    pub key_source: DedupSource,
    pub surface_id: SurfaceId,
    pub phase: TemplatePhase,
    pub snapshot: TemplateSnapshot,
    pub created_at: String,
    pub updated_at: String,
}

/// Result of [`TemplateOrchestrator::open`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct OpenedTemplate {
    pub surface_id: SurfaceId,
    pub dedup_key: String,
    /// True when an existing window was reused
    pub reused: bool,
    pub record: TemplateWindowRecord,
}

enum Slot {
    Creating {
        surface_id: SurfaceId,
        done: watch::Receiver<bool>,
    },
    Live(TemplateWindowRecord),
}

impl Slot {
    fn surface_id(&self) -> &str {
        match self {
            Slot::Creating { surface_id, .. } => surface_id,
            Slot::Live(record) => &record.surface_id,
        }
    }
}

#[derive(Default)]
struct RecordTable {
    slots: HashMap<String, Slot>,
    by_surface: HashMap<SurfaceId, String>,
}

impl RecordTable {
    /// Drops whatever slot the surface occupies.
    fn remove_surface(&mut self, surface_id: &str) -> Option<String> {
        let key = self.by_surface.remove(surface_id)?;
        let owned = self
            .slots
            .get(&key)
            .is_some_and(|slot| slot.surface_id() == surface_id);
        if owned {
            self.slots.remove(&key);
        }
        Some(key)
    }

    fn live_mut(&mut self, surface_id: &str) -> Option<&mut TemplateWindowRecord> {
        let key = self.by_surface.get(surface_id)?;
        match self.slots.get_mut(key) {
            Some(Slot::Live(record)) if record.surface_id == surface_id => Some(record),
            _ => None,
        }
    }
}

enum OpenAction {
    Reuse(SurfaceId),
    Wait(watch::Receiver<bool>),
    Create(CreationGuard),
}

/// Held by the task creating a key. On drop, releases waiters. If the
/// creation never went live (the `open` future was dropped midway), the
/// slot is cleared and the half-built surface is closed.
struct CreationGuard {
    table: Arc<Mutex<RecordTable>>,
    host: Arc<dyn SurfaceHost>,
    bridges: Arc<BridgeTable>,
    key: String,
    surface_id: SurfaceId,
    done: watch::Sender<bool>,
}

impl Drop for CreationGuard {
    fn drop(&mut self) {
        let stale = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            let stale = matches!(
                table.slots.get(&self.key),
                Some(Slot::Creating { surface_id, .. }) if *surface_id == self.surface_id
            );
            if stale {
                table.remove_surface(&self.surface_id);
            }
            stale
        };
        if stale {
            tracing::warn!(
                "Template window {} abandoned during creation, closing {}",
                self.key,
                self.surface_id
            );
            self.bridges.detach(&self.surface_id);
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let host = Arc::clone(&self.host);
                let surface_id = self.surface_id.clone();
                runtime.spawn(async move {
                    // The surface may never have been allocated.
                    let _ = host.close_surface(&surface_id).await;
                });
            }
        }
        let _ = self.done.send(true);
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct TemplateOrchestrator {
    host: Arc<dyn SurfaceHost>,
    bridges: Arc<BridgeTable>,
    bus: Arc<EventBus>,
    defaults: TemplateDefaults,
    table: Arc<Mutex<RecordTable>>,
}

impl TemplateOrchestrator {
    pub fn new(
        host: Arc<dyn SurfaceHost>,
        bridges: Arc<BridgeTable>,
        bus: Arc<EventBus>,
        defaults: TemplateDefaults,
    ) -> Self {
        Self {
            host,
            bridges,
            bus,
            defaults,
            table: Arc::new(Mutex::new(RecordTable::default())),
        }
    }

    pub fn defaults(&self) -> &TemplateDefaults {
        &self.defaults
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecordTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Callback handed to the host for every template surface.
    fn close_callback(&self) -> CloseCallback {
        let table = Arc::downgrade(&self.table);
        let bridges = Arc::downgrade(&self.bridges);
        Arc::new(move |surface_id: &SurfaceId| {
            if let Some(table) = table.upgrade() {
                let removed = table
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove_surface(surface_id);
                if let Some(key) = removed {
                    tracing::info!("Template window {} closed ({})", key, surface_id);
                }
            }
            if let Some(bridges) = bridges.upgrade() {
                bridges.detach(surface_id);
            }
        })
    }

    /// Opens a template window, or reuses the live window of the same key.
    pub async fn open(self: &Arc<Self>, descriptor: TemplateDescriptor) -> CoreResult<OpenedTemplate> {
        let snapshot = descriptor.snapshot(&self.defaults)?;
        let fresh_surface_id = new_surface_id();
        let dedup = DedupKey::resolve(&descriptor, &fresh_surface_id);

        loop {
            let action = {
                let mut table = self.lock();
                match table.slots.get(&dedup.key) {
                    Some(Slot::Live(record)) => OpenAction::Reuse(record.surface_id.clone()),
                    Some(Slot::Creating { done, .. }) => OpenAction::Wait(done.clone()),
                    None => {
                        let (tx, rx) = watch::channel(false);
                        table.slots.insert(
                            dedup.key.clone(),
                            Slot::Creating {
                                surface_id: fresh_surface_id.clone(),
                                done: rx,
                            },
                        );
                        table
                            .by_surface
                            .insert(fresh_surface_id.clone(), dedup.key.clone());
                        OpenAction::Create(CreationGuard {
                            table: Arc::clone(&self.table),
                            host: Arc::clone(&self.host),
                            bridges: Arc::clone(&self.bridges),
                            key: dedup.key.clone(),
                            surface_id: fresh_surface_id.clone(),
                            done: tx,
                        })
                    }
                }
            };

            match action {
                OpenAction::Reuse(surface_id) => {
                    let inherit_mode = descriptor.window_mode.is_none();
                    match self
                        .reuse(&dedup, &surface_id, snapshot.clone(), inherit_mode)
                        .await
                    {
                        Err(CoreError::SurfaceNotFound(_)) => {
                            // The surface vanished without its close callback; forget it.
                            tracing::warn!("Template surface {} is gone, recreating", surface_id);
                            self.lock().remove_surface(&surface_id);
                            self.bridges.detach(&surface_id);
                        }
                        other => return self.announce(other).await,
                    }
                }
                OpenAction::Wait(mut done) => {
                    // Either outcome of the other creation means re-checking the table.
                    let _ = done.wait_for(|finished| *finished).await;
                }
                OpenAction::Create(guard) => {
                    let result = self.create(&dedup, &fresh_surface_id, snapshot).await;
                    drop(guard);
                    return self.announce(result).await;
                }
            }
        }
    }

    /// Publishes `template.opened` for a successful open.
    async fn announce(&self, result: CoreResult<OpenedTemplate>) -> CoreResult<OpenedTemplate> {
        if let Ok(opened) = &result {
            let payload = serde_json::json!({
                "dedupKey": opened.dedup_key,
                "surfaceId": opened.surface_id,
                "reused": opened.reused,
                "callerPluginId": opened.record.snapshot.caller_plugin_id,
            });
            self.bus.emit(TEMPLATE_OPENED_EVENT, &payload).await;
        }
        result
    }

    async fn create(
        self: &Arc<Self>,
        dedup: &DedupKey,
        surface_id: &str,
        snapshot: TemplateSnapshot,
    ) -> CoreResult<OpenedTemplate> {
        match self.build_surface(dedup, surface_id, snapshot).await {
            Ok(opened) => {
                tracing::info!(
                    "Opened template window {} as {}",
                    dedup.key,
                    opened.surface_id
                );
                Ok(opened)
            }
            Err(err) => {
                tracing::warn!("Template window {} failed to open: {}", dedup.key, err);
                self.lock().remove_surface(surface_id);
                self.bridges.detach(surface_id);
                // Best effort; the surface may never have been allocated.
                let _ = self.host.close_surface(surface_id).await;
                Err(match err {
                    failed @ CoreError::SurfaceCreationFailed(_) => failed,
                    other => CoreError::SurfaceCreationFailed(other.to_string()),
                })
            }
        }
    }

    async fn build_surface(
        self: &Arc<Self>,
        dedup: &DedupKey,
        surface_id: &str,
        mut snapshot: TemplateSnapshot,
    ) -> CoreResult<OpenedTemplate> {
        let spec = SurfaceSpec {
            surface_id: surface_id.to_string(),
            title: snapshot.title.clone(),
            url: self.defaults.shell_url.clone(),
            constraints: snapshot.window_mode.constraints(),
            placement: snapshot.placement,
        };
        self.host.create_surface(spec, self.close_callback()).await?;
        self.host.wait_until_loaded(surface_id).await?;
        self.ensure_creating(&dedup.key, surface_id)?;

        let windows: Arc<dyn WindowControl> = self.clone();
        let bridge = self
            .bridges
            .attach(surface_id, Some(snapshot.caller_plugin_id.clone()), &windows);
        sync_channels(&bridge, &[], &snapshot.channels())?;

        snapshot.capabilities = self
            .capabilities_for(surface_id, snapshot.window_mode)
            .await?;
        let init = serde_json::to_value(TemplateInit::new(surface_id, &dedup.key, &snapshot))?;
        self.host.push_init(surface_id, &init).await?;

        let now = chrono::Utc::now().to_rfc3339();
        let mut record = TemplateWindowRecord {
            dedup_key: dedup.key.clone(),
            key_source: dedup.source,
            surface_id: surface_id.to_string(),
            phase: TemplatePhase::Ready,
            snapshot: snapshot.clone(),
            created_at: now.clone(),
            updated_at: now,
        };
        {
            let mut table = self.lock();
            match table.slots.get(&dedup.key) {
                Some(Slot::Creating { surface_id: id, .. }) if id == surface_id => {}
                _ => return Err(aborted(surface_id)),
            }
            table
                .slots
                .insert(dedup.key.clone(), Slot::Live(record.clone()));
        }

        let default_state = snapshot.window_mode.default_state();
        if default_state != VisualState::Windowed {
            self.host.set_visual_state(surface_id, default_state).await?;
        }
        self.host.show(surface_id).await?;

        if let Some(live) = self.lock().live_mut(surface_id) {
            live.phase = TemplatePhase::Visible;
            record = live.clone();
        }

        Ok(OpenedTemplate {
            surface_id: surface_id.to_string(),
            dedup_key: dedup.key.clone(),
            reused: false,
            record,
        })
    }

    fn ensure_creating(&self, key: &str, surface_id: &str) -> CoreResult<()> {
        match self.lock().slots.get(key) {
            Some(Slot::Creating { surface_id: id, .. }) if id == surface_id => Ok(()),
            _ => Err(aborted(surface_id)),
        }
    }

    /// Rehydrates a live window. With `inherit_mode` the window keeps its
    /// current mode instead of the descriptor default.
    async fn reuse(
        self: &Arc<Self>,
        dedup: &DedupKey,
        surface_id: &str,
        mut snapshot: TemplateSnapshot,
        inherit_mode: bool,
    ) -> CoreResult<OpenedTemplate> {
        let bridge = self.bridges.get(surface_id)?;
        let (previous, current_mode) = self
            .lock()
            .live_mut(surface_id)
            .map(|record| (record.snapshot.channels(), record.snapshot.window_mode))
            .ok_or_else(|| CoreError::SurfaceNotFound(surface_id.to_string()))?;
        if inherit_mode {
            snapshot.window_mode = current_mode;
        }

        self.host
            .configure(
                surface_id,
                &snapshot.title,
                &snapshot.window_mode.constraints(),
            )
            .await?;
        sync_channels(&bridge, &previous, &snapshot.channels())?;
        snapshot.capabilities = self
            .capabilities_for(surface_id, snapshot.window_mode)
            .await?;

        let record = {
            let mut table = self.lock();
            let record = table
                .live_mut(surface_id)
                .ok_or_else(|| CoreError::SurfaceNotFound(surface_id.to_string()))?;
            record.snapshot = snapshot.clone();
            record.updated_at = chrono::Utc::now().to_rfc3339();
            record.clone()
        };

        let init = serde_json::to_value(TemplateInit::new(surface_id, &dedup.key, &snapshot))?;
        self.host.push_init(surface_id, &init).await?;
        self.host.focus(surface_id).await?;

        tracing::debug!("Reused template window {} ({})", dedup.key, surface_id);
        Ok(OpenedTemplate {
            surface_id: surface_id.to_string(),
            dedup_key: dedup.key.clone(),
            reused: true,
            record,
        })
    }

    /// Mode capabilities narrowed by what the surface actually supports.
    async fn capabilities_for(
        &self,
        surface_id: &str,
        mode: WindowMode,
    ) -> CoreResult<SurfaceCapabilities> {
        let surface = self.host.capabilities(surface_id).await?;
        let wanted = mode.capabilities();
        Ok(SurfaceCapabilities {
            can_maximize: surface.can_maximize && wanted.can_maximize,
            can_fullscreen: surface.can_fullscreen && wanted.can_fullscreen,
        })
    }

    // =========================================================================
    // Window Operations
    // =========================================================================

    fn surface_of_key(&self, key: &str) -> CoreResult<SurfaceId> {
        self.lock()
            .slots
            .get(key)
            .map(|slot| slot.surface_id().to_string())
            .ok_or_else(|| CoreError::TemplateNotFound(key.to_string()))
    }

    fn live_record(&self, surface_id: &str) -> CoreResult<TemplateWindowRecord> {
        self.lock()
            .live_mut(surface_id)
            .cloned()
            .ok_or_else(|| CoreError::SurfaceNotFound(surface_id.to_string()))
    }

    /// Closes the window of `key`. Closing a window still being created
    /// aborts the creation.
    pub async fn close(&self, key: &str) -> CoreResult<()> {
        let surface_id = self.surface_of_key(key)?;
        self.close_surface(&surface_id).await
    }

    pub async fn close_surface(&self, surface_id: &str) -> CoreResult<()> {
        match self.host.close_surface(surface_id).await {
            Err(CoreError::SurfaceNotFound(_)) => {
                // Host already lost it; make sure nothing lingers.
                self.lock().remove_surface(surface_id);
                self.bridges.detach(surface_id);
                Ok(())
            }
            other => other,
        }
    }

    /// Toggles fullscreen under the window mode's policy. Returns the new state.
    pub async fn toggle_fullscreen(&self, surface_id: &str) -> CoreResult<VisualState> {
        let record = self.live_record(surface_id)?;
        let current = self.host.visual_state(surface_id).await?;
        let target = record.snapshot.window_mode.toggle_target(current)?;
        if target != current {
            self.host.set_visual_state(surface_id, target).await?;
        }
        Ok(target)
    }

    /// Switches the window mode of a live window and tells the shell about
    /// the new capabilities.
    pub async fn set_window_mode(
        &self,
        surface_id: &str,
        mode: WindowMode,
    ) -> CoreResult<SurfaceCapabilities> {
        let record = self.live_record(surface_id)?;
        self.host
            .configure(surface_id, &record.snapshot.title, &mode.constraints())
            .await?;

        let current = self.host.visual_state(surface_id).await?;
        if !mode.allows(current) {
            self.host
                .set_visual_state(surface_id, mode.default_state())
                .await?;
        }
        let capabilities = self.capabilities_for(surface_id, mode).await?;

        let channel = {
            let mut table = self.lock();
            let live = table
                .live_mut(surface_id)
                .ok_or_else(|| CoreError::SurfaceNotFound(surface_id.to_string()))?;
            live.snapshot.window_mode = mode;
            live.snapshot.capabilities = capabilities;
            live.updated_at = chrono::Utc::now().to_rfc3339();
            live.snapshot.event_channel.clone()
        };

        for event in [
            TemplateEvent::update("windowMode", serde_json::to_value(mode)?),
            TemplateEvent::update("capabilities", serde_json::to_value(capabilities)?),
        ] {
            self.host
                .post_event(surface_id, &channel, &event.to_value()?)
                .await?;
        }
        Ok(capabilities)
    }

    pub async fn focus(&self, surface_id: &str) -> CoreResult<()> {
        self.live_record(surface_id)?;
        self.host.focus(surface_id).await
    }

    /// Emits `{type:'update', target, value}` on the window's event channel.
    /// Returns how many subscribers were targeted.
    pub async fn push_update(&self, key: &str, target: &str, value: Value) -> CoreResult<usize> {
        let channel: EventName = {
            let table = self.lock();
            match table.slots.get(key) {
                Some(Slot::Live(record)) => record.snapshot.event_channel.clone(),
                _ => return Err(CoreError::TemplateNotFound(key.to_string())),
            }
        };
        let payload = TemplateEvent::update(target, value).to_value()?;
        Ok(self.bus.emit(&channel, &payload).await)
    }

    /// Live records, sorted by key.
    pub fn records(&self) -> Vec<TemplateWindowRecord> {
        let mut records: Vec<TemplateWindowRecord> = self
            .lock()
            .slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(record) => Some(record.clone()),
                Slot::Creating { .. } => None,
            })
            .collect();
        records.sort_by(|a, b| a.dedup_key.cmp(&b.dedup_key));
        records
    }

    pub fn record(&self, key: &str) -> Option<TemplateWindowRecord> {
        match self.lock().slots.get(key) {
            Some(Slot::Live(record)) => Some(record.clone()),
            _ => None,
        }
    }

    pub fn is_creating(&self, key: &str) -> bool {
        matches!(self.lock().slots.get(key), Some(Slot::Creating { .. }))
    }

    pub fn is_template_surface(&self, surface_id: &str) -> bool {
        self.lock().by_surface.contains_key(surface_id)
    }
}

fn aborted(surface_id: &str) -> CoreError {
    CoreError::SurfaceCreationFailed(format!(
        "Surface {surface_id} was closed during creation"
    ))
}

/// Moves a bridge from `previous` channels to `next`, leaving subscriptions
/// the surface made on its own alone.
fn sync_channels(bridge: &Bridge, previous: &[EventName], next: &[EventName]) -> CoreResult<()> {
    for channel in previous {
        if !next.contains(channel) {
            bridge.unsubscribe(channel);
        }
    }
    for channel in next {
        bridge.subscribe(channel)?;
    }
    Ok(())
}

#[async_trait]
impl WindowControl for TemplateOrchestrator {
    async fn window_control(&self, surface_id: &str, action: WindowAction) -> CoreResult<()> {
        let mode = self
            .lock()
            .live_mut(surface_id)
            .map(|record| record.snapshot.window_mode);

        match action {
            WindowAction::Close => self.close_surface(surface_id).await,
            WindowAction::Minimize => {
                self.host
                    .set_visual_state(surface_id, VisualState::Minimized)
                    .await
            }
            WindowAction::Maximize => {
                if let Some(mode) = mode {
                    if !mode.allows(VisualState::Maximized) {
                        return Err(CoreError::InvalidOperation(
                            "Window mode does not allow maximize".to_string(),
                        ));
                    }
                }
                self.host
                    .set_visual_state(surface_id, VisualState::Maximized)
                    .await
            }
            WindowAction::Restore => {
                let state = mode.map(|m| m.default_state()).unwrap_or_default();
                self.host.set_visual_state(surface_id, state).await
            }
            WindowAction::ToggleFullscreen => match mode {
                Some(_) => self.toggle_fullscreen(surface_id).await.map(|_| ()),
                None => {
                    let current = self.host.visual_state(surface_id).await?;
                    let next = if current == VisualState::Fullscreen {
                        VisualState::Windowed
                    } else {
                        VisualState::Fullscreen
                    };
                    self.host.set_visual_state(surface_id, next).await
                }
            },
        }
    }
}
