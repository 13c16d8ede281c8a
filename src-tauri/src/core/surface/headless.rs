//! Headless surface host.
//!
//! In-memory surfaces for the CLI and for tests. Mirrors what a template
//! shell does with the messages it receives, and exposes controls to
//! simulate user actions and platform failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use super::{
    CloseCallback, SurfaceCapabilities, SurfaceConstraints, SurfaceHost, SurfaceSpec, VisualState,
};
use crate::core::{CoreError, CoreResult, EventName, SurfaceId};

/// Observable state of a headless surface.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeadlessSurface {
    pub spec: SurfaceSpec,
    pub loaded: bool,
    pub visible: bool,
    pub visual_state: VisualState,
    pub focus_count: u32,
    pub init_count: u32,
    pub init: Option<Value>,
    /// Field values as a shell would render them: replaced by each init,
    /// patched by `update` events.
    pub fields: Map<String, Value>,
    pub events: Vec<(EventName, Value)>,
}

struct Entry {
    surface: HeadlessSurface,
    on_closed: CloseCallback,
}

#[derive(Default)]
pub struct HeadlessSurfaceHost {
    surfaces: Mutex<HashMap<SurfaceId, Entry>>,
    created: AtomicUsize,
    fail_next: Mutex<Option<String>>,
    load_delay: Mutex<Duration>,
}

impl HeadlessSurfaceHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_surface<T>(
        &self,
        surface_id: &str,
        f: impl FnOnce(&mut HeadlessSurface) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let mut surfaces = self.surfaces.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = surfaces
            .get_mut(surface_id)
            .ok_or_else(|| CoreError::SurfaceNotFound(surface_id.to_string()))?;
        f(&mut entry.surface)
    }

    fn remove(&self, surface_id: &str) -> Option<CloseCallback> {
        self.surfaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(surface_id)
            .map(|entry| entry.on_closed)
    }

    // =========================================================================
    // Simulation Controls
    // =========================================================================

    pub fn snapshot(&self, surface_id: &str) -> Option<HeadlessSurface> {
        self.surfaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(surface_id)
            .map(|entry| entry.surface.clone())
    }

    pub fn live_surfaces(&self) -> Vec<SurfaceId> {
        let mut ids: Vec<SurfaceId> = self
            .surfaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Total surfaces ever created.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Makes the next `create_surface` fail with `reason`.
    pub fn fail_next_creation(&self, reason: impl Into<String>) {
        *self.fail_next.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason.into());
    }

    /// Delays `wait_until_loaded` for every surface.
    pub fn set_load_delay(&self, delay: Duration) {
        *self.load_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Simulates the user closing a surface. Returns false if it was not live.
    pub fn user_close(&self, surface_id: &str) -> bool {
        match self.remove(surface_id) {
            Some(on_closed) => {
                on_closed(&surface_id.to_string());
                true
            }
            None => false,
        }
    }
}

fn check_state_allowed(constraints: &SurfaceConstraints, state: VisualState) -> CoreResult<()> {
    match state {
        VisualState::Maximized if !constraints.maximizable => Err(CoreError::InvalidOperation(
            "Surface cannot be maximized".to_string(),
        )),
        VisualState::Fullscreen if !constraints.fullscreenable => Err(
            CoreError::InvalidOperation("Surface cannot enter fullscreen".to_string()),
        ),
        _ => Ok(()),
    }
}

#[async_trait]
impl SurfaceHost for HeadlessSurfaceHost {
    async fn create_surface(&self, spec: SurfaceSpec, on_closed: CloseCallback) -> CoreResult<()> {
        if let Some(reason) = self
            .fail_next
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            return Err(CoreError::SurfaceCreationFailed(reason));
        }

        let mut surfaces = self.surfaces.lock().unwrap_or_else(PoisonError::into_inner);
        if surfaces.contains_key(&spec.surface_id) {
            return Err(CoreError::SurfaceCreationFailed(format!(
                "Surface already exists: {}",
                spec.surface_id
            )));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        surfaces.insert(
            spec.surface_id.clone(),
            Entry {
                surface: HeadlessSurface {
                    spec,
                    loaded: false,
                    visible: false,
                    visual_state: VisualState::Windowed,
                    focus_count: 0,
                    init_count: 0,
                    init: None,
                    fields: Map::new(),
                    events: Vec::new(),
                },
                on_closed,
            },
        );
        Ok(())
    }

    async fn wait_until_loaded(&self, surface_id: &str) -> CoreResult<()> {
        let delay = *self.load_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.with_surface(surface_id, |s| {
            s.loaded = true;
            Ok(())
        })
    }

    async fn push_init(&self, surface_id: &str, init: &Value) -> CoreResult<()> {
        self.with_surface(surface_id, |s| {
            if !s.loaded {
                return Err(CoreError::InvalidOperation(
                    "Surface shell has not loaded".to_string(),
                ));
            }
            s.init_count += 1;
            s.fields = init.as_object().cloned().unwrap_or_default();
            s.init = Some(init.clone());
            Ok(())
        })
    }

    async fn post_event(&self, surface_id: &str, event_name: &str, payload: &Value) -> CoreResult<()> {
        self.with_surface(surface_id, |s| {
            if payload.get("type").and_then(Value::as_str) == Some("update") {
                if let Some(target) = payload.get("target").and_then(Value::as_str) {
                    let value = payload.get("value").cloned().unwrap_or(Value::Null);
                    s.fields.insert(target.to_string(), value);
                }
            }
            s.events.push((event_name.to_string(), payload.clone()));
            Ok(())
        })
    }

    async fn set_visual_state(&self, surface_id: &str, state: VisualState) -> CoreResult<()> {
        self.with_surface(surface_id, |s| {
            check_state_allowed(&s.spec.constraints, state)?;
            s.visual_state = state;
            Ok(())
        })
    }

    async fn visual_state(&self, surface_id: &str) -> CoreResult<VisualState> {
        self.with_surface(surface_id, |s| Ok(s.visual_state))
    }

    async fn configure(
        &self,
        surface_id: &str,
        title: &str,
        constraints: &SurfaceConstraints,
    ) -> CoreResult<()> {
        self.with_surface(surface_id, |s| {
            s.spec.title = title.to_string();
            s.spec.constraints = constraints.clone();
            if check_state_allowed(constraints, s.visual_state).is_err() {
                s.visual_state = VisualState::Windowed;
            }
            Ok(())
        })
    }

    async fn capabilities(&self, surface_id: &str) -> CoreResult<SurfaceCapabilities> {
        self.with_surface(surface_id, |s| {
            Ok(SurfaceCapabilities {
                can_maximize: s.spec.constraints.maximizable,
                can_fullscreen: s.spec.constraints.fullscreenable,
            })
        })
    }

    async fn show(&self, surface_id: &str) -> CoreResult<()> {
        self.with_surface(surface_id, |s| {
            s.visible = true;
            Ok(())
        })
    }

    async fn focus(&self, surface_id: &str) -> CoreResult<()> {
        self.with_surface(surface_id, |s| {
            s.focus_count += 1;
            Ok(())
        })
    }

    async fn close_surface(&self, surface_id: &str) -> CoreResult<()> {
        let on_closed = self
            .remove(surface_id)
            .ok_or_else(|| CoreError::SurfaceNotFound(surface_id.to_string()))?;
        on_closed(&surface_id.to_string());
        Ok(())
    }
}
