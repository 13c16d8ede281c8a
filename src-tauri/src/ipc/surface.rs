//! Tauri Surface Host
//!
//! Backs surfaces with Tauri webview windows. The window label is the
//! surface id; init messages and bus events reach the shell as webview
//! events (see [`event_names`]).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tauri::webview::PageLoadEvent;
use tauri::{
    AppHandle, Emitter, EventTarget, Manager, WebviewUrl, WebviewWindow, WebviewWindowBuilder,
    WindowEvent,
};
use tokio::sync::watch;

use crate::core::surface::{
    CloseCallback, SurfaceCapabilities, SurfaceConstraints, SurfaceHost, SurfaceSpec, VisualState,
};
use crate::core::{CoreError, CoreResult, SurfaceId};
use crate::ipc::events::{event_names, BridgeEventPayload};

/// How long a shell may take to finish its first page load.
const LOAD_TIMEOUT: Duration = Duration::from_secs(15);

/// Used when the primary monitor cannot be queried.
const FALLBACK_SCREEN: (f64, f64) = (1280.0, 800.0);

pub struct TauriSurfaceHost {
    app: AppHandle,
    loaded: Arc<Mutex<HashMap<SurfaceId, watch::Sender<bool>>>>,
}

fn tauri_error(surface_id: &str, err: tauri::Error) -> CoreError {
    CoreError::Internal(format!("Window {}: {}", surface_id, err))
}

impl TauriSurfaceHost {
    pub fn new(app: AppHandle) -> Self {
        Self {
            app,
            loaded: Default::default(),
        }
    }

    fn window(&self, surface_id: &str) -> CoreResult<WebviewWindow> {
        self.app
            .get_webview_window(surface_id)
            .ok_or_else(|| CoreError::SurfaceNotFound(surface_id.to_string()))
    }

    fn screen_size(&self) -> (f64, f64) {
        match self.app.primary_monitor() {
            Ok(Some(monitor)) => {
                let size = monitor.size().to_logical::<f64>(monitor.scale_factor());
                (size.width, size.height)
            }
            _ => FALLBACK_SCREEN,
        }
    }

    fn emit_to_surface(&self, surface_id: &str, event: &str, payload: &Value) -> CoreResult<()> {
        self.app
            .emit_to(EventTarget::webview_window(surface_id), event, payload)
            .map_err(|e| tauri_error(surface_id, e))
    }
}

#[async_trait]
impl SurfaceHost for TauriSurfaceHost {
    async fn create_surface(&self, spec: SurfaceSpec, on_closed: CloseCallback) -> CoreResult<()> {
        if self.app.get_webview_window(&spec.surface_id).is_some() {
            return Err(CoreError::SurfaceCreationFailed(format!(
                "Surface already exists: {}",
                spec.surface_id
            )));
        }

        let (screen_width, screen_height) = self.screen_size();
        let bounds = spec.placement.resolve(screen_width, screen_height);

        let (loaded_tx, _) = watch::channel(false);
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(spec.surface_id.clone(), loaded_tx);

        let loaded = Arc::clone(&self.loaded);
        let window = WebviewWindowBuilder::new(
            &self.app,
            spec.surface_id.as_str(),
            WebviewUrl::App(PathBuf::from(&spec.url)),
        )
        .title(&spec.title)
        .resizable(spec.constraints.resizable)
        .maximizable(spec.constraints.maximizable)
        .inner_size(bounds.width, bounds.height)
        .position(bounds.x, bounds.y)
        .visible(false)
        .on_page_load(move |window, payload| {
            if payload.event() == PageLoadEvent::Finished {
                if let Some(tx) = loaded
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(window.label())
                {
                    tx.send_replace(true);
                }
            }
        })
        .build();

        let window = match window {
            Ok(window) => window,
            Err(e) => {
                self.loaded
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&spec.surface_id);
                return Err(CoreError::SurfaceCreationFailed(e.to_string()));
            }
        };

        let surface_id = spec.surface_id.clone();
        let loaded = Arc::clone(&self.loaded);
        window.on_window_event(move |event| {
            if let WindowEvent::Destroyed = event {
                loaded
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&surface_id);
                on_closed(&surface_id);
            }
        });

        tracing::debug!("Created webview window {}", spec.surface_id);
        Ok(())
    }

    async fn wait_until_loaded(&self, surface_id: &str) -> CoreResult<()> {
        let mut rx = self
            .loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(surface_id)
            .map(watch::Sender::subscribe)
            .ok_or_else(|| CoreError::SurfaceNotFound(surface_id.to_string()))?;

        match tokio::time::timeout(LOAD_TIMEOUT, rx.wait_for(|loaded| *loaded)).await {
            Ok(Ok(_)) => Ok(()),
            // Sender dropped: the window was destroyed while loading.
            Ok(Err(_)) => Err(CoreError::SurfaceNotFound(surface_id.to_string())),
            Err(_) => Err(CoreError::SurfaceCreationFailed(format!(
                "Shell of {} did not load within {}s",
                surface_id,
                LOAD_TIMEOUT.as_secs()
            ))),
        }
    }

    async fn push_init(&self, surface_id: &str, init: &Value) -> CoreResult<()> {
        self.window(surface_id)?;
        self.emit_to_surface(surface_id, event_names::TEMPLATE_INIT, init)
    }

    async fn post_event(&self, surface_id: &str, event_name: &str, payload: &Value) -> CoreResult<()> {
        self.window(surface_id)?;
        let message = serde_json::to_value(BridgeEventPayload::new(event_name, payload))?;
        self.emit_to_surface(surface_id, event_names::BRIDGE_EVENT, &message)
    }

    async fn set_visual_state(&self, surface_id: &str, state: VisualState) -> CoreResult<()> {
        let window = self.window(surface_id)?;
        let result = match state {
            VisualState::Fullscreen => window.set_fullscreen(true),
            VisualState::Maximized => window
                .set_fullscreen(false)
                .and_then(|_| window.maximize()),
            VisualState::Minimized => window.minimize(),
            VisualState::Windowed => window
                .set_fullscreen(false)
                .and_then(|_| window.unmaximize())
                .and_then(|_| window.unminimize()),
        };
        result.map_err(|e| tauri_error(surface_id, e))
    }

    async fn visual_state(&self, surface_id: &str) -> CoreResult<VisualState> {
        let window = self.window(surface_id)?;
        let err = |e| tauri_error(surface_id, e);
        if window.is_minimized().map_err(err)? {
            Ok(VisualState::Minimized)
        } else if window.is_fullscreen().map_err(err)? {
            Ok(VisualState::Fullscreen)
        } else if window.is_maximized().map_err(err)? {
            Ok(VisualState::Maximized)
        } else {
            Ok(VisualState::Windowed)
        }
    }

    async fn configure(
        &self,
        surface_id: &str,
        title: &str,
        constraints: &SurfaceConstraints,
    ) -> CoreResult<()> {
        let window = self.window(surface_id)?;
        window
            .set_title(title)
            .and_then(|_| window.set_resizable(constraints.resizable))
            .and_then(|_| window.set_maximizable(constraints.maximizable))
            .map_err(|e| tauri_error(surface_id, e))
    }

    async fn capabilities(&self, surface_id: &str) -> CoreResult<SurfaceCapabilities> {
        let window = self.window(surface_id)?;
        let can_maximize = window
            .is_maximizable()
            .map_err(|e| tauri_error(surface_id, e))?;
        Ok(SurfaceCapabilities {
            can_maximize,
            can_fullscreen: true,
        })
    }

    async fn show(&self, surface_id: &str) -> CoreResult<()> {
        self.window(surface_id)?
            .show()
            .map_err(|e| tauri_error(surface_id, e))
    }

    async fn focus(&self, surface_id: &str) -> CoreResult<()> {
        let window = self.window(surface_id)?;
        if window.is_minimized().unwrap_or(false) {
            let _ = window.unminimize();
        }
        window.set_focus().map_err(|e| tauri_error(surface_id, e))
    }

    async fn close_surface(&self, surface_id: &str) -> CoreResult<()> {
        // destroy() skips CloseRequested; the Destroyed event runs on_closed.
        self.window(surface_id)?
            .destroy()
            .map_err(|e| tauri_error(surface_id, e))
    }
}
