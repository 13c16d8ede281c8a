//! UI Surfaces
//!
//! The isolation boundary between plugin UI and the host. A `SurfaceHost`
//! creates and drives surfaces (webview windows in the desktop shell, an
//! in-memory model when headless). Everything above this trait is
//! platform-agnostic.

mod headless;

pub use headless::{HeadlessSurface, HeadlessSurfaceHost};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use specta::Type;

use crate::core::{CoreResult, SurfaceId};

/// Invoked by the host exactly once when a surface goes away, whatever the
/// reason (user, plugin, host).
pub type CloseCallback = Arc<dyn Fn(&SurfaceId) + Send + Sync>;

// =============================================================================
// Surface Types
// =============================================================================

/// Window-manager constraints applied to a surface.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceConstraints {
    pub resizable: bool,
    pub maximizable: bool,
    pub fullscreenable: bool,
}

impl Default for SurfaceConstraints {
    fn default() -> Self {
        Self {
            resizable: true,
            maximizable: true,
            fullscreenable: true,
        }
    }
}

/// Pixel rectangle.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceBounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Where a floating (windowed) surface is placed.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, Type)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FloatingPlacement {
    /// Absolute position and size
    Absolute { bounds: SurfaceBounds },
    /// Fixed size, centered on screen
    #[serde(rename_all = "camelCase")]
    Centered { width: f64, height: f64 },
    /// Percentage of the screen, centered
    ScreenPercent { percent: u8 },
}

impl FloatingPlacement {
    /// Resolves the placement against a screen size.
    pub fn resolve(&self, screen_width: f64, screen_height: f64) -> SurfaceBounds {
        match *self {
            FloatingPlacement::Absolute { bounds } => bounds,
            FloatingPlacement::Centered { width, height } => SurfaceBounds {
                x: ((screen_width - width) / 2.0).max(0.0),
                y: ((screen_height - height) / 2.0).max(0.0),
                width,
                height,
            },
            FloatingPlacement::ScreenPercent { percent } => {
                let factor = f64::from(percent) / 100.0;
                let width = screen_width * factor;
                let height = screen_height * factor;
                SurfaceBounds {
                    x: (screen_width - width) / 2.0,
                    y: (screen_height - height) / 2.0,
                    width,
                    height,
                }
            }
        }
    }
}

/// Everything a host needs to create a surface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceSpec {
    pub surface_id: SurfaceId,
    pub title: String,
    pub url: String,
    pub constraints: SurfaceConstraints,
    pub placement: FloatingPlacement,
}

/// Window state of a surface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
pub enum VisualState {
    #[default]
    Windowed,
    Maximized,
    Fullscreen,
    Minimized,
}

/// Window-control action requested through a bridge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub enum WindowAction {
    Minimize,
    Maximize,
    Restore,
    ToggleFullscreen,
    Close,
}

/// What the platform allows for an existing surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceCapabilities {
    pub can_maximize: bool,
    pub can_fullscreen: bool,
}

// =============================================================================
// Host Trait
// =============================================================================

/// Creates and drives UI surfaces.
#[async_trait]
pub trait SurfaceHost: Send + Sync {
    /// Allocates a surface. `on_closed` must be called once the surface is
    /// gone, including when [`SurfaceHost::close_surface`] closes it.
    async fn create_surface(&self, spec: SurfaceSpec, on_closed: CloseCallback) -> CoreResult<()>;

    /// Resolves once the surface's shell has loaded and can receive messages.
    async fn wait_until_loaded(&self, surface_id: &str) -> CoreResult<()>;

    /// Delivers the initialization message.
    async fn push_init(&self, surface_id: &str, init: &Value) -> CoreResult<()>;

    /// Delivers a bus event to the surface.
    async fn post_event(&self, surface_id: &str, event_name: &str, payload: &Value) -> CoreResult<()>;

    async fn set_visual_state(&self, surface_id: &str, state: VisualState) -> CoreResult<()>;

    async fn visual_state(&self, surface_id: &str) -> CoreResult<VisualState>;

    /// Re-applies title and constraints to an existing surface.
    async fn configure(
        &self,
        surface_id: &str,
        title: &str,
        constraints: &SurfaceConstraints,
    ) -> CoreResult<()>;

    async fn capabilities(&self, surface_id: &str) -> CoreResult<SurfaceCapabilities>;

    async fn show(&self, surface_id: &str) -> CoreResult<()>;

    async fn focus(&self, surface_id: &str) -> CoreResult<()>;

    async fn close_surface(&self, surface_id: &str) -> CoreResult<()>;
}
