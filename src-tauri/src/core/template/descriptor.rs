//! Template Descriptors
//!
//! The declarative payload a caller sends to open a template window, the
//! validated snapshot the orchestrator keeps per window, and the messages
//! exchanged with the template shell.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use specta::Type;

use crate::core::surface::{
    FloatingPlacement, SurfaceBounds, SurfaceCapabilities, SurfaceConstraints, VisualState,
};
use crate::core::{CoreError, CoreResult, EventName, PluginId, SurfaceId};

pub const MIN_FLOATING_PERCENT: u8 = 10;
pub const MAX_FLOATING_PERCENT: u8 = 100;

// =============================================================================
// Window Mode
// =============================================================================

/// Which visual states a template window may take.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum WindowMode {
    #[serde(alias = "fullscreen-only")]
    FullscreenOnly,
    #[serde(alias = "windowed-only")]
    WindowedOnly,
    #[serde(alias = "fullscreen-or-windowed")]
    FullscreenOrWindowed,
    #[serde(alias = "fullscreen-or-maximized")]
    FullscreenOrMaximized,
    #[default]
    #[serde(alias = "all-modes")]
    AllModes,
}

impl WindowMode {
    /// Parses a snake_case or kebab-case mode name.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().replace('-', "_").to_ascii_lowercase().as_str() {
            "fullscreen_only" => Some(Self::FullscreenOnly),
            "windowed_only" => Some(Self::WindowedOnly),
            "fullscreen_or_windowed" => Some(Self::FullscreenOrWindowed),
            "fullscreen_or_maximized" => Some(Self::FullscreenOrMaximized),
            "all_modes" => Some(Self::AllModes),
            _ => None,
        }
    }

    pub fn constraints(&self) -> SurfaceConstraints {
        match self {
            WindowMode::FullscreenOnly => SurfaceConstraints {
                resizable: false,
                maximizable: false,
                fullscreenable: true,
            },
            WindowMode::WindowedOnly => SurfaceConstraints {
                resizable: true,
                maximizable: false,
                fullscreenable: false,
            },
            WindowMode::FullscreenOrWindowed => SurfaceConstraints {
                resizable: true,
                maximizable: false,
                fullscreenable: true,
            },
            WindowMode::FullscreenOrMaximized => SurfaceConstraints {
                resizable: false,
                maximizable: true,
                fullscreenable: true,
            },
            WindowMode::AllModes => SurfaceConstraints::default(),
        }
    }

    pub fn capabilities(&self) -> SurfaceCapabilities {
        let constraints = self.constraints();
        SurfaceCapabilities {
            can_maximize: constraints.maximizable,
            can_fullscreen: constraints.fullscreenable,
        }
    }

    /// State applied eagerly on creation, and on restore.
    pub fn default_state(&self) -> VisualState {
        match self {
            WindowMode::FullscreenOnly => VisualState::Fullscreen,
            WindowMode::FullscreenOrMaximized => VisualState::Maximized,
            _ => VisualState::Windowed,
        }
    }

    pub fn allows(&self, state: VisualState) -> bool {
        match state {
            VisualState::Minimized => true,
            VisualState::Fullscreen => self.constraints().fullscreenable,
            VisualState::Maximized => self.constraints().maximizable,
            VisualState::Windowed => !matches!(
                self,
                WindowMode::FullscreenOnly | WindowMode::FullscreenOrMaximized
            ),
        }
    }

    /// State reached by toggling fullscreen from `current`.
    pub fn toggle_target(&self, current: VisualState) -> CoreResult<VisualState> {
        match self {
            WindowMode::WindowedOnly => Err(CoreError::InvalidOperation(
                "Window mode windowed_only does not allow fullscreen".to_string(),
            )),
            WindowMode::FullscreenOnly => Ok(VisualState::Fullscreen),
            WindowMode::FullscreenOrMaximized if current == VisualState::Fullscreen => {
                Ok(VisualState::Maximized)
            }
            _ if current == VisualState::Fullscreen => Ok(VisualState::Windowed),
            _ => Ok(VisualState::Fullscreen),
        }
    }
}

// =============================================================================
// Descriptor
// =============================================================================

/// Button shown in the template's left or center bar.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct TemplateButton {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
}

/// Template window request as sent by a caller.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct TemplateDescriptor {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub window_id: Option<String>,
    /// `false` opts out of reuse: every open creates a surface
    #[serde(default)]
    pub unique: Option<bool>,

    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub window_mode: Option<WindowMode>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub background_url: Option<String>,
    #[serde(default)]
    pub floating_url: Option<String>,

    #[serde(default)]
    pub floating_bounds: Option<SurfaceBounds>,
    #[serde(default)]
    pub floating_width: Option<f64>,
    #[serde(default)]
    pub floating_height: Option<f64>,
    #[serde(default)]
    pub floating_size_percent: Option<f64>,

    #[serde(default)]
    pub left_items: Vec<TemplateButton>,
    #[serde(default)]
    pub center_items: Vec<TemplateButton>,
    #[serde(default)]
    pub background_targets: BTreeMap<String, String>,

    #[serde(default)]
    pub event_channel: Option<EventName>,
    #[serde(default)]
    pub subscribe_topics: Option<Vec<EventName>>,
    #[serde(default)]
    pub caller_plugin_id: Option<PluginId>,
}

/// Defaults applied to descriptors that leave a field out.
#[derive(Clone, Debug, PartialEq)]
pub struct TemplateDefaults {
    pub shell_url: String,
    pub floating_percent: u8,
    pub window_mode: WindowMode,
}

impl Default for TemplateDefaults {
    fn default() -> Self {
        Self {
            shell_url: "index.html#/template".to_string(),
            floating_percent: 60,
            window_mode: WindowMode::AllModes,
        }
    }
}

fn required(value: &Option<String>, field: &str) -> CoreResult<String> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(CoreError::InvalidDescriptor(format!(
            "Missing required field '{field}'"
        ))),
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl TemplateDescriptor {
    /// Parses a descriptor from a call argument.
    pub fn parse(value: &Value) -> CoreResult<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| CoreError::InvalidDescriptor(format!("Malformed descriptor: {e}")))
    }

    /// Checks required fields without building a snapshot.
    pub fn validate(&self) -> CoreResult<()> {
        required(&self.title, "title")?;
        required(&self.event_channel, "eventChannel")?;
        required(&self.caller_plugin_id, "callerPluginId")?;
        required(&self.background_url, "backgroundUrl")?;
        if self.subscribe_topics.is_none() {
            return Err(CoreError::InvalidDescriptor(
                "Missing required field 'subscribeTopics'".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolves floating placement: absolute bounds, then explicit size,
    /// then a screen percentage.
    pub fn placement(&self, default_percent: u8) -> FloatingPlacement {
        if let Some(bounds) = self.floating_bounds {
            if bounds.width > 0.0 && bounds.height > 0.0 {
                return FloatingPlacement::Absolute { bounds };
            }
        }
        if let (Some(width), Some(height)) = (self.floating_width, self.floating_height) {
            if width > 0.0 && height > 0.0 {
                return FloatingPlacement::Centered { width, height };
            }
        }
        let percent = self
            .floating_size_percent
            .filter(|p| p.is_finite())
            .map(|p| p.round().clamp(f64::from(MIN_FLOATING_PERCENT), f64::from(MAX_FLOATING_PERCENT)) as u8)
            .unwrap_or_else(|| default_percent.clamp(MIN_FLOATING_PERCENT, MAX_FLOATING_PERCENT));
        FloatingPlacement::ScreenPercent { percent }
    }

    /// Validates the descriptor and builds the snapshot kept by the record.
    /// Capabilities start from the window mode and are narrowed once the
    /// surface exists.
    pub fn snapshot(&self, defaults: &TemplateDefaults) -> CoreResult<TemplateSnapshot> {
        self.validate()?;
        let window_mode = self.window_mode.unwrap_or(defaults.window_mode);
        let mut subscribe_topics: Vec<EventName> = Vec::new();
        for topic in self.subscribe_topics.iter().flatten() {
            let topic = topic.trim();
            if topic.is_empty() {
                return Err(CoreError::InvalidDescriptor(
                    "subscribeTopics contains an empty name".to_string(),
                ));
            }
            if !subscribe_topics.iter().any(|t| t == topic) {
                subscribe_topics.push(topic.to_string());
            }
        }

        Ok(TemplateSnapshot {
            title: required(&self.title, "title")?,
            window_mode,
            icon: non_blank(&self.icon),
            background_url: required(&self.background_url, "backgroundUrl")?,
            floating_url: non_blank(&self.floating_url),
            placement: self.placement(defaults.floating_percent),
            left_items: self.left_items.clone(),
            center_items: self.center_items.clone(),
            background_targets: self.background_targets.clone(),
            event_channel: required(&self.event_channel, "eventChannel")?,
            subscribe_topics,
            caller_plugin_id: required(&self.caller_plugin_id, "callerPluginId")?,
            capabilities: window_mode.capabilities(),
        })
    }
}

// =============================================================================
// Dedup Key
// =============================================================================

/// Where a dedup key came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub enum DedupSource {
    Id,
    WindowId,
    CallerPluginId,
    /// Non-unique window keyed by its own surface
    Surface,
}

/// Identity of a template window in the record table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct DedupKey {
    pub key: String,
    pub source: DedupSource,
}

impl DedupKey {
    /// Explicit `id`, then `windowId`, then `callerPluginId`. A descriptor
    /// with `unique: false` or no identity is keyed by its fresh surface
    /// and never reused.
    pub fn resolve(descriptor: &TemplateDescriptor, fresh_surface_id: &str) -> Self {
        let surface = || DedupKey {
            key: fresh_surface_id.to_string(),
            source: DedupSource::Surface,
        };
        if descriptor.unique == Some(false) {
            return surface();
        }
        if let Some(id) = non_blank(&descriptor.id) {
            return DedupKey {
                key: id,
                source: DedupSource::Id,
            };
        }
        if let Some(id) = non_blank(&descriptor.window_id) {
            return DedupKey {
                key: id,
                source: DedupSource::WindowId,
            };
        }
        if let Some(id) = non_blank(&descriptor.caller_plugin_id) {
            return DedupKey {
                key: id,
                source: DedupSource::CallerPluginId,
            };
        }
        surface()
    }
}

// =============================================================================
// Snapshot and Shell Messages
// =============================================================================

/// Validated state of a template window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSnapshot {
    pub title: String,
    pub window_mode: WindowMode,
    pub icon: Option<String>,
    pub background_url: String,
    pub floating_url: Option<String>,
    pub placement: FloatingPlacement,
    pub left_items: Vec<TemplateButton>,
    pub center_items: Vec<TemplateButton>,
    pub background_targets: BTreeMap<String, String>,
    pub event_channel: EventName,
    pub subscribe_topics: Vec<EventName>,
    pub caller_plugin_id: PluginId,
    pub capabilities: SurfaceCapabilities,
}

impl TemplateSnapshot {
    /// Channels the window's bridge subscribes to.
    pub fn channels(&self) -> Vec<EventName> {
        let mut channels = vec![self.event_channel.clone()];
        for topic in &self.subscribe_topics {
            if !channels.contains(topic) {
                channels.push(topic.clone());
            }
        }
        channels
    }
}

/// Initialization message pushed to the shell on creation and on reuse.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct TemplateInit {
    pub surface_id: SurfaceId,
    pub dedup_key: String,
    pub title: String,
    pub window_mode: WindowMode,
    pub icon: Option<String>,
    pub background_url: String,
    pub floating_url: Option<String>,
    pub placement: FloatingPlacement,
    pub left_items: Vec<TemplateButton>,
    pub center_items: Vec<TemplateButton>,
    pub background_targets: BTreeMap<String, String>,
    pub event_channel: EventName,
    pub subscribe_topics: Vec<EventName>,
    pub caller_plugin_id: PluginId,
    pub capabilities: SurfaceCapabilities,
}

impl TemplateInit {
    pub fn new(surface_id: &str, dedup_key: &str, snapshot: &TemplateSnapshot) -> Self {
        let s = snapshot.clone();
        Self {
            surface_id: surface_id.to_string(),
            dedup_key: dedup_key.to_string(),
            title: s.title,
            window_mode: s.window_mode,
            icon: s.icon,
            background_url: s.background_url,
            floating_url: s.floating_url,
            placement: s.placement,
            left_items: s.left_items,
            center_items: s.center_items,
            background_targets: s.background_targets,
            event_channel: s.event_channel,
            subscribe_topics: s.subscribe_topics,
            caller_plugin_id: s.caller_plugin_id,
            capabilities: s.capabilities,
        }
    }
}

/// Messages carried on a template's event channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TemplateEvent {
    /// Backend → shell: set one field
    #[serde(rename = "update")]
    Update { target: String, value: Value },
    /// Shell → backend: a center button was clicked
    #[serde(rename = "click")]
    Click {
        id: String,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    /// Shell → backend: a left button was clicked
    #[serde(rename = "left.click")]
    LeftClick {
        id: String,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
}

impl TemplateEvent {
    pub fn update(target: impl Into<String>, value: Value) -> Self {
        TemplateEvent::Update {
            target: target.into(),
            value,
        }
    }

    pub fn to_value(&self) -> CoreResult<Value> {
        Ok(serde_json::to_value(self)?)
    }
}
