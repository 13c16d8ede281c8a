//! Template Windows
//!
//! Shared template surfaces opened from declarative descriptors.
//!
//! # Modules
//!
//! - `descriptor`: Descriptors, window modes, dedup keys and shell messages
//! - `orchestrator`: Creation, reuse, rehydration and teardown of windows
//! - `plugin`: The `window-template` builtin plugin

pub mod descriptor;
pub mod orchestrator;
pub mod plugin;

pub use descriptor::{
    DedupKey, DedupSource, TemplateButton, TemplateDefaults, TemplateDescriptor, TemplateEvent,
    TemplateInit, TemplateSnapshot, WindowMode, MAX_FLOATING_PERCENT, MIN_FLOATING_PERCENT,
};
pub use orchestrator::{
    OpenedTemplate, TemplateOrchestrator, TemplatePhase, TemplateWindowRecord, TEMPLATE_OPENED_EVENT,
};
pub use plugin::{template_plugin, TEMPLATE_PLUGIN_ID};
