//! Plugin Registrations
//!
//! What a plugin contributes to the registry: its id, its function table,
//! the automation events it declares and an optional init hook.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use specta::Type;

use super::function::FunctionTable;
use crate::core::{CoreError, CoreResult, PluginId};

fn plugin_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").expect("plugin id pattern is valid")
    })
}

/// Checks a plugin id against the allowed character set.
pub fn validate_plugin_id(id: &str) -> CoreResult<()> {
    if plugin_id_pattern().is_match(id) {
        Ok(())
    } else {
        Err(CoreError::InvalidRegistration(format!(
            "Invalid plugin id: {id:?}"
        )))
    }
}

/// Automation event a plugin declares for discovery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct EventDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl EventDescriptor {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: None,
            description: None,
        }
    }
}

/// Hook run once after a plugin is registered.
#[async_trait]
pub trait InitHook: Send + Sync {
    async fn init(&self, plugin_id: &str) -> CoreResult<()>;
}

/// A plugin as known to the registry.
#[derive(Clone)]
pub struct PluginRegistration {
    pub plugin_id: PluginId,
    pub functions: FunctionTable,
    pub automation_events: Vec<EventDescriptor>,
    pub init_hook: Option<Arc<dyn InitHook>>,
}

impl PluginRegistration {
    /// Creates a registration after validating the id.
    pub fn new(plugin_id: impl Into<PluginId>, functions: FunctionTable) -> CoreResult<Self> {
        let plugin_id = plugin_id.into();
        validate_plugin_id(&plugin_id)?;
        Ok(Self {
            plugin_id,
            functions,
            automation_events: Vec::new(),
            init_hook: None,
        })
    }

    pub fn with_automation_events(mut self, events: Vec<EventDescriptor>) -> Self {
        self.automation_events = events;
        self
    }

    pub fn with_init_hook(mut self, hook: Arc<dyn InitHook>) -> Self {
        self.init_hook = Some(hook);
        self
    }
}

impl std::fmt::Debug for PluginRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistration")
            .field("plugin_id", &self.plugin_id)
            .field("functions", &self.functions)
            .field("automation_events", &self.automation_events)
            .field("init_hook", &self.init_hook.is_some())
            .finish()
    }
}
