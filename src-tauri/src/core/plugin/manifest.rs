//! Plugin Manifest
//!
//! Metadata bundled with every WASM plugin as `plugin.json`: identity, the
//! module entry point, the functions the module exports and the automation
//! events it declares.

use std::path::Path;

use serde::{Deserialize, Serialize};
use specta::Type;

use crate::core::registry::{validate_plugin_id, EventDescriptor};
use crate::core::{CoreError, CoreResult, FunctionName, PluginId};

pub const MANIFEST_FILE: &str = "plugin.json";

/// Plugin manifest (`plugin.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    /// Unique plugin identifier (e.g., "com.example.clock")
    pub id: PluginId,

    /// Display name
    pub name: String,

    /// Semantic version (e.g., "1.0.0")
    pub version: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub author: Option<String>,

    /// WASM module file, relative to the manifest
    pub entry: String,

    /// Exported functions callable through the router
    #[serde(default)]
    pub functions: Vec<FunctionName>,

    #[serde(default)]
    pub automation_events: Vec<EventDescriptor>,

    /// Run the module's `init` export once after registration
    #[serde(default)]
    pub init: bool,
}

fn invalid(message: impl Into<String>) -> CoreError {
    CoreError::InvalidPluginManifest(message.into())
}

impl PluginManifest {
    /// Loads a manifest from a JSON file
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| invalid(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    /// Parses and validates a manifest
    pub fn parse(json: &str) -> CoreResult<Self> {
        let manifest: Self = serde_json::from_str(json)
            .map_err(|e| invalid(format!("Invalid manifest JSON: {}", e)))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> CoreResult<()> {
        validate_plugin_id(&self.id).map_err(|e| invalid(e.to_string()))?;

        if self.name.trim().is_empty() {
            return Err(invalid("Plugin name cannot be empty"));
        }

        if !Self::is_valid_semver(&self.version) {
            return Err(invalid(format!(
                "Invalid version format: {}. Expected semver (e.g., 1.0.0)",
                self.version
            )));
        }

        if self.entry.trim().is_empty() {
            return Err(invalid("Plugin entry point cannot be empty"));
        }

        if self.functions.is_empty() {
            return Err(invalid("Plugin must declare at least one function"));
        }

        let mut seen = std::collections::HashSet::new();
        for function in &self.functions {
            if function.trim().is_empty() {
                return Err(invalid("Function name cannot be empty"));
            }
            // Reserved ABI exports
            if matches!(function.as_str(), "alloc" | "memory" | "init") {
                return Err(invalid(format!("Function name is reserved: {}", function)));
            }
            if !seen.insert(function.as_str()) {
                return Err(invalid(format!("Duplicate function: {}", function)));
            }
        }

        for event in &self.automation_events {
            if event.name.trim().is_empty() {
                return Err(invalid("Automation event name cannot be empty"));
            }
        }

        Ok(())
    }

    /// Basic `MAJOR.MINOR.PATCH` check
    fn is_valid_semver(version: &str) -> bool {
        let parts: Vec<&str> = version.split('.').collect();
        parts.len() == 3 && parts.iter().all(|part| part.parse::<u32>().is_ok())
    }
}

// ============================================================================
// Tests
// ============================================================================
