//! Plugin Registry
//!
//! Process-wide table of loaded plugins. Owned by the coordinator and shared
//! with the call router; never a module-level singleton.

mod function;
mod registration;

pub use function::{
    arg, opt_arg, AsyncFn, CallContext, FunctionTable, FunctionTableBuilder, HandlerError,
    HandlerResult, PluginFunction, SyncFn,
};
pub use registration::{validate_plugin_id, EventDescriptor, InitHook, PluginRegistration};

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use specta::Type;

use crate::core::{CoreError, CoreResult, FunctionName, PluginId};

/// Public view of a registered plugin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct PluginSummary {
    pub id: PluginId,
    pub functions: Vec<FunctionName>,
    pub automation_events: Vec<EventDescriptor>,
}

#[derive(Default)]
struct RegistryInner {
    plugins: HashMap<PluginId, Arc<PluginRegistration>>,
    order: Vec<PluginId>,
}

/// Table of registered plugins keyed by id.
#[derive(Default)]
pub struct PluginRegistry {
    inner: RwLock<RegistryInner>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin. Ids are unique for the life of the registration.
    pub fn register(&self, registration: PluginRegistration) -> CoreResult<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.plugins.contains_key(&registration.plugin_id) {
            return Err(CoreError::DuplicateRegistration(registration.plugin_id));
        }

        let id = registration.plugin_id.clone();
        tracing::info!(
            "Registered plugin {} ({} functions)",
            id,
            registration.functions.len()
        );
        inner.order.push(id.clone());
        inner.plugins.insert(id, Arc::new(registration));
        Ok(())
    }

    /// Removes a plugin. Required before the same id can be registered again.
    pub fn unregister(&self, plugin_id: &str) -> CoreResult<Arc<PluginRegistration>> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let removed = inner
            .plugins
            .remove(plugin_id)
            .ok_or_else(|| CoreError::UnknownPlugin(plugin_id.to_string()))?;
        inner.order.retain(|id| id != plugin_id);
        tracing::info!("Unregistered plugin {}", plugin_id);
        Ok(removed)
    }

    pub fn lookup(&self, plugin_id: &str) -> CoreResult<Arc<PluginRegistration>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .plugins
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| CoreError::UnknownPlugin(plugin_id.to_string()))
    }

    pub fn contains(&self, plugin_id: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .plugins
            .contains_key(plugin_id)
    }

    /// Plugin ids in registration order.
    pub fn list(&self) -> Vec<PluginId> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .clone()
    }

    pub fn describe(&self) -> Vec<PluginSummary> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .order
            .iter()
            .filter_map(|id| inner.plugins.get(id))
            .map(|reg| PluginSummary {
                id: reg.plugin_id.clone(),
                functions: reg.functions.names(),
                automation_events: reg.automation_events.clone(),
            })
            .collect()
    }

    /// Every declared automation event, tagged with the declaring plugin.
    pub fn automation_events(&self) -> Vec<(PluginId, EventDescriptor)> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .order
            .iter()
            .filter_map(|id| inner.plugins.get(id))
            .flat_map(|reg| {
                reg.automation_events
                    .iter()
                    .map(|ev| (reg.plugin_id.clone(), ev.clone()))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .plugins
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn registration(id: &str) -> PluginRegistration {
        let table = FunctionTable::builder()
            .sync_function("ping", |_, _| Ok(Value::from("pong")))
            .build()
            .unwrap();
        PluginRegistration::new(id, table).unwrap()
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = PluginRegistry::new();
        registry.register(registration("alpha")).unwrap();

        let reg = registry.lookup("alpha").unwrap();
        assert!(reg.functions.contains("ping"));
        assert!(matches!(
            registry.lookup("missing"),
            Err(CoreError::UnknownPlugin(id)) if id == "missing"
        ));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = PluginRegistry::new();
        registry.register(registration("alpha")).unwrap();
        let err = registry.register(registration("alpha")).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateRegistration(id) if id == "alpha"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_then_register_again() {
        let registry = PluginRegistry::new();
        registry.register(registration("alpha")).unwrap();
        registry.unregister("alpha").unwrap();
        assert!(!registry.contains("alpha"));
        registry.register(registration("alpha")).unwrap();
        assert!(registry.contains("alpha"));

        assert!(matches!(
            registry.unregister("ghost"),
            Err(CoreError::UnknownPlugin(_))
        ));
    }

    #[test]
    fn test_list_keeps_registration_order() {
        let registry = PluginRegistry::new();
        for id in ["zeta", "alpha", "mid"] {
            registry.register(registration(id)).unwrap();
        }
        assert_eq!(registry.list(), vec!["zeta", "alpha", "mid"]);

        registry.unregister("alpha").unwrap();
        assert_eq!(registry.list(), vec!["zeta", "mid"]);
    }

    #[test]
    fn test_describe_and_automation_events() {
        let registry = PluginRegistry::new();
        registry
            .register(
                registration("clock")
                    .with_automation_events(vec![EventDescriptor::named("clock.tick")]),
            )
            .unwrap();
        registry.register(registration("quiet")).unwrap();

        let summaries = registry.describe();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].functions, vec!["ping"]);

        let events = registry.automation_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "clock");
        assert_eq!(events[0].1.name, "clock.tick");
    }
}
