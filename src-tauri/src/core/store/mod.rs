//! Scoped Configuration Store
//!
//! Flat key/value configuration partitioned by scope (one scope per plugin).
//! Bridges only ever see the scope of the plugin that owns them.
//!
//! Storage location for the file-backed store: {app_data_dir}/config.json

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use specta::Type;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::core::fs::{atomic_write_json_pretty, validate_path_id_component};
use crate::core::{CoreError, CoreResult};

/// Config file schema version
pub const CONFIG_VERSION: u32 = 1;

/// Config file name
pub const CONFIG_FILE: &str = "config.json";

const CHANGE_CAPACITY: usize = 128;

/// A value written or removed in some scope. `value` is `None` on removal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct ConfigChange {
    pub scope: String,
    pub key: String,
    pub value: Option<Value>,
}

/// Key/value store partitioned by scope.
pub trait ConfigStore: Send + Sync {
    fn get(&self, scope: &str, key: &str) -> CoreResult<Option<Value>>;

    fn set(&self, scope: &str, key: &str, value: Value) -> CoreResult<()>;

    /// Returns the removed value, if any.
    fn remove(&self, scope: &str, key: &str) -> CoreResult<Option<Value>>;

    /// Writes each default whose key is absent. Returns how many were written.
    fn ensure_defaults(&self, scope: &str, defaults: &Map<String, Value>) -> CoreResult<usize>;

    /// Snapshot of one scope.
    fn scope(&self, scope: &str) -> CoreResult<Map<String, Value>>;

    fn watch(&self) -> broadcast::Receiver<ConfigChange>;
}

fn validate_scope_key(scope: &str, key: &str) -> CoreResult<()> {
    validate_path_id_component(scope, "scope").map_err(CoreError::Config)?;
    if key.trim().is_empty() {
        return Err(CoreError::Config("Config key cannot be empty".to_string()));
    }
    Ok(())
}

// =============================================================================
// Scope Table
// =============================================================================

/// On-disk and in-memory layout shared by both stores.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct ScopeTable {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    scopes: BTreeMap<String, Map<String, Value>>,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

impl ScopeTable {
    fn get(&self, scope: &str, key: &str) -> Option<Value> {
        self.scopes.get(scope).and_then(|s| s.get(key)).cloned()
    }

    fn set(&mut self, scope: &str, key: &str, value: Value) {
        self.scopes
            .entry(scope.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    fn remove(&mut self, scope: &str, key: &str) -> Option<Value> {
        let values = self.scopes.get_mut(scope)?;
        let removed = values.remove(key);
        if values.is_empty() {
            self.scopes.remove(scope);
        }
        removed
    }

    fn ensure_defaults(&mut self, scope: &str, defaults: &Map<String, Value>) -> Vec<(String, Value)> {
        let values = self.scopes.entry(scope.to_string()).or_default();
        let mut written = Vec::new();
        for (key, value) in defaults {
            if !values.contains_key(key) {
                values.insert(key.clone(), value.clone());
                written.push((key.clone(), value.clone()));
            }
        }
        if values.is_empty() {
            self.scopes.remove(scope);
        }
        written
    }

    fn scope(&self, scope: &str) -> Map<String, Value> {
        self.scopes.get(scope).cloned().unwrap_or_default()
    }
}

fn notify(tx: &broadcast::Sender<ConfigChange>, scope: &str, key: &str, value: Option<Value>) {
    // No receivers is fine.
    let _ = tx.send(ConfigChange {
        scope: scope.to_string(),
        key: key.to_string(),
        value,
    });
}

// =============================================================================
// Memory Store
// =============================================================================

/// Non-persistent store used headless and in tests.
pub struct MemoryConfigStore {
    table: RwLock<ScopeTable>,
    changes: broadcast::Sender<ConfigChange>,
}

impl Default for MemoryConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            table: RwLock::new(ScopeTable::default()),
            changes,
        }
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, scope: &str, key: &str) -> CoreResult<Option<Value>> {
        validate_scope_key(scope, key)?;
        Ok(self
            .table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(scope, key))
    }

    fn set(&self, scope: &str, key: &str, value: Value) -> CoreResult<()> {
        validate_scope_key(scope, key)?;
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set(scope, key, value.clone());
        notify(&self.changes, scope, key, Some(value));
        Ok(())
    }

    fn remove(&self, scope: &str, key: &str) -> CoreResult<Option<Value>> {
        validate_scope_key(scope, key)?;
        let removed = self
            .table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(scope, key);
        if removed.is_some() {
            notify(&self.changes, scope, key, None);
        }
        Ok(removed)
    }

    fn ensure_defaults(&self, scope: &str, defaults: &Map<String, Value>) -> CoreResult<usize> {
        validate_path_id_component(scope, "scope").map_err(CoreError::Config)?;
        let written = self
            .table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .ensure_defaults(scope, defaults);
        for (key, value) in &written {
            notify(&self.changes, scope, key, Some(value.clone()));
        }
        Ok(written.len())
    }

    fn scope(&self, scope: &str) -> CoreResult<Map<String, Value>> {
        Ok(self
            .table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .scope(scope))
    }

    fn watch(&self) -> broadcast::Receiver<ConfigChange> {
        self.changes.subscribe()
    }
}

// =============================================================================
// JSON File Store
// =============================================================================

/// File-backed store. Every mutation is persisted with an atomic write
/// under an advisory lock.
pub struct JsonConfigStore {
    path: PathBuf,
    table: RwLock<ScopeTable>,
    changes: broadcast::Sender<ConfigChange>,
}

impl JsonConfigStore {
    /// Opens the store at `{dir}/config.json`, creating it lazily on first
    /// write. An unreadable file is logged and replaced by an empty table.
    pub fn open(dir: &Path) -> CoreResult<Self> {
        let path = dir.join(CONFIG_FILE);
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        let store = Self {
            path,
            table: RwLock::new(ScopeTable::default()),
            changes,
        };

        let table = store.with_lock(false, || store.read_table())?;
        *store.table.write().unwrap_or_else(PoisonError::into_inner) = table;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| CONFIG_FILE.to_string());
        name.push_str(".lock");
        self.path.with_file_name(name)
    }

    fn with_lock<T>(&self, exclusive: bool, op: impl FnOnce() -> CoreResult<T>) -> CoreResult<T> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path())?;

        if exclusive {
            fs2::FileExt::lock_exclusive(&lock_file)
                .map_err(|e| CoreError::Config(format!("Failed to lock config file: {e}")))?;
        } else {
            fs2::FileExt::lock_shared(&lock_file)
                .map_err(|e| CoreError::Config(format!("Failed to lock config file: {e}")))?;
        }

        let result = op();

        if let Err(e) = fs2::FileExt::unlock(&lock_file) {
            warn!("Failed to unlock config lock file: {}", e);
        }

        result
    }

    fn read_table(&self) -> CoreResult<ScopeTable> {
        if !self.path.exists() {
            info!("Config file not found, starting empty");
            return Ok(ScopeTable::default());
        }
        let content = fs::read_to_string(&self.path)?;
        match serde_json::from_str::<ScopeTable>(&content) {
            Ok(mut table) => {
                if table.version < CONFIG_VERSION {
                    info!(
                        "Migrating config from version {} to {}",
                        table.version, CONFIG_VERSION
                    );
                    table.version = CONFIG_VERSION;
                }
                Ok(table)
            }
            Err(e) => {
                warn!("Failed to parse config file, starting empty: {}", e);
                Ok(ScopeTable::default())
            }
        }
    }

    /// Applies `mutate` to the cached table and persists it. The cache is
    /// only updated once the write succeeded.
    fn mutate<T>(&self, mutate: impl FnOnce(&mut ScopeTable) -> T) -> CoreResult<T> {
        self.with_lock(true, || {
            let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
            let mut next = table.clone();
            next.version = CONFIG_VERSION;
            let out = mutate(&mut next);
            atomic_write_json_pretty(&self.path, &next)?;
            *table = next;
            Ok(out)
        })
    }
}

impl ConfigStore for JsonConfigStore {
    fn get(&self, scope: &str, key: &str) -> CoreResult<Option<Value>> {
        validate_scope_key(scope, key)?;
        Ok(self
            .table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(scope, key))
    }

    fn set(&self, scope: &str, key: &str, value: Value) -> CoreResult<()> {
        validate_scope_key(scope, key)?;
        let stored = value.clone();
        self.mutate(|table| table.set(scope, key, stored))?;
        notify(&self.changes, scope, key, Some(value));
        Ok(())
    }

    fn remove(&self, scope: &str, key: &str) -> CoreResult<Option<Value>> {
        validate_scope_key(scope, key)?;
        if self.get(scope, key)?.is_none() {
            return Ok(None);
        }
        let removed = self.mutate(|table| table.remove(scope, key))?;
        if removed.is_some() {
            notify(&self.changes, scope, key, None);
        }
        Ok(removed)
    }

    fn ensure_defaults(&self, scope: &str, defaults: &Map<String, Value>) -> CoreResult<usize> {
        validate_path_id_component(scope, "scope").map_err(CoreError::Config)?;
        let missing = {
            let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
            defaults.keys().any(|k| table.get(scope, k).is_none())
        };
        if !missing {
            return Ok(0);
        }
        let written = self.mutate(|table| table.ensure_defaults(scope, defaults))?;
        for (key, value) in &written {
            notify(&self.changes, scope, key, Some(value.clone()));
        }
        Ok(written.len())
    }

    fn scope(&self, scope: &str) -> CoreResult<Map<String, Value>> {
        Ok(self
            .table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .scope(scope))
    }

    fn watch(&self) -> broadcast::Receiver<ConfigChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn defaults() -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("format".into(), json!("24h"));
        map.insert("showSeconds".into(), json!(false));
        map
    }

    // ============================================================
    // Memory Store Tests
    // ============================================================

    #[test]
    fn test_scopes_are_isolated() {
        let store = MemoryConfigStore::new();
        store.set("clock", "format", json!("12h")).unwrap();
        store.set("weather", "format", json!("metric")).unwrap();

        assert_eq!(store.get("clock", "format").unwrap(), Some(json!("12h")));
        assert_eq!(store.get("weather", "format").unwrap(), Some(json!("metric")));
        assert_eq!(store.get("other", "format").unwrap(), None);
        assert_eq!(store.scope("clock").unwrap().len(), 1);
    }

    #[test]
    fn test_ensure_defaults_keeps_existing_values() {
        let store = MemoryConfigStore::new();
        store.set("clock", "format", json!("12h")).unwrap();

        let written = store.ensure_defaults("clock", &defaults()).unwrap();
        assert_eq!(written, 1);
        assert_eq!(store.get("clock", "format").unwrap(), Some(json!("12h")));
        assert_eq!(store.get("clock", "showSeconds").unwrap(), Some(json!(false)));

        assert_eq!(store.ensure_defaults("clock", &defaults()).unwrap(), 0);
    }

    #[test]
    fn test_change_notifications() {
        let store = MemoryConfigStore::new();
        let mut rx = store.watch();

        store.set("clock", "format", json!("12h")).unwrap();
        store.remove("clock", "format").unwrap();
        store.remove("clock", "format").unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.scope, "clock");
        assert_eq!(first.value, Some(json!("12h")));
        let second = rx.try_recv().unwrap();
        assert_eq!(second.value, None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_invalid_scope_and_key_rejected() {
        let store = MemoryConfigStore::new();
        assert!(matches!(
            store.set("../etc", "k", json!(1)),
            Err(CoreError::Config(_))
        ));
        assert!(matches!(
            store.set("clock", " ", json!(1)),
            Err(CoreError::Config(_))
        ));
    }

    // ============================================================
    // JSON Store Tests
    // ============================================================

    #[test]
    fn test_json_store_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = JsonConfigStore::open(temp_dir.path()).unwrap();
            store.set("clock", "format", json!("12h")).unwrap();
            store.ensure_defaults("clock", &defaults()).unwrap();
            assert!(store.path().exists());
        }

        let reopened = JsonConfigStore::open(temp_dir.path()).unwrap();
        assert_eq!(reopened.get("clock", "format").unwrap(), Some(json!("12h")));
        assert_eq!(
            reopened.get("clock", "showSeconds").unwrap(),
            Some(json!(false))
        );
    }

    #[test]
    fn test_json_store_file_layout() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonConfigStore::open(temp_dir.path()).unwrap();
        store.set("clock", "format", json!("24h")).unwrap();

        let raw: Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["version"], json!(CONFIG_VERSION));
        assert_eq!(raw["scopes"]["clock"]["format"], json!("24h"));
    }

    #[test]
    fn test_json_store_corrupt_file_starts_empty() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(CONFIG_FILE), "{ not json").unwrap();

        let store = JsonConfigStore::open(temp_dir.path()).unwrap();
        assert!(store.scope("clock").unwrap().is_empty());
        store.set("clock", "format", json!("12h")).unwrap();
        assert_eq!(store.get("clock", "format").unwrap(), Some(json!("12h")));
    }

    #[test]
    fn test_json_store_remove_persists() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonConfigStore::open(temp_dir.path()).unwrap();
        store.set("clock", "format", json!("12h")).unwrap();
        assert_eq!(store.remove("clock", "format").unwrap(), Some(json!("12h")));
        assert_eq!(store.remove("clock", "format").unwrap(), None);

        let reopened = JsonConfigStore::open(temp_dir.path()).unwrap();
        assert_eq!(reopened.get("clock", "format").unwrap(), None);
    }
}
