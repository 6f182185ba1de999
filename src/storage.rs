//! Per-plugin key-value storage.
//!
//! Each loaded plugin gets an isolated namespace created at load and
//! destroyed at unload. A plugin can only reach its own namespace through
//! the scoped [`PluginStorage`] handle; there is no cross-plugin
//! enumeration.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

/// All plugin namespaces, owned by the runtime.
#[derive(Default)]
pub struct StorageRegistry {
    stores: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fresh, empty namespace for `plugin`, replacing any
    /// leftover state from a previous instance.
    pub fn create(&self, plugin: &str) {
        self.stores.write().insert(plugin.to_string(), HashMap::new());
    }

    /// Destroy a plugin's namespace.
    pub fn remove(&self, plugin: &str) {
        self.stores.write().remove(plugin);
    }

    pub fn get(&self, plugin: &str, key: &str) -> Option<Value> {
        self.stores.read().get(plugin).and_then(|s| s.get(key).cloned())
    }

    pub fn set(&self, plugin: &str, key: &str, value: Value) {
        self.stores
            .write()
            .entry(plugin.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn delete(&self, plugin: &str, key: &str) -> bool {
        self.stores.write().get_mut(plugin).map_or(false, |s| s.remove(key).is_some())
    }

    pub fn list(&self, plugin: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .stores
            .read()
            .get(plugin)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

/// Handle scoping storage access to one plugin's namespace.
#[derive(Clone)]
pub struct PluginStorage {
    registry: Arc<StorageRegistry>,
    plugin: String,
}

impl PluginStorage {
    pub fn new(registry: Arc<StorageRegistry>, plugin: impl Into<String>) -> Self {
        Self { registry, plugin: plugin.into() }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.registry.get(&self.plugin, key)
    }

    pub fn set(&self, key: &str, value: Value) {
        self.registry.set(&self.plugin, key, value);
    }

    pub fn delete(&self, key: &str) -> bool {
        self.registry.delete(&self.plugin, key)
    }

    pub fn list(&self) -> Vec<String> {
        self.registry.list(&self.plugin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scoped_get_set() {
        let registry = Arc::new(StorageRegistry::new());
        registry.create("a");
        registry.create("b");

        let store_a = PluginStorage::new(Arc::clone(&registry), "a");
        let store_b = PluginStorage::new(Arc::clone(&registry), "b");

        store_a.set("key", json!("from-a"));

        assert_eq!(store_a.get("key"), Some(json!("from-a")));
        assert_eq!(store_b.get("key"), None);
    }

    #[test]
    fn test_delete_and_list() {
        let registry = Arc::new(StorageRegistry::new());
        registry.create("a");
        let store = PluginStorage::new(Arc::clone(&registry), "a");

        store.set("x", json!(1));
        store.set("y", json!(2));
        assert_eq!(store.list(), vec!["x".to_string(), "y".to_string()]);

        assert!(store.delete("x"));
        assert!(!store.delete("x"));
        assert_eq!(store.list(), vec!["y".to_string()]);
    }

    #[test]
    fn test_remove_clears_namespace() {
        let registry = Arc::new(StorageRegistry::new());
        registry.create("a");
        let store = PluginStorage::new(Arc::clone(&registry), "a");
        store.set("key", json!(true));

        registry.remove("a");
        registry.create("a");

        // A recreated namespace starts empty: no carryover across reload.
        assert!(store.list().is_empty());
        assert_eq!(store.get("key"), None);
    }
}
