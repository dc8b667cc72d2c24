//! Key/value storage capability.
//!
//! Extensions see a [`KeyValueStorage`] already scoped to their own namespace.
//! Backends implement [`StorageBackend`] once for all namespaces.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::Result;

/// Storage API seen by an extension.
#[async_trait::async_trait]
pub trait KeyValueStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All keys, sorted.
    async fn keys(&self) -> Result<Vec<String>>;
}

/// Namespaced storage shared by every extension of a host application.
pub trait StorageBackend: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>>;

    fn set(&self, namespace: &str, key: &str, value: &Value) -> Result<()>;

    fn delete(&self, namespace: &str, key: &str) -> Result<bool>;

    fn keys(&self, namespace: &str) -> Result<Vec<String>>;
}

/// A backend bound to one namespace.
pub struct ScopedStorage<B: ?Sized> {
    backend: Arc<B>,
    namespace: String,
}

impl<B: StorageBackend + ?Sized> ScopedStorage<B> {
    pub fn new(backend: Arc<B>, namespace: impl Into<String>) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[async_trait::async_trait]
impl<B: StorageBackend + ?Sized> KeyValueStorage for ScopedStorage<B> {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.backend.get(&self.namespace, key)
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.backend.set(&self.namespace, key, &value)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.backend.delete(&self.namespace, key)
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.backend.keys(&self.namespace)
    }
}

/// In-memory backend. Contents are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .data
            .read()
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned())
    }

    fn set(&self, namespace: &str, key: &str, value: &Value) -> Result<()> {
        self.data
            .write()
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        Ok(self
            .data
            .write()
            .get_mut(namespace)
            .map(|ns| ns.remove(key).is_some())
            .unwrap_or(false))
    }

    fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        Ok(self
            .data
            .read()
            .get(namespace)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let backend = Arc::new(MemoryBackend::new());
        let tasks = ScopedStorage::new(backend.clone(), "tasks");
        let timer = ScopedStorage::new(backend.clone(), "timer");

        tasks.set("items", json!([1, 2])).await.unwrap();
        timer.set("items", json!([])).await.unwrap();

        assert_eq!(tasks.get("items").await.unwrap(), Some(json!([1, 2])));
        assert_eq!(timer.get("items").await.unwrap(), Some(json!([])));
        assert_eq!(tasks.keys().await.unwrap(), vec!["items".to_string()]);
    }

    #[tokio::test]
    async fn test_delete() {
        let storage = ScopedStorage::new(Arc::new(MemoryBackend::new()), "demo");
        storage.set("a", json!(1)).await.unwrap();
        assert!(storage.delete("a").await.unwrap());
        assert!(!storage.delete("a").await.unwrap());
        assert_eq!(storage.get("a").await.unwrap(), None);
    }
}
