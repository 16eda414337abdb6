//! Generic persisted map used for pairings, sessions and proposals

use super::KeyValueStorage;
use crate::errors::{EngineError, EngineResult, StorageError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// A `HashMap` mirrored into [`KeyValueStorage`] after every mutation
///
/// The map lock is held across the storage write, so concurrent
/// read-modify-write sequences cannot lose updates.
pub struct Store<K, V> {
    name: &'static str,
    storage: Arc<dyn KeyValueStorage>,
    storage_key: String,
    entries: Mutex<HashMap<K, V>>,
}

impl<K, V> Store<K, V>
where
    K: Eq + Hash + Clone + Display + Serialize + DeserializeOwned + Send + Sync,
    V: Clone + Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(name: &'static str, storage: Arc<dyn KeyValueStorage>, storage_key: String) -> Self {
        Self {
            name,
            storage,
            storage_key,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Load persisted entries. Fails if the in-memory map already has entries.
    pub async fn restore(&self) -> EngineResult<()> {
        let mut entries = self.entries.lock().await;
        if !entries.is_empty() {
            return Err(EngineError::RestoreWillOverride(format!(
                "{} already holds {} entries",
                self.name,
                entries.len()
            )));
        }

        if let Some(value) = self.storage.get_item(&self.storage_key).await? {
            let persisted: Vec<(K, V)> =
                serde_json::from_value(value).map_err(|e| StorageError::Corrupt {
                    key: self.storage_key.clone(),
                    reason: e.to_string(),
                })?;
            entries.extend(persisted);
        }

        debug!(store = self.name, count = entries.len(), "store restored");
        Ok(())
    }

    pub async fn set(&self, key: K, value: V) -> EngineResult<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(key, value);
        self.persist(&entries).await
    }

    pub async fn get(&self, key: &K) -> EngineResult<V> {
        self.entries
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::NoMatchingKey(format!("{}: {}", self.name, key)))
    }

    pub async fn try_get(&self, key: &K) -> Option<V> {
        self.entries.lock().await.get(key).cloned()
    }

    pub async fn contains(&self, key: &K) -> bool {
        self.entries.lock().await.contains_key(key)
    }

    /// Mutate an entry in place and return the updated value
    pub async fn update<F>(&self, key: &K, f: F) -> EngineResult<V>
    where
        F: FnOnce(&mut V),
    {
        let mut entries = self.entries.lock().await;
        let value = entries
            .get_mut(key)
            .ok_or_else(|| EngineError::NoMatchingKey(format!("{}: {}", self.name, key)))?;
        f(value);
        let updated = value.clone();
        self.persist(&entries).await?;
        Ok(updated)
    }

    /// Remove an entry; absent keys are a no-op
    pub async fn delete(&self, key: &K) -> EngineResult<Option<V>> {
        let mut entries = self.entries.lock().await;
        let removed = entries.remove(key);
        if removed.is_some() {
            self.persist(&entries).await?;
        }
        Ok(removed)
    }

    pub async fn values(&self) -> Vec<V> {
        self.entries.lock().await.values().cloned().collect()
    }

    pub async fn keys(&self) -> Vec<K> {
        self.entries.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    async fn persist(&self, entries: &HashMap<K, V>) -> EngineResult<()> {
        let snapshot: Vec<(&K, &V)> = entries.iter().collect();
        let value = serde_json::to_value(&snapshot)?;
        self.storage.set_item(&self.storage_key, value).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_store::MemoryStorage;

    fn store(storage: &MemoryStorage) -> Store<u64, String> {
        Store::new("proposals", Arc::new(storage.clone()), "test//proposals".into())
    }

    #[tokio::test]
    async fn test_get_missing_is_no_matching_key() {
        let storage = MemoryStorage::new();
        let s = store(&storage);
        assert!(matches!(s.get(&7).await, Err(EngineError::NoMatchingKey(_))));
    }

    #[tokio::test]
    async fn test_persist_and_restore() {
        let storage = MemoryStorage::new();
        let s = store(&storage);
        s.set(1, "one".into()).await.unwrap();
        s.set(2, "two".into()).await.unwrap();
        s.delete(&1).await.unwrap();

        let restored = store(&storage);
        restored.restore().await.unwrap();
        assert_eq!(restored.len().await, 1);
        assert_eq!(restored.get(&2).await.unwrap(), "two");
    }

    #[tokio::test]
    async fn test_restore_into_non_empty_fails() {
        let storage = MemoryStorage::new();
        let s = store(&storage);
        s.set(1, "one".into()).await.unwrap();
        assert!(matches!(
            s.restore().await,
            Err(EngineError::RestoreWillOverride(_))
        ));
    }

    #[tokio::test]
    async fn test_update_and_delete_absent() {
        let storage = MemoryStorage::new();
        let s = store(&storage);
        s.set(1, "one".into()).await.unwrap();
        let updated = s.update(&1, |v| v.push('!')).await.unwrap();
        assert_eq!(updated, "one!");
        assert!(s.update(&9, |_| {}).await.is_err());
        assert_eq!(s.delete(&9).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_value_surfaces_storage_error() {
        let storage = MemoryStorage::new();
        storage
            .set_item("test//proposals", serde_json::json!({"not": "a list"}))
            .await
            .unwrap();
        let s = store(&storage);
        assert!(matches!(
            s.restore().await,
            Err(EngineError::Storage(StorageError::Corrupt { .. }))
        ));
    }
}
