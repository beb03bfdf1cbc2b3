//! In-memory object store

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::RwLock;

use super::{validate_key, ObjectStore};
use crate::error::StorageError;

/// Objects kept in a sorted map
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned(key: &str) -> StorageError {
        StorageError::Backend {
            key: key.to_string(),
            message: "memory store lock poisoned".to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn location(&self, key: &str) -> String {
        format!("memory://{}", key)
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), StorageError> {
        validate_key(key)?;
        let mut objects = self.objects.write().map_err(|_| Self::poisoned(key))?;
        objects.insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        validate_key(key)?;
        let objects = self.objects.read().map_err(|_| Self::poisoned(key))?;
        Ok(objects.get(key).cloned())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        validate_key(key)?;
        let objects = self.objects.read().map_err(|_| Self::poisoned(key))?;
        Ok(objects.contains_key(key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let objects = self.objects.read().map_err(|_| Self::poisoned(prefix))?;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_list() {
        let store = MemoryObjectStore::new();
        store.put("raw/a/1", b"one".to_vec()).await.unwrap();
        store.put("raw/a/2", b"two".to_vec()).await.unwrap();
        store.put("raw/b/1", b"three".to_vec()).await.unwrap();

        assert_eq!(store.get("raw/a/1").await.unwrap().unwrap(), b"one");
        assert!(store.get("raw/a/3").await.unwrap().is_none());
        assert!(store.exists("raw/b/1").await.unwrap());
        assert_eq!(store.list("raw/a/").await.unwrap(), vec!["raw/a/1", "raw/a/2"]);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_rejects_invalid_keys() {
        let store = MemoryObjectStore::new();
        assert!(matches!(
            store.put("../x", vec![]).await,
            Err(StorageError::InvalidKey(_))
        ));
    }
}
