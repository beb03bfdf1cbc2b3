//! Small JSON records addressed by key

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::storage::ObjectStore;

/// Get/put of small JSON records
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;

    async fn put(&self, key: &str, value: &Value) -> Result<(), StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }
}

fn prefixed(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}:{}", prefix, key)
    }
}

/// Records held in process memory
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    prefix: String,
    records: RwLock<HashMap<String, Value>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            records: RwLock::default(),
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.records.read().await.get(&prefixed(&self.prefix, key)).cloned())
    }

    async fn put(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        self.records
            .write()
            .await
            .insert(prefixed(&self.prefix, key), value.clone());
        Ok(())
    }
}

/// Records stored as JSON documents in an [`ObjectStore`].
///
/// `:` in keys becomes a path separator, so `fetcher:state:us_fl` lives at
/// `<prefix>/fetcher/state/us_fl.json`.
#[derive(Clone)]
pub struct ObjectKeyValueStore {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ObjectKeyValueStore {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    pub fn object_key(&self, key: &str) -> String {
        let path = key.replace(':', "/");
        if self.prefix.is_empty() {
            format!("{}.json", path)
        } else {
            format!("{}/{}.json", self.prefix, path)
        }
    }
}

#[async_trait]
impl KeyValueStore for ObjectKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let object_key = self.object_key(key);
        match self.store.get(&object_key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StorageError::Encoding {
                    key: object_key,
                    message: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        let object_key = self.object_key(key);
        let bytes = serde_json::to_vec_pretty(value).map_err(|e| StorageError::Encoding {
            key: object_key.clone(),
            message: e.to_string(),
        })?;
        self.store.put(&object_key, bytes).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.store.exists(&self.object_key(key)).await
    }
}
