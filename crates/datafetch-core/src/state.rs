//! Incremental state: which resources each prefix has already processed
//!
//! The tracker is read once before fetching starts and written once after the
//! bundle is durable. Workers only ever see the immutable [`StateSnapshot`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::error::StateStoreError;
use crate::kv::KeyValueStore;
use crate::retry::RetryPolicy;

/// Stored form of one prefix's state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    #[serde(default)]
    pub processed: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<chrono::DateTime<Utc>>,
}

/// Processed identifiers per prefix, captured before a run
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    sets: HashMap<String, HashSet<String>>,
}

impl StateSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, prefix: impl Into<String>, ids: HashSet<String>) {
        self.sets.insert(prefix.into(), ids);
    }

    /// Whether `id` was already processed under `prefix`
    pub fn contains(&self, prefix: &str, id: &str) -> bool {
        self.sets.get(prefix).is_some_and(|ids| ids.contains(id))
    }

    pub fn len(&self, prefix: &str) -> usize {
        self.sets.get(prefix).map(HashSet::len).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.values().all(HashSet::is_empty)
    }
}

/// Reads and merges per-prefix state records
#[derive(Clone)]
pub struct StateTracker {
    kv: Arc<dyn KeyValueStore>,
    retry: RetryPolicy,
}

impl StateTracker {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Key holding the record for `prefix`
    pub fn state_key(prefix: &str) -> String {
        format!("fetcher:state:{}", prefix)
    }

    async fn read_record(&self, prefix: &str) -> Result<StateRecord, StateStoreError> {
        let value = self
            .kv
            .get(&Self::state_key(prefix))
            .await
            .map_err(|e| StateStoreError::Read {
                prefix: prefix.to_string(),
                message: e.to_string(),
            })?;

        match value {
            Some(value) => serde_json::from_value(value).map_err(|e| StateStoreError::Corrupt {
                prefix: prefix.to_string(),
                message: e.to_string(),
            }),
            None => Ok(StateRecord::default()),
        }
    }

    /// Identifiers already processed under `prefix`; a missing record is empty
    pub async fn snapshot(&self, prefix: &str) -> Result<HashSet<String>, StateStoreError> {
        let record = self.read_record(prefix).await?;
        debug!(prefix, processed = record.processed.len(), "Loaded state snapshot");
        Ok(record.processed.into_iter().collect())
    }

    /// Snapshot every prefix a data source uses
    #[instrument(skip(self, prefixes))]
    pub async fn snapshot_all<I, S>(&self, prefixes: I) -> Result<StateSnapshot, StateStoreError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut snapshot = StateSnapshot::new();
        for prefix in prefixes {
            let prefix = prefix.as_ref();
            let ids = self.snapshot(prefix).await?;
            snapshot.insert(prefix, ids);
        }
        Ok(snapshot)
    }

    /// Merge `new_ids` into the record for `prefix`; returns the merged size.
    ///
    /// Writes are retried with the tracker's policy.
    #[instrument(skip(self, new_ids), fields(new = new_ids.len()))]
    pub async fn commit(&self, prefix: &str, new_ids: &[String]) -> Result<usize, StateStoreError> {
        let key = Self::state_key(prefix);

        self.retry
            .run("state_commit", move || {
                let key = key.clone();
                async move {
                    let mut record = self.read_record(prefix).await.map_err(|e| StateStoreError::Write {
                        prefix: prefix.to_string(),
                        message: e.to_string(),
                    })?;
                    record.processed.extend(new_ids.iter().cloned());
                    record.updated_at = Some(Utc::now());

                    let value = serde_json::to_value(&record).map_err(|e| StateStoreError::Write {
                        prefix: prefix.to_string(),
                        message: e.to_string(),
                    })?;
                    self.kv.put(&key, &value).await.map_err(|e| StateStoreError::Write {
                        prefix: prefix.to_string(),
                        message: e.to_string(),
                    })?;

                    info!(prefix, total = record.processed.len(), "Committed state");
                    Ok(record.processed.len())
                }
            })
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::kv::MemoryKeyValueStore;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_missing_record_is_empty_snapshot() {
        let tracker = StateTracker::new(Arc::new(MemoryKeyValueStore::new()));
        assert!(tracker.snapshot("us_fl").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_merges_with_existing() {
        let kv = Arc::new(MemoryKeyValueStore::new());
        kv.put("fetcher:state:p", &json!({"processed": ["a", "b"]}))
            .await
            .unwrap();
        let tracker = StateTracker::new(kv.clone());

        let total = tracker
            .commit("p", &["b".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(total, 3);

        let snapshot = tracker.snapshot_all(["p", "q"]).await.unwrap();
        assert!(snapshot.contains("p", "a"));
        assert!(snapshot.contains("p", "c"));
        assert!(!snapshot.contains("q", "a"));
        assert_eq!(snapshot.len("p"), 3);
    }

    #[tokio::test]
    async fn test_corrupt_record_fails_read() {
        let kv = Arc::new(MemoryKeyValueStore::new());
        kv.put("fetcher:state:p", &json!({"processed": 7})).await.unwrap();
        let tracker = StateTracker::new(kv);
        assert!(matches!(
            tracker.snapshot("p").await,
            Err(StateStoreError::Corrupt { .. })
        ));
    }

    /// Fails every write until `failures` runs out
    struct FlakyStore {
        inner: MemoryKeyValueStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl KeyValueStore for FlakyStore {
        async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: &Value) -> Result<(), StorageError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(StorageError::Backend {
                    key: key.to_string(),
                    message: "unavailable".to_string(),
                });
            }
            self.inner.put(key, value).await
        }
    }

    #[tokio::test]
    async fn test_commit_retries_write_failures() {
        let kv = Arc::new(FlakyStore {
            inner: MemoryKeyValueStore::new(),
            failures: AtomicU32::new(2),
        });
        let tracker = StateTracker::new(kv.clone()).with_retry(RetryPolicy::immediate(3));
        assert_eq!(tracker.commit("p", &["x".to_string()]).await.unwrap(), 1);

        kv.failures.store(5, Ordering::SeqCst);
        let err = tracker.commit("p", &["y".to_string()]).await.unwrap_err();
        assert!(matches!(err, StateStoreError::Write { .. }));
    }
}
