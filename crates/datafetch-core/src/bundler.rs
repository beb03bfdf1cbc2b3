//! Bundles: content, manifest and completion metadata for one run
//!
//! Storage layout under a stage root:
//!
//! ```text
//! <stage>/<data_source_id>/data/bundle_<uuid>/
//!   content/<manifest-key>
//!   _manifest.jsonl
//!   metadata/_failures.jsonl
//!   metadata/_completed.json
//! <stage>/<data_source_id>/bundle_hashes/_latest
//! ```
//!
//! Content is written as it arrives, the manifest after the pipeline drains,
//! then `_completed.json`. A bundle is only usable once that file says so.
//! `_latest` is moved last; failing to move it leaves a completed bundle and
//! only costs duplicate detection on the next run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use datafetch_common::checksum::bundle_hash;
use datafetch_common::types::{tagged_key, BundleStatus, ManifestEntry};

use crate::error::{LoaderError, StorageError};
use crate::loader::FetchedResource;
use crate::pipeline::{ResourceSink, WorkItem};
use crate::retry::RetryPolicy;
use crate::storage::ObjectStore;

pub const MANIFEST_FILE: &str = "_manifest.jsonl";
pub const COMPLETED_FILE: &str = "metadata/_completed.json";
pub const FAILURES_FILE: &str = "metadata/_failures.jsonl";
pub const LATEST_HASH_FILE: &str = "_latest";

/// Contents of `metadata/_completed.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMetadata {
    pub bid: Uuid,
    pub status: BundleStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub data_source_id: String,
    pub stage: String,
    pub run_id: String,
    pub resources_count: usize,
    pub failed_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_hash: Option<String>,
    #[serde(default)]
    pub duplicate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One line of `metadata/_failures.jsonl`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FailureRecord {
    pub key: String,
    pub address: String,
    pub kind: String,
    pub message: String,
    pub attempts: u32,
}

/// Result of [`Bundle::finish`]
#[derive(Debug, Clone, PartialEq)]
pub struct BundleOutcome {
    pub bid: Uuid,
    pub status: BundleStatus,
    /// Storage location of the bundle directory
    pub location: String,
    pub resources_count: usize,
    pub failed_count: usize,
    pub bundle_hash: String,
    /// Identifiers to commit, per state prefix
    pub processed: BTreeMap<String, Vec<String>>,
    /// Set when the bundle completed but `_latest` could not be moved to it
    pub latest_error: Option<String>,
}

/// Opens bundles under one stage
#[derive(Clone)]
pub struct Bundler {
    store: Arc<dyn ObjectStore>,
    stage: String,
    retry: RetryPolicy,
}

impl Bundler {
    pub fn new(store: Arc<dyn ObjectStore>, stage: impl Into<String>) -> Self {
        Self {
            store,
            stage: stage.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Key of the bundle-hash pointer for a data source
    pub fn latest_key(&self, data_source_id: &str) -> String {
        format!(
            "{}/{}/bundle_hashes/{}",
            self.stage, data_source_id, LATEST_HASH_FILE
        )
    }

    /// Root key of a bundle
    pub fn bundle_root(&self, data_source_id: &str, bid: &Uuid) -> String {
        format!("{}/{}/data/bundle_{}", self.stage, data_source_id, bid)
    }

    /// Start a new pending bundle
    pub fn open(&self, data_source_id: &str, run_id: &str) -> Bundle {
        let bid = Uuid::new_v4();
        let root = self.bundle_root(data_source_id, &bid);
        info!(%bid, data_source_id, root = %root, "Opened bundle");

        Bundle {
            bid,
            data_source_id: data_source_id.to_string(),
            stage: self.stage.clone(),
            run_id: run_id.to_string(),
            created_at: Utc::now(),
            root,
            latest_key: self.latest_key(data_source_id),
            store: Arc::clone(&self.store),
            retry: self.retry,
            accumulator: Mutex::new(Accumulator::default()),
        }
    }
}

#[derive(Debug, Default)]
struct Accumulator {
    keys: HashSet<String>,
    /// Every proper prefix of a claimed key, i.e. the directories it implies
    dirs: HashSet<String>,
    entries: Vec<ManifestEntry>,
    failures: Vec<FailureRecord>,
    processed: BTreeMap<String, Vec<String>>,
}

impl Accumulator {
    /// Byte offset in `key` where it clashes with a claimed key: an equal key,
    /// a key below it, or a key that sits where one of its directories goes
    fn conflict(&self, key: &str) -> Option<usize> {
        if self.keys.contains(key) || self.dirs.contains(key) {
            return Some(key.len());
        }
        key.match_indices('/')
            .map(|(at, _)| at)
            .find(|at| self.keys.contains(&key[..*at]))
    }

    /// Claim a key for `address`, tagging the clashing segment with a hash
    /// of the address until nothing clashes
    fn reserve_key(&mut self, base: String, address: &str) -> String {
        let mut key = base;
        let mut round = 0u32;
        while let Some(at) = self.conflict(&key) {
            let salt = if round == 0 {
                address.to_string()
            } else {
                format!("{}#{}", address, round)
            };
            key = format!("{}{}", tagged_key(&key[..at], &salt), &key[at..]);
            round += 1;
        }

        for (at, _) in key.match_indices('/') {
            self.dirs.insert(key[..at].to_string());
        }
        self.keys.insert(key.clone());
        key
    }
}

/// A pending bundle; workers add to it concurrently
pub struct Bundle {
    bid: Uuid,
    data_source_id: String,
    stage: String,
    run_id: String,
    created_at: DateTime<Utc>,
    root: String,
    latest_key: String,
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    accumulator: Mutex<Accumulator>,
}

impl std::fmt::Debug for Bundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bundle")
            .field("bid", &self.bid)
            .field("data_source_id", &self.data_source_id)
            .field("root", &self.root)
            .finish()
    }
}

fn jsonl<T: Serialize>(key: &str, records: &[T]) -> Result<Vec<u8>, StorageError> {
    let mut out = Vec::new();
    for record in records {
        serde_json::to_writer(&mut out, record).map_err(|e| StorageError::Encoding {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        out.push(b'\n');
    }
    Ok(out)
}

impl Bundle {
    pub fn bid(&self) -> Uuid {
        self.bid
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn location(&self) -> String {
        self.store.location(&self.root)
    }

    fn key(&self, relative: &str) -> String {
        format!("{}/{}", self.root, relative)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Accumulator> {
        self.accumulator.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn write(&self, key: &str, data: Vec<u8>) -> Result<(), StorageError> {
        let store = &self.store;
        let data = &data;
        self.retry
            .run("bundle_write", move || async move {
                store.put(key, data.clone()).await
            })
            .await
    }

    /// Store one fetched resource under its manifest key
    pub async fn add(&self, item: &WorkItem, resource: FetchedResource) -> Result<(), StorageError> {
        let key = self
            .lock()
            .reserve_key(resource.descriptor.manifest_key(), &resource.descriptor.address);

        self.write(&self.key(&format!("content/{}", key)), resource.content)
            .await?;
        debug!(bid = %self.bid, key = %key, size = resource.size, "Stored resource");

        let mut acc = self.lock();
        acc.entries.push(ManifestEntry {
            key,
            size: resource.size,
            hash: resource.hash,
        });
        if let Some(prefix) = &item.state_prefix {
            acc.processed
                .entry(prefix.clone())
                .or_default()
                .push(resource.descriptor.address);
        }
        Ok(())
    }

    /// Record a resource that could not be fetched
    pub fn record_failure(&self, item: &WorkItem, error: &LoaderError) {
        self.lock().failures.push(FailureRecord {
            key: item.descriptor.manifest_key(),
            address: item.descriptor.address.clone(),
            kind: error.kind.to_string(),
            message: error.message.clone(),
            attempts: error.attempts,
        });
    }

    /// Manifest entries so far, sorted by key
    pub fn manifest(&self) -> Vec<ManifestEntry> {
        let mut entries = self.lock().entries.clone();
        entries.sort();
        entries
    }

    fn metadata(&self, status: BundleStatus, resources_count: usize, failed_count: usize) -> CompletionMetadata {
        CompletionMetadata {
            bid: self.bid,
            status,
            created_at: self.created_at,
            completed_at: Utc::now(),
            data_source_id: self.data_source_id.clone(),
            stage: self.stage.clone(),
            run_id: self.run_id.clone(),
            resources_count,
            failed_count,
            bundle_hash: None,
            duplicate: false,
            error: None,
        }
    }

    async fn write_metadata(&self, metadata: &CompletionMetadata) -> Result<(), StorageError> {
        let key = self.key(COMPLETED_FILE);
        let body = serde_json::to_vec_pretty(metadata).map_err(|e| StorageError::Encoding {
            key: key.clone(),
            message: e.to_string(),
        })?;
        self.write(&key, body).await
    }

    async fn write_failures(&self, failures: &[FailureRecord]) -> Result<(), StorageError> {
        if failures.is_empty() {
            return Ok(());
        }
        let key = self.key(FAILURES_FILE);
        let body = jsonl(&key, failures)?;
        self.write(&key, body).await
    }

    fn drain(&self) -> (Vec<ManifestEntry>, Vec<FailureRecord>, BTreeMap<String, Vec<String>>) {
        let mut acc = self.lock();
        let mut entries = std::mem::take(&mut acc.entries);
        let mut failures = std::mem::take(&mut acc.failures);
        let mut processed = std::mem::take(&mut acc.processed);
        entries.sort();
        failures.sort();
        for ids in processed.values_mut() {
            ids.sort();
            ids.dedup();
        }
        (entries, failures, processed)
    }

    /// Seal the bundle after the pipeline completed.
    ///
    /// Writes the manifest and the failure record, compares the bundle hash
    /// with `_latest` and writes the completion metadata. An equal hash, or an
    /// empty bundle, marks the bundle a duplicate and leaves `_latest` alone;
    /// otherwise `_latest` is moved to this bundle. A failed move is reported
    /// in [`BundleOutcome::latest_error`] instead of failing a bundle that
    /// already says it is completed.
    #[instrument(skip(self), fields(bid = %self.bid, data_source_id = %self.data_source_id))]
    pub async fn finish(&self) -> Result<BundleOutcome, StorageError> {
        let (entries, failures, processed) = self.drain();

        let manifest_key = self.key(MANIFEST_FILE);
        let manifest = jsonl(&manifest_key, &entries)?;
        self.write(&manifest_key, manifest).await?;
        self.write_failures(&failures).await?;

        let hash = bundle_hash(entries.iter().map(|e| e.hash.as_str()));
        let previous = self
            .store
            .get(&self.latest_key)
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string());
        let duplicate = entries.is_empty() || previous.as_deref() == Some(hash.as_str());

        let status = if duplicate {
            BundleStatus::Duplicate
        } else {
            BundleStatus::Completed
        };

        let mut metadata = self.metadata(status, entries.len(), failures.len());
        metadata.bundle_hash = Some(hash.clone());
        metadata.duplicate = duplicate;
        self.write_metadata(&metadata).await?;

        if duplicate {
            info!(
                resources = entries.len(),
                bundle_hash = %hash,
                "Bundle matches the latest published bundle, flagged duplicate"
            );
        } else {
            info!(
                resources = entries.len(),
                failed = failures.len(),
                bundle_hash = %hash,
                "Bundle completed"
            );
        }

        let mut latest_error = None;
        if !duplicate {
            if let Err(e) = self.write(&self.latest_key, hash.clone().into_bytes()).await {
                warn!(key = %self.latest_key, error = %e, "Bundle completed but _latest was not updated");
                latest_error = Some(e.to_string());
            }
        }

        Ok(BundleOutcome {
            bid: self.bid,
            status,
            location: self.location(),
            resources_count: entries.len(),
            failed_count: failures.len(),
            bundle_hash: hash,
            processed,
            latest_error,
        })
    }

    /// Mark the bundle failed; whatever content was written stays unreferenced
    #[instrument(skip(self), fields(bid = %self.bid))]
    pub async fn mark_failed(&self, reason: &str) -> Result<(), StorageError> {
        let (entries, failures, _) = self.drain();
        self.write_failures(&failures).await?;

        let mut metadata = self.metadata(BundleStatus::Failed, entries.len(), failures.len());
        metadata.error = Some(reason.to_string());
        self.write_metadata(&metadata).await?;

        warn!(reason, "Bundle marked failed");
        Ok(())
    }
}

#[async_trait]
impl ResourceSink for Bundle {
    async fn accept(&self, item: &WorkItem, resource: FetchedResource) -> Result<(), StorageError> {
        self.add(item, resource).await
    }

    fn reject(&self, item: &WorkItem, error: &LoaderError) {
        self.record_failure(item, error);
    }
}
