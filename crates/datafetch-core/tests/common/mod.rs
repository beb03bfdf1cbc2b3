//! Shared fixtures for end-to-end runs against in-memory collaborators
#![allow(dead_code, clippy::unwrap_used)]

use std::path::Path;
use std::sync::Arc;

use datafetch_common::types::ManifestEntry;
use datafetch_core::bundler::CompletionMetadata;
use datafetch_core::config::DirConfigSource;
use datafetch_core::credentials::{SecretValue, StaticCredentialsProvider};
use datafetch_core::kv::{KeyValueStore, MemoryKeyValueStore};
use datafetch_core::publisher::{MemoryQueue, MessageQueue};
use datafetch_core::registry::StrategyRegistry;
use datafetch_core::retry::RetryPolicy;
use datafetch_core::runner::{FetchRunner, Services};
use datafetch_core::sftp::{MemoryRemoteFileSystem, MemorySftpConnector};
use datafetch_core::storage::{MemoryObjectStore, ObjectStore};
use tempfile::TempDir;

pub const STAGE: &str = "raw";

/// Config directory plus in-memory services for one data source
pub struct Harness {
    pub config_dir: TempDir,
    pub store: Arc<MemoryObjectStore>,
    pub state: Arc<dyn KeyValueStore>,
    pub queue: Arc<MemoryQueue>,
    pub remote: MemoryRemoteFileSystem,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            config_dir: tempfile::tempdir().unwrap(),
            store: Arc::new(MemoryObjectStore::new()),
            state: Arc::new(MemoryKeyValueStore::new()),
            queue: Arc::new(MemoryQueue::new()),
            remote: MemoryRemoteFileSystem::new(),
        }
    }

    pub fn with_remote(mut self, remote: MemoryRemoteFileSystem) -> Self {
        self.remote = remote;
        self
    }

    pub fn with_state(mut self, state: Arc<dyn KeyValueStore>) -> Self {
        self.state = state;
        self
    }

    pub fn write(&self, relative: &str, content: &str) {
        write_file(self.config_dir.path(), relative, content);
    }

    pub fn services(&self, queue: Arc<dyn MessageQueue>) -> Services {
        let credentials = StaticCredentialsProvider::new().with_secret(
            "us_fl-sftp-credentials",
            SecretValue::new([
                ("host", "sftp.example.org"),
                ("username", "fetcher"),
                ("password", "secret"),
                ("port", "22"),
            ]),
        );

        Services {
            config_source: Arc::new(DirConfigSource::new(self.config_dir.path())),
            store: self.store.clone(),
            state_store: Arc::clone(&self.state),
            credentials: Arc::new(credentials),
            sftp: Arc::new(MemorySftpConnector::new(self.remote.clone())),
            queue,
        }
    }

    pub fn runner(&self) -> FetchRunner {
        self.runner_with_queue(self.queue.clone())
    }

    pub fn runner_with_queue(&self, queue: Arc<dyn MessageQueue>) -> FetchRunner {
        FetchRunner::new(self.services(queue), StrategyRegistry::with_defaults(), STAGE)
            .with_retry(RetryPolicy::immediate(1))
    }

    pub async fn text(&self, key: &str) -> String {
        let bytes = self
            .store
            .get(key)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("missing object {}", key));
        String::from_utf8(bytes).unwrap()
    }

    /// Root keys of every bundle written for `data_source_id`, sorted
    pub async fn bundle_roots(&self, data_source_id: &str) -> Vec<String> {
        let prefix = format!("{}/{}/data/", STAGE, data_source_id);
        let mut roots: Vec<String> = self
            .store
            .list(&prefix)
            .await
            .unwrap()
            .into_iter()
            .filter_map(|key| {
                let rest = key.strip_prefix(&prefix)?;
                let bundle = rest.split('/').next()?;
                Some(format!("{}{}", prefix, bundle))
            })
            .collect();
        roots.dedup();
        roots
    }

    pub async fn manifest(&self, root: &str) -> Vec<ManifestEntry> {
        self.text(&format!("{}/_manifest.jsonl", root))
            .await
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    pub async fn metadata(&self, root: &str) -> CompletionMetadata {
        serde_json::from_str(&self.text(&format!("{}/metadata/_completed.json", root)).await).unwrap()
    }
}

pub fn write_file(dir: &Path, relative: &str, content: &str) {
    let path = dir.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}
