//! Run-level error handling: locator policies, thresholds, state and publish failures

mod common;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use common::{Harness, STAGE};
use datafetch_common::types::BundleStatus;
use datafetch_core::error::{Classified, ErrorKind, FetchError, PublishError, StorageError};
use datafetch_core::kv::{KeyValueStore, MemoryKeyValueStore};
use datafetch_core::publisher::MessageQueue;
use datafetch_core::runner::RunWarning;
use datafetch_core::sftp::MemoryRemoteFileSystem;
use datafetch_core::storage::ObjectStore;

fn remote() -> MemoryRemoteFileSystem {
    MemoryRemoteFileSystem::new()
        .with_file("/doc/cor/a.txt", "alpha")
        .with_file("/doc/cor/b.txt", "beta")
        .with_file("/doc/cor/c.txt", "")
        .with_file("/doc/single/report.txt", "single")
}

fn document(extra: &str, locators: &str) -> String {
    format!(
        r#"
data_source_id: us_fl
concurrency: 2
{}
loader:
  sftp_loader: {{ meta_load_name: us_fl_sftp, sftp_config: us_fl }}
locators:
{}
protocols:
  sftp: {{ us_fl: sftp/us_fl.yaml }}
"#,
        extra, locators
    )
}

const DIRECTORY_LOCATOR: &str = r#"
  - sftp_directory_locator:
      sftp_config: us_fl
      remote_dir: /doc/cor
      state_management_prefix: us_fl_daily
"#;

const MISSING_DIRECTORY_LOCATOR: &str = r#"
  - sftp_directory_locator:
      id: missing
      sftp_config: us_fl
      remote_dir: /doc/missing
"#;

const FILE_LOCATOR: &str = r#"
  - sftp_file_locator:
      id: single
      sftp_config: us_fl
      path: /doc/single/report.txt
"#;

fn harness(document: &str) -> Harness {
    let harness = Harness::new().with_remote(remote());
    harness.write("us_fl/fetcher.yaml", document);
    harness.write("sftp/us_fl.yaml", "max_attempts: 1\n");
    harness
}

#[tokio::test]
async fn test_locator_error_fails_fast_by_default() {
    let harness = harness(&document("", &format!("{}{}", MISSING_DIRECTORY_LOCATOR, FILE_LOCATOR)));

    let err = harness.runner().run("us_fl").await.unwrap_err();
    assert!(matches!(err, FetchError::Locator(_)), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::LocatorPermanent);

    let roots = harness.bundle_roots("us_fl").await;
    assert_eq!(roots.len(), 1);
    assert_eq!(harness.metadata(&roots[0]).await.status, BundleStatus::Failed);
    assert!(harness.queue.messages().is_empty());
}

#[tokio::test]
async fn test_skip_locator_continues_with_siblings() {
    let harness = harness(&document(
        "on_locator_error: skip_locator",
        &format!("{}{}", MISSING_DIRECTORY_LOCATOR, FILE_LOCATOR),
    ));

    let report = harness.runner().run("us_fl").await.unwrap();
    assert_eq!(report.skipped_locators, vec!["missing".to_string()]);
    assert_eq!(report.resources_count, 1);
    assert_eq!(report.status, BundleStatus::Completed);
}

#[tokio::test]
async fn test_failure_threshold_aborts_and_marks_bundle_failed() {
    let harness = harness(&document(
        "failure_policy: { max_failures: 0 }",
        DIRECTORY_LOCATOR,
    ));

    let err = harness.runner().run("us_fl").await.unwrap_err();
    assert!(matches!(err, FetchError::ThresholdExceeded { .. }), "{err:?}");

    let roots = harness.bundle_roots("us_fl").await;
    assert_eq!(roots.len(), 1);
    let metadata = harness.metadata(&roots[0]).await;
    assert_eq!(metadata.status, BundleStatus::Failed);
    assert!(metadata.error.is_some());

    assert!(!harness
        .store
        .exists(&format!("{}/_manifest.jsonl", roots[0]))
        .await
        .unwrap());
    assert!(!harness
        .store
        .exists(&format!("{}/us_fl/bundle_hashes/_latest", STAGE))
        .await
        .unwrap());
    assert!(harness.queue.messages().is_empty());

    // nothing was committed, so a rerun starts from scratch
    let rerun = harness.runner().run("us_fl").await.unwrap_err();
    assert!(matches!(rerun, FetchError::ThresholdExceeded { .. }));
}

#[tokio::test]
async fn test_min_success_ratio_checked_on_drain() {
    let harness = harness(&document(
        "failure_policy: { min_success_ratio: 0.9 }",
        DIRECTORY_LOCATOR,
    ));

    let err = harness.runner().run("us_fl").await.unwrap_err();
    assert!(matches!(err, FetchError::ThresholdExceeded { succeeded: 2, failed: 1, .. }), "{err:?}");
}

#[tokio::test]
async fn test_unknown_strategy_fails_before_fetching() {
    let harness = harness(&document(
        "",
        r#"
  - ftp_locator:
      path: /doc
"#,
    ));

    let err = harness.runner().run("us_fl").await.unwrap_err();
    assert!(matches!(err, FetchError::Config(_)), "{err:?}");
    assert!(harness.bundle_roots("us_fl").await.is_empty());
}

struct FailingQueue;

#[async_trait]
impl MessageQueue for FailingQueue {
    fn name(&self) -> String {
        "failing".to_string()
    }

    async fn send(&self, _body: String) -> Result<(), PublishError> {
        Err(PublishError::Send {
            queue: "failing".to_string(),
            message: "broker unavailable".to_string(),
        })
    }
}

#[tokio::test]
async fn test_publish_failure_is_a_warning() {
    let harness = harness(&document("", DIRECTORY_LOCATOR));

    let report = harness
        .runner_with_queue(Arc::new(FailingQueue))
        .run("us_fl")
        .await
        .unwrap();

    assert!(!report.published);
    assert_eq!(report.status, BundleStatus::Completed);
    assert!(matches!(report.warnings.as_slice(), [RunWarning::Publish(_)]));
    assert!(!report.needs_reconciliation());

    // state was still committed
    let rerun = harness.runner().run("us_fl").await.unwrap();
    assert_eq!(rerun.filtered_by_state, 2);
}

/// Reads succeed; every write fails
struct ReadOnlyState {
    inner: MemoryKeyValueStore,
}

#[async_trait]
impl KeyValueStore for ReadOnlyState {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, _value: &Value) -> Result<(), StorageError> {
        Err(StorageError::Backend {
            key: key.to_string(),
            message: "read-only".to_string(),
        })
    }
}

/// Every read fails
struct UnreachableState;

#[async_trait]
impl KeyValueStore for UnreachableState {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Err(StorageError::Backend {
            key: key.to_string(),
            message: "connection refused".to_string(),
        })
    }

    async fn put(&self, key: &str, _value: &Value) -> Result<(), StorageError> {
        Err(StorageError::Backend {
            key: key.to_string(),
            message: "connection refused".to_string(),
        })
    }
}

#[tokio::test]
async fn test_state_commit_failure_needs_reconciliation() {
    let harness = harness(&document("", DIRECTORY_LOCATOR)).with_state(Arc::new(ReadOnlyState {
        inner: MemoryKeyValueStore::new(),
    }));

    let report = harness.runner().run("us_fl").await.unwrap();
    assert_eq!(report.status, BundleStatus::Completed);
    assert!(report.needs_reconciliation());
    assert!(report.published);

    let root = format!("{}/us_fl/data/bundle_{}", STAGE, report.bid);
    assert!(harness.metadata(&root).await.status.is_usable());
}

#[tokio::test]
async fn test_state_read_failure_is_fatal_before_fetch() {
    let harness = harness(&document("", DIRECTORY_LOCATOR)).with_state(Arc::new(UnreachableState));

    let err = harness.runner().run("us_fl").await.unwrap_err();
    assert!(matches!(err, FetchError::StateStore(_)), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::StateRead);
    assert!(harness.bundle_roots("us_fl").await.is_empty());
}
