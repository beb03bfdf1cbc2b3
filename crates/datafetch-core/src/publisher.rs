//! Completion notifications for downstream consumers

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument};
use uuid::Uuid;

use datafetch_common::types::BundleStatus;

use crate::error::PublishError;
use crate::retry::RetryPolicy;

#[cfg(test)]
use mockall::automock;

/// Body of the message sent once a bundle is sealed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleCompletedMessage {
    pub bid: Uuid,
    pub data_source_id: String,
    pub stage: String,
    pub run_id: String,
    pub location: String,
    pub resources_count: usize,
    pub status: BundleStatus,
    pub bundle_hash: String,
}

/// Destination for completion messages
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageQueue: Send + Sync {
    fn name(&self) -> String;

    async fn send(&self, body: String) -> Result<(), PublishError>;
}

/// Keeps messages in memory; used by tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryQueue {
    messages: Mutex<Vec<String>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    fn name(&self) -> String {
        "memory".to_string()
    }

    async fn send(&self, body: String) -> Result<(), PublishError> {
        self.messages
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(body);
        Ok(())
    }
}

/// Appends one JSON message per line to a local file
#[derive(Debug, Clone)]
pub struct FileQueue {
    path: PathBuf,
}

impl FileQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn send_error(&self, err: std::io::Error) -> PublishError {
        PublishError::Send {
            queue: self.name(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl MessageQueue for FileQueue {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    async fn send(&self, body: String) -> Result<(), PublishError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.send_error(e))?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.send_error(e))?;

        let mut line = body.into_bytes();
        line.push(b'\n');
        file.write_all(&line).await.map_err(|e| self.send_error(e))?;
        file.flush().await.map_err(|e| self.send_error(e))
    }
}

/// Sends completion messages with retry
pub struct Publisher {
    queue: Arc<dyn MessageQueue>,
    retry: RetryPolicy,
}

impl Publisher {
    pub fn new(queue: Arc<dyn MessageQueue>) -> Self {
        Self {
            queue,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[instrument(skip(self, message), fields(bid = %message.bid, queue = %self.queue.name()))]
    pub async fn publish(&self, message: &BundleCompletedMessage) -> Result<(), PublishError> {
        let body = serde_json::to_string(message)?;
        let queue = &self.queue;
        let body = &body;
        self.retry
            .run("publish", move || async move { queue.send(body.clone()).await })
            .await?;

        info!(status = %message.status, resources = message.resources_count, "Published bundle completion");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn message() -> BundleCompletedMessage {
        BundleCompletedMessage {
            bid: Uuid::new_v4(),
            data_source_id: "us_fl".to_string(),
            stage: "raw".to_string(),
            run_id: "fetcher_us_fl_20250101000000".to_string(),
            location: "memory://raw/us_fl/data/bundle_x".to_string(),
            resources_count: 4,
            status: BundleStatus::Completed,
            bundle_hash: "abc".to_string(),
        }
    }

    #[tokio::test]
    async fn test_publish_sends_json() {
        let queue = Arc::new(MemoryQueue::new());
        let publisher = Publisher::new(queue.clone()).with_retry(RetryPolicy::immediate(1));
        let msg = message();

        publisher.publish(&msg).await.unwrap();

        let sent = queue.messages();
        assert_eq!(sent.len(), 1);
        let decoded: BundleCompletedMessage = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn test_send_failure_is_retried() {
        let mut queue = MockMessageQueue::new();
        queue.expect_name().return_const("mock".to_string());
        let mut calls = 0;
        queue.expect_send().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(PublishError::Send {
                    queue: "mock".to_string(),
                    message: "unavailable".to_string(),
                })
            } else {
                Ok(())
            }
        });

        let publisher = Publisher::new(Arc::new(queue)).with_retry(RetryPolicy::immediate(3));
        publisher.publish(&message()).await.unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_retries_return_error() {
        let mut queue = MockMessageQueue::new();
        queue.expect_name().return_const("mock".to_string());
        queue.expect_send().times(2).returning(|_| {
            Err(PublishError::Send {
                queue: "mock".to_string(),
                message: "unavailable".to_string(),
            })
        });

        let publisher = Publisher::new(Arc::new(queue)).with_retry(RetryPolicy::immediate(2));
        let err = publisher.publish(&message()).await.unwrap_err();
        assert!(matches!(err, PublishError::Send { .. }));
    }

    #[tokio::test]
    async fn test_file_queue_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileQueue::new(dir.path().join("out/queue.jsonl"));

        queue.send("{\"a\":1}".to_string()).await.unwrap();
        queue.send("{\"a\":2}".to_string()).await.unwrap();

        let written = std::fs::read_to_string(dir.path().join("out/queue.jsonl")).unwrap();
        assert_eq!(written, "{\"a\":1}\n{\"a\":2}\n");
    }
}
