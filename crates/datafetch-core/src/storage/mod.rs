//! Object storage for bundles, state records and configs

use async_trait::async_trait;

use crate::error::StorageError;

pub mod config;
pub mod local;
pub mod memory;
pub mod s3;

pub use config::StorageConfig;
pub use local::LocalObjectStore;
pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;

/// Byte storage addressed by `/`-separated keys
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fully qualified location of `key`, e.g. `s3://bucket/key`
    fn location(&self, key: &str) -> String;

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), StorageError>;

    /// `None` when the key does not exist
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Keys starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Reject keys that are empty, absolute, or contain `.`/`..` segments
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");

    if invalid {
        Err(StorageError::InvalidKey(key.to_string()))
    } else {
        Ok(())
    }
}
