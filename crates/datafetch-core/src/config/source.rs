//! Where configuration documents are read from

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::error::ConfigError;
use crate::storage::ObjectStore;

/// Read-only access to configuration documents by relative path
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Human-readable location of `relative_path`, used in errors and logs
    fn describe(&self, relative_path: &str) -> String;

    async fn read(&self, relative_path: &str) -> Result<String, ConfigError>;
}

fn reject_escape(relative_path: &str) -> Result<(), ConfigError> {
    let path = Path::new(relative_path);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if relative_path.is_empty() || escapes {
        return Err(ConfigError::Read {
            path: relative_path.to_string(),
            message: "config paths must be relative and stay inside the config root".to_string(),
        });
    }
    Ok(())
}

/// Configs on the local filesystem under a root directory
#[derive(Debug, Clone)]
pub struct DirConfigSource {
    root: PathBuf,
}

impl DirConfigSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ConfigSource for DirConfigSource {
    fn describe(&self, relative_path: &str) -> String {
        self.root.join(relative_path).display().to_string()
    }

    async fn read(&self, relative_path: &str) -> Result<String, ConfigError> {
        reject_escape(relative_path)?;
        let path = self.root.join(relative_path);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ConfigError::Read {
                path: path.display().to_string(),
                message: e.to_string(),
            })
    }
}

/// Configs kept as objects under a prefix of an [`ObjectStore`]
#[derive(Clone)]
pub struct StoreConfigSource {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl StoreConfigSource {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    fn key(&self, relative_path: &str) -> String {
        let relative = relative_path.trim_start_matches("./");
        if self.prefix.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{}", self.prefix, relative)
        }
    }
}

#[async_trait]
impl ConfigSource for StoreConfigSource {
    fn describe(&self, relative_path: &str) -> String {
        self.store.location(&self.key(relative_path))
    }

    async fn read(&self, relative_path: &str) -> Result<String, ConfigError> {
        reject_escape(relative_path)?;
        let key = self.key(relative_path);
        let bytes = self
            .store
            .get(&key)
            .await
            .map_err(|e| ConfigError::Read {
                path: key.clone(),
                message: e.to_string(),
            })?
            .ok_or_else(|| ConfigError::Read {
                path: key.clone(),
                message: "not found".to_string(),
            })?;

        String::from_utf8(bytes).map_err(|e| ConfigError::Malformed {
            path: key,
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;

    #[tokio::test]
    async fn test_dir_source_reads_relative_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("http")).unwrap();
        std::fs::write(dir.path().join("http/api.yaml"), "base_url: https://x.org").unwrap();

        let source = DirConfigSource::new(dir.path());
        let text = source.read("http/api.yaml").await.unwrap();
        assert!(text.contains("base_url"));
    }

    #[tokio::test]
    async fn test_dir_source_rejects_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirConfigSource::new(dir.path());
        assert!(matches!(
            source.read("../secrets.yaml").await,
            Err(ConfigError::Read { .. })
        ));
        assert!(source.read("/etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_store_source_reads_under_prefix() {
        let store = Arc::new(MemoryObjectStore::new());
        store
            .put("configs/us_fl/fetcher.yaml", b"data_source_id: us_fl".to_vec())
            .await
            .unwrap();

        let source = StoreConfigSource::new(store, "configs/");
        let text = source.read("us_fl/fetcher.yaml").await.unwrap();
        assert_eq!(text, "data_source_id: us_fl");
        assert!(source.read("missing.yaml").await.is_err());
    }
}
