//! Process settings read from the environment

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::storage::config::StorageConfig;

// ============================================================================
// Defaults
// ============================================================================

/// Default directory holding data-source configuration documents.
pub const DEFAULT_CONFIG_DIR: &str = "./configs";

/// Default storage stage (top-level prefix for bundles).
pub const DEFAULT_STAGE: &str = "raw";

/// Default root directory for the local object store.
pub const DEFAULT_STORAGE_PATH: &str = "./data";

/// Default file the local message queue appends to.
pub const DEFAULT_QUEUE_FILE: &str = "./data/bundle_events.jsonl";

/// Default bounded queue capacity when a config omits `target_queue_size`.
pub const DEFAULT_TARGET_QUEUE_SIZE: usize = 100;

/// Default worker pool size when a config omits `concurrency`.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default number of attempts for retried operations.
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;

/// Default initial backoff in milliseconds.
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;

/// Default backoff ceiling in seconds.
pub const DEFAULT_RETRY_MAX_DELAY_SECS: u64 = 30;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Default SFTP connect timeout in seconds.
pub const DEFAULT_SFTP_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default SFTP port when the secret does not carry one.
pub const DEFAULT_SFTP_PORT: u16 = 22;

/// Object-store prefix under which state records are kept.
pub const DEFAULT_STATE_PREFIX: &str = "_state";

/// Which object store backs bundles and state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Local,
    S3,
}

impl std::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" | "file" => Ok(StorageBackend::Local),
            "s3" => Ok(StorageBackend::S3),
            _ => Err(format!("Unknown storage backend: {}", s)),
        }
    }
}

/// Runtime settings for the `datafetch` binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Directory with `<data_source_id>/fetcher.yaml` documents
    pub config_dir: PathBuf,
    /// When set, configs are read from this prefix of the object store instead
    pub config_prefix: Option<String>,
    pub stage: String,
    pub storage: StorageBackend,
    pub storage_path: PathBuf,
    pub s3: StorageConfig,
    /// Prepended to secret names when looking them up in the environment
    pub credentials_prefix: Option<String>,
    pub queue_file: PathBuf,
}

impl Settings {
    /// Load settings from `.env` and the environment
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Read settings from the current environment only
    pub fn from_env() -> anyhow::Result<Self> {
        let storage = match std::env::var("DATAFETCH_STORAGE") {
            Ok(value) => value.parse().map_err(anyhow::Error::msg)?,
            Err(_) => StorageBackend::Local,
        };

        let settings = Settings {
            config_dir: std::env::var("DATAFETCH_CONFIG_DIR")
                .unwrap_or_else(|_| DEFAULT_CONFIG_DIR.to_string())
                .into(),
            config_prefix: std::env::var("DATAFETCH_CONFIG_PREFIX")
                .ok()
                .filter(|s| !s.is_empty()),
            stage: std::env::var("DATAFETCH_STAGE").unwrap_or_else(|_| DEFAULT_STAGE.to_string()),
            storage,
            storage_path: std::env::var("DATAFETCH_STORAGE_PATH")
                .unwrap_or_else(|_| DEFAULT_STORAGE_PATH.to_string())
                .into(),
            s3: StorageConfig::from_env(),
            credentials_prefix: std::env::var("DATAFETCH_CREDENTIALS_PREFIX")
                .ok()
                .filter(|s| !s.is_empty()),
            queue_file: std::env::var("DATAFETCH_QUEUE_FILE")
                .unwrap_or_else(|_| DEFAULT_QUEUE_FILE.to_string())
                .into(),
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Apply command-line overrides, then validate the result.
    ///
    /// Every subcommand goes through here so `check` accepts exactly the
    /// settings `run` accepts.
    pub fn with_overrides(
        mut self,
        config_dir: Option<PathBuf>,
        stage: Option<String>,
    ) -> anyhow::Result<Self> {
        if let Some(dir) = config_dir {
            self.config_dir = dir;
        }
        if let Some(stage) = stage {
            self.stage = stage;
        }
        self.validate()?;
        Ok(self)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.stage.is_empty() || self.stage.contains('/') {
            anyhow::bail!("Stage must be a single non-empty path segment, got '{}'", self.stage);
        }

        if self.storage == StorageBackend::S3 && self.s3.bucket.is_empty() {
            anyhow::bail!("S3_BUCKET must be set when DATAFETCH_STORAGE=s3");
        }

        Ok(())
    }
}
