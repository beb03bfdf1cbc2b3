//! SFTP locators: directory listings and single remote files

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_yaml::Mapping;
use std::sync::Arc;
use tracing::{debug, info};

use datafetch_common::types::{ResourceDescriptor, ResourceMetadata};

use super::{DescriptorStream, Locator};
use crate::config::SftpProtocolConfig;
use crate::credentials::SftpCredentials;
use crate::error::{ConfigError, LocatorError};
use crate::registry::{parse_params, BuildContext};
use crate::retry::RetryPolicy;
use crate::sftp::{RemoteEntry, RemoteFileSystem, SftpConnector, SftpError};

fn locator_error(locator: &str, err: SftpError) -> LocatorError {
    LocatorError::new(locator, err.kind, err.message)
}

/// Lists the files under a remote directory.
///
/// Every `produce` call opens its own session. Files are yielded sorted by
/// path; sub-directories are walked only when `recursive` is set. The whole
/// listing is always yielded: `max_files` caps what a run admits once filters
/// and incremental state have had their say, so later files are reached on
/// later runs.
pub struct SftpDirectoryLocator {
    id: String,
    connector: Arc<dyn SftpConnector>,
    credentials: SftpCredentials,
    config: SftpProtocolConfig,
    remote_dir: String,
    recursive: bool,
    max_files: Option<usize>,
    retry: RetryPolicy,
}

impl SftpDirectoryLocator {
    pub fn new(
        id: impl Into<String>,
        connector: Arc<dyn SftpConnector>,
        credentials: SftpCredentials,
        config: SftpProtocolConfig,
        remote_dir: impl Into<String>,
    ) -> Self {
        let retry = RetryPolicy::default().with_max_attempts(config.max_attempts);
        Self {
            id: id.into(),
            connector,
            credentials,
            config,
            remote_dir: remote_dir.into(),
            recursive: false,
            max_files: None,
            retry,
        }
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn max_files(mut self, max_files: Option<usize>) -> Self {
        self.max_files = max_files;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry.with_max_attempts(self.config.max_attempts);
        self
    }

    async fn connect(&self) -> Result<Arc<dyn RemoteFileSystem>, LocatorError> {
        let id = self.id.as_str();
        let connector = &self.connector;
        let credentials = &self.credentials;
        let config = &self.config;
        self.retry
            .run("sftp_connect", move || async move {
                connector
                    .connect(credentials, config)
                    .await
                    .map_err(|e| locator_error(id, e))
            })
            .await
    }

    async fn list(
        &self,
        fs: &dyn RemoteFileSystem,
        dir: &str,
    ) -> Result<Vec<RemoteEntry>, LocatorError> {
        let id = self.id.as_str();
        self.retry
            .run("sftp_list", move || async move {
                fs.list_dir(dir).await.map_err(|e| locator_error(id, e))
            })
            .await
    }

    async fn list_files(&self) -> Result<Vec<ResourceDescriptor>, LocatorError> {
        let fs = self.connect().await?;

        let mut pending = vec![self.remote_dir.clone()];
        let mut files = Vec::new();
        while let Some(dir) = pending.pop() {
            debug!(locator = %self.id, dir = %dir, "Listing");
            for entry in self.list(fs.as_ref(), &dir).await? {
                if entry.is_dir {
                    if self.recursive {
                        pending.push(entry.path);
                    }
                } else {
                    files.push(entry);
                }
            }
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));

        info!(locator = %self.id, dir = %self.remote_dir, files = files.len(), "Listed remote files");

        Ok(files
            .into_iter()
            .map(|entry| {
                ResourceDescriptor::new(entry.path).with_metadata(ResourceMetadata {
                    size: entry.size,
                    modified_at: entry.modified_at,
                    ..Default::default()
                })
            })
            .collect())
    }
}

impl Locator for SftpDirectoryLocator {
    fn id(&self) -> &str {
        &self.id
    }

    fn produce(&self) -> DescriptorStream<'_> {
        stream::once(self.list_files())
            .map_ok(|files| stream::iter(files.into_iter().map(Ok)))
            .try_flatten()
            .boxed()
    }

    fn admit_limit(&self) -> Option<usize> {
        self.max_files
    }
}

/// Yields one fixed remote path
#[derive(Debug, Clone)]
pub struct SftpFileLocator {
    id: String,
    path: String,
}

impl SftpFileLocator {
    pub fn new(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }
}

impl Locator for SftpFileLocator {
    fn id(&self) -> &str {
        &self.id
    }

    fn produce(&self) -> DescriptorStream<'_> {
        stream::once(futures::future::ready(Ok(ResourceDescriptor::new(self.path.as_str())))).boxed()
    }
}

// ============================================================================
// Factories
// ============================================================================

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DirectoryParams {
    sftp_config: String,
    remote_dir: String,
    #[serde(default)]
    recursive: bool,
    #[serde(default)]
    max_files: Option<usize>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FileParams {
    sftp_config: String,
    path: String,
}

pub(crate) fn directory_factory<'a>(
    id: &'a str,
    params: &'a Mapping,
    ctx: &'a BuildContext,
) -> BoxFuture<'a, Result<Arc<dyn Locator>, ConfigError>> {
    Box::pin(async move {
        let params: DirectoryParams = parse_params("sftp_directory_locator", id, params)?;
        let (config, credentials) = ctx.sftp_credentials(&params.sftp_config).await?;
        let locator = SftpDirectoryLocator::new(
            id,
            ctx.sftp_connector(),
            credentials,
            config,
            params.remote_dir,
        )
        .recursive(params.recursive)
        .max_files(params.max_files)
        .with_retry(ctx.retry_policy());
        Ok(Arc::new(locator) as Arc<dyn Locator>)
    })
}

pub(crate) fn file_factory<'a>(
    id: &'a str,
    params: &'a Mapping,
    ctx: &'a BuildContext,
) -> BoxFuture<'a, Result<Arc<dyn Locator>, ConfigError>> {
    Box::pin(async move {
        let params: FileParams = parse_params("sftp_file_locator", id, params)?;
        ctx.protocols().sftp(&params.sftp_config)?;
        Ok(Arc::new(SftpFileLocator::new(id, params.path)) as Arc<dyn Locator>)
    })
}
