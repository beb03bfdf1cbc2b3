//! SFTP loader over one lazily opened, shared session

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_yaml::Mapping;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use datafetch_common::types::ResourceDescriptor;

use super::{non_empty, FetchedResource, Loader};
use crate::config::SftpProtocolConfig;
use crate::credentials::SftpCredentials;
use crate::error::{ConfigError, FailureKind, LoaderError};
use crate::registry::{parse_params, BuildContext};
use crate::retry::RetryPolicy;
use crate::sftp::{RemoteFileSystem, SftpConnector, SftpError};

/// Loads remote files over SFTP.
///
/// Credentials are resolved when the loader is built. The session is opened
/// on first use, shared by all workers, and dropped after a transient
/// failure so the next attempt reconnects.
pub struct SftpLoader {
    id: String,
    connector: Arc<dyn SftpConnector>,
    credentials: SftpCredentials,
    config: SftpProtocolConfig,
    retry: RetryPolicy,
    session: Mutex<Option<Arc<dyn RemoteFileSystem>>>,
}

fn loader_error(address: &str, err: SftpError) -> LoaderError {
    LoaderError {
        kind: err.kind,
        address: address.to_string(),
        message: err.message,
        attempts: 1,
    }
}

impl SftpLoader {
    pub fn new(
        id: impl Into<String>,
        connector: Arc<dyn SftpConnector>,
        credentials: SftpCredentials,
        config: SftpProtocolConfig,
    ) -> Self {
        let retry = RetryPolicy::default().with_max_attempts(config.max_attempts);
        Self {
            id: id.into(),
            connector,
            credentials,
            config,
            retry,
            session: Mutex::new(None),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry.with_max_attempts(self.config.max_attempts);
        self
    }

    async fn session(&self) -> Result<Arc<dyn RemoteFileSystem>, SftpError> {
        let mut session = self.session.lock().await;
        if let Some(fs) = session.as_ref() {
            return Ok(Arc::clone(fs));
        }

        let fs = self.connector.connect(&self.credentials, &self.config).await?;
        info!(loader = %self.id, host = %self.credentials.host, "Opened SFTP session");
        *session = Some(Arc::clone(&fs));
        Ok(fs)
    }

    async fn reset(&self) {
        self.session.lock().await.take();
    }

    async fn read_once(&self, address: &str) -> Result<Vec<u8>, LoaderError> {
        let fs = self.session().await.map_err(|e| loader_error(address, e))?;
        match fs.read_file(address).await {
            Ok(content) => Ok(content),
            Err(e) => {
                if e.kind == FailureKind::Transient {
                    self.reset().await;
                }
                Err(loader_error(address, e))
            },
        }
    }
}

#[async_trait]
impl Loader for SftpLoader {
    fn id(&self) -> &str {
        &self.id
    }

    #[instrument(skip(self, descriptor), fields(loader = %self.id, address = %descriptor.address))]
    async fn fetch(&self, descriptor: &ResourceDescriptor) -> Result<FetchedResource, LoaderError> {
        let address = descriptor.address.as_str();
        let (result, attempts) = self
            .retry
            .run_counted("sftp_fetch", move || self.read_once(address))
            .await;

        match result {
            Ok(content) => {
                debug!(bytes = content.len(), attempts, "Fetched");
                non_empty(descriptor, content, attempts)
            },
            Err(e) => {
                warn!(kind = %e.kind, attempts, error = %e.message, "Fetch failed");
                Err(e.with_attempts(attempts))
            },
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SftpLoaderParams {
    sftp_config: String,
}

pub(crate) fn factory<'a>(
    id: &'a str,
    params: &'a Mapping,
    ctx: &'a BuildContext,
) -> BoxFuture<'a, Result<Arc<dyn Loader>, ConfigError>> {
    Box::pin(async move {
        let params: SftpLoaderParams = parse_params("sftp_loader", id, params)?;
        let (config, credentials) = ctx.sftp_credentials(&params.sftp_config).await?;
        let loader = SftpLoader::new(id, ctx.sftp_connector(), credentials, config)
            .with_retry(ctx.retry_policy());
        Ok(Arc::new(loader) as Arc<dyn Loader>)
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::sftp::{MemoryRemoteFileSystem, MemorySftpConnector, RemoteEntry};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn credentials() -> SftpCredentials {
        SftpCredentials {
            host: "sftp.example.org".to_string(),
            port: 22,
            username: "fetcher".to_string(),
            password: "secret".to_string(),
        }
    }

    fn config(max_attempts: u32) -> SftpProtocolConfig {
        SftpProtocolConfig {
            name: "us_fl".to_string(),
            connect_timeout_secs: 5,
            max_attempts,
        }
    }

    #[tokio::test]
    async fn test_reads_file_and_reuses_session() {
        let fs = MemoryRemoteFileSystem::new()
            .with_file("/doc/a.txt", "alpha")
            .with_file("/doc/empty.txt", "");
        let loader = SftpLoader::new(
            "us_fl_sftp",
            Arc::new(MemorySftpConnector::new(fs)),
            credentials(),
            config(3),
        )
        .with_retry(RetryPolicy::immediate(1));

        let resource = loader.fetch(&ResourceDescriptor::new("/doc/a.txt")).await.unwrap();
        assert_eq!(resource.content, b"alpha");

        let missing = loader.fetch(&ResourceDescriptor::new("/doc/b.txt")).await.unwrap_err();
        assert_eq!(missing.kind, FailureKind::Permanent);
        assert_eq!(missing.attempts, 1);

        let empty = loader.fetch(&ResourceDescriptor::new("/doc/empty.txt")).await.unwrap_err();
        assert_eq!(empty.kind, FailureKind::Permanent);
    }

    /// Drops the first `failures` reads with a transient error
    struct FlakyFs {
        inner: MemoryRemoteFileSystem,
        failures: AtomicU32,
    }

    #[async_trait]
    impl RemoteFileSystem for FlakyFs {
        async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, SftpError> {
            self.inner.list_dir(path).await
        }

        async fn read_file(&self, path: &str) -> Result<Vec<u8>, SftpError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(SftpError::transient("connection reset"));
            }
            self.inner.read_file(path).await
        }
    }

    struct CountingConnector {
        fs: Arc<FlakyFs>,
        connects: AtomicU32,
    }

    #[async_trait]
    impl SftpConnector for CountingConnector {
        async fn connect(
            &self,
            _credentials: &SftpCredentials,
            _config: &SftpProtocolConfig,
        ) -> Result<Arc<dyn RemoteFileSystem>, SftpError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(self.fs.clone())
        }
    }

    #[tokio::test]
    async fn test_transient_failure_reconnects_and_retries() {
        let connector = Arc::new(CountingConnector {
            fs: Arc::new(FlakyFs {
                inner: MemoryRemoteFileSystem::new().with_file("/a.txt", "alpha"),
                failures: AtomicU32::new(2),
            }),
            connects: AtomicU32::new(0),
        });
        let loader = SftpLoader::new("l", connector.clone(), credentials(), config(3))
            .with_retry(RetryPolicy::immediate(1));

        let resource = loader.fetch(&ResourceDescriptor::new("/a.txt")).await.unwrap();
        assert_eq!(resource.content, b"alpha");
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
    }
}
