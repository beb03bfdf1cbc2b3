//! HTTP(S) loader
//!
//! Relative addresses resolve against the protocol config's `base_url`. Every
//! request goes through the shared client, so the config's rate limit and
//! attempt budget apply per fetch.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_yaml::Mapping;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use datafetch_common::types::ResourceDescriptor;

use super::{non_empty, FetchedResource, Loader};
use crate::error::{ConfigError, LoaderError};
use crate::http::HttpClient;
use crate::registry::{parse_params, BuildContext};

/// Loads resources over HTTP(S) with the client of one protocol config
#[derive(Debug, Clone)]
pub struct HttpLoader {
    id: String,
    client: HttpClient,
}

impl HttpLoader {
    pub fn new(id: impl Into<String>, client: HttpClient) -> Self {
        Self {
            id: id.into(),
            client,
        }
    }
}

#[async_trait]
impl Loader for HttpLoader {
    fn id(&self) -> &str {
        &self.id
    }

    #[instrument(skip(self, descriptor), fields(loader = %self.id, address = %descriptor.address))]
    async fn fetch(&self, descriptor: &ResourceDescriptor) -> Result<FetchedResource, LoaderError> {
        let address = descriptor.address.as_str();
        let url = self
            .client
            .resolve(address)
            .map_err(|failure| LoaderError::permanent(address, failure.message))?;

        let client = &self.client;
        let url = &url;
        let (result, attempts) = client
            .retry_policy()
            .run_counted("http_fetch", move || async move {
                client.get_bytes(url).await.map_err(|failure| LoaderError {
                    kind: failure.kind,
                    address: address.to_string(),
                    message: failure.message,
                    attempts: 1,
                })
            })
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
struct HttpLoaderParams {
    http_config: String,
}

pub(crate) fn factory<'a>(
    id: &'a str,
    params: &'a Mapping,
    ctx: &'a BuildContext,
) -> BoxFuture<'a, Result<Arc<dyn Loader>, ConfigError>> {
    Box::pin(async move {
        let params: HttpLoaderParams = parse_params("http_loader", id, params)?;
        let client = ctx.http_client(&params.http_config)?;
        Ok(Arc::new(HttpLoader::new(id, client)) as Arc<dyn Loader>)
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::HttpProtocolConfig;
    use crate::error::FailureKind;
    use crate::retry::RetryPolicy;
    use std::collections::BTreeMap;
    use wiremock::matchers::path;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn loader(server: &MockServer, max_attempts: u32) -> HttpLoader {
        let config = HttpProtocolConfig {
            name: "api".to_string(),
            base_url: Some(server.uri()),
            headers: BTreeMap::new(),
            timeout_secs: 5,
            rate_limit: None,
            max_attempts,
        };
        HttpLoader::new(
            "api_loader",
            HttpClient::from_config(&config, RetryPolicy::immediate(1)).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_fetches_relative_address() {
        let server = MockServer::start().await;
        Mock::given(path("/files/a.csv"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x,y\n"))
            .mount(&server)
            .await;

        let resource = loader(&server, 3)
            .fetch(&ResourceDescriptor::new("files/a.csv"))
            .await
            .unwrap();
        assert_eq!(resource.content, b"x,y\n");
        assert_eq!(resource.size, 4);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let server = MockServer::start().await;
        Mock::given(path("/a.csv"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(path("/a.csv"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let resource = loader(&server, 3)
            .fetch(&ResourceDescriptor::new("a.csv"))
            .await
            .unwrap();
        assert_eq!(resource.content, b"ok");
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_attempts() {
        let server = MockServer::start().await;
        Mock::given(path("/a.csv"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let err = loader(&server, 3)
            .fetch(&ResourceDescriptor::new("a.csv"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Transient);
        assert_eq!(err.attempts, 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(path("/missing.csv"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let err = loader(&server, 3)
            .fetch(&ResourceDescriptor::new("missing.csv"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Permanent);
        assert_eq!(err.attempts, 1);
    }

    #[tokio::test]
    async fn test_empty_body_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(path("/empty.csv"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let err = loader(&server, 3)
            .fetch(&ResourceDescriptor::new("empty.csv"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Permanent);
    }
}
