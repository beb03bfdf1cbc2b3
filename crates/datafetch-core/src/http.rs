//! HTTP client shared by the HTTP loader and locators
//!
//! One client is built per HTTP protocol config, so every strategy that
//! references the same config shares its headers, timeout and rate limiter.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::HttpProtocolConfig;
use crate::error::{ConfigError, FailureKind};
use crate::retry::RetryPolicy;

/// A classified HTTP failure
#[derive(Debug, Clone)]
pub struct HttpFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl HttpFailure {
    fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }
}

/// Map a non-success status to a failure kind
pub fn classify_status(status: StatusCode) -> FailureKind {
    match status.as_u16() {
        408 | 425 | 429 => FailureKind::Transient,
        s if (500..600).contains(&s) => FailureKind::Transient,
        _ => FailureKind::Permanent,
    }
}

fn classify_request_error(err: &reqwest::Error) -> FailureKind {
    if err.is_builder() || err.is_redirect() {
        FailureKind::Permanent
    } else {
        // timeouts, refused or reset connections, truncated bodies
        FailureKind::Transient
    }
}

struct HttpClientInner {
    name: String,
    client: reqwest::Client,
    base_url: Option<Url>,
    limiter: Option<DefaultDirectRateLimiter>,
    retry: RetryPolicy,
}

/// Rate-limited HTTP client for one protocol config
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<HttpClientInner>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("name", &self.inner.name)
            .field("base_url", &self.inner.base_url)
            .field("rate_limited", &self.inner.limiter.is_some())
            .finish()
    }
}

impl HttpClient {
    pub fn from_config(config: &HttpProtocolConfig, retry: RetryPolicy) -> Result<Self, ConfigError> {
        let invalid = |field: &str, message: String| ConfigError::InvalidValue {
            field: format!("{}.{}", config.name, field),
            message,
        };

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| invalid("headers", format!("{}: {}", name, e)))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| invalid("headers", format!("{}: {}", name, e)))?;
            headers.insert(header_name, header_value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("datafetch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| invalid("client", e.to_string()))?;

        let base_url = config
            .base_url
            .as_deref()
            .map(|base| {
                // a trailing slash makes relative joins append instead of replace
                let normalized = if base.ends_with('/') {
                    base.to_string()
                } else {
                    format!("{}/", base)
                };
                Url::parse(&normalized).map_err(|e| invalid("base_url", e.to_string()))
            })
            .transpose()?;

        let limiter = match &config.rate_limit {
            Some(limit) => {
                let per_second = NonZeroU32::new(limit.requests_per_second).ok_or_else(|| {
                    invalid("rate_limit.requests_per_second", "must be at least 1".to_string())
                })?;
                let mut quota = Quota::per_second(per_second);
                if let Some(burst) = limit.burst {
                    let burst = NonZeroU32::new(burst)
                        .ok_or_else(|| invalid("rate_limit.burst", "must be at least 1".to_string()))?;
                    quota = quota.allow_burst(burst);
                }
                Some(RateLimiter::direct(quota))
            },
            None => None,
        };

        Ok(Self {
            inner: Arc::new(HttpClientInner {
                name: config.name.clone(),
                client,
                base_url,
                limiter,
                retry: retry.with_max_attempts(config.max_attempts),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Retry budget configured for this protocol config
    pub fn retry_policy(&self) -> RetryPolicy {
        self.inner.retry
    }

    /// Resolve an absolute address, or a relative one against `base_url`
    pub fn resolve(&self, address: &str) -> Result<Url, HttpFailure> {
        match Url::parse(address) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => match &self.inner.base_url {
                Some(base) => base
                    .join(address.trim_start_matches('/'))
                    .map_err(|e| HttpFailure::permanent(format!("invalid address {}: {}", address, e))),
                None => Err(HttpFailure::permanent(format!(
                    "relative address '{}' but config '{}' has no base_url",
                    address, self.inner.name
                ))),
            },
            Err(e) => Err(HttpFailure::permanent(format!("invalid address {}: {}", address, e))),
        }
    }

    /// Single GET returning the response body; no retries
    pub async fn get_bytes(&self, url: &Url) -> Result<Vec<u8>, HttpFailure> {
        if let Some(limiter) = &self.inner.limiter {
            limiter.until_ready().await;
        }

        debug!(client = %self.inner.name, url = %url, "GET");

        let response = self
            .inner
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| HttpFailure {
                kind: classify_request_error(&e),
                message: format!("request to {} failed: {}", url, e),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(HttpFailure {
                kind: classify_status(status),
                message: format!("{} returned HTTP {}", url, status),
            });
        }

        let body = response.bytes().await.map_err(|e| HttpFailure {
            kind: classify_request_error(&e),
            message: format!("reading body of {} failed: {}", url, e),
        })?;

        Ok(body.to_vec())
    }

    /// Single GET decoded as JSON; a body that is not JSON is permanent
    pub async fn get_json(&self, url: &Url) -> Result<serde_json::Value, HttpFailure> {
        let body = self.get_bytes(url).await?;
        serde_json::from_slice(&body)
            .map_err(|e| HttpFailure::permanent(format!("{} did not return JSON: {}", url, e)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use std::collections::BTreeMap;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn http_config(base_url: Option<String>) -> HttpProtocolConfig {
        HttpProtocolConfig {
            name: "api".to_string(),
            base_url,
            headers: BTreeMap::from([("X-Api-Key".to_string(), "secret".to_string())]),
            timeout_secs: 5,
            rate_limit: Some(RateLimitConfig {
                requests_per_second: 100,
                burst: Some(10),
            }),
            max_attempts: 2,
        }
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), FailureKind::Transient);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), FailureKind::Transient);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), FailureKind::Permanent);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), FailureKind::Permanent);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), FailureKind::Permanent);
    }

    #[test]
    fn test_resolve_relative_against_base() {
        let client = HttpClient::from_config(
            &http_config(Some("https://example.org/api/v1".to_string())),
            RetryPolicy::immediate(1),
        )
        .unwrap();
        assert_eq!(
            client.resolve("/files/a.csv").unwrap().as_str(),
            "https://example.org/api/v1/files/a.csv"
        );
        assert_eq!(
            client.resolve("https://other.org/x").unwrap().as_str(),
            "https://other.org/x"
        );
        assert_eq!(client.retry_policy().max_attempts, 2);
    }

    #[test]
    fn test_relative_without_base_is_permanent() {
        let client = HttpClient::from_config(&http_config(None), RetryPolicy::immediate(1)).unwrap();
        assert_eq!(client.resolve("files/a.csv").unwrap_err().kind, FailureKind::Permanent);
    }

    #[test]
    fn test_rejects_zero_rate() {
        let mut config = http_config(None);
        config.rate_limit = Some(RateLimitConfig {
            requests_per_second: 0,
            burst: None,
        });
        assert!(HttpClient::from_config(&config, RetryPolicy::immediate(1)).is_err());
    }

    #[tokio::test]
    async fn test_sends_configured_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data.csv"))
            .and(header("X-Api-Key", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_string("a,b\n1,2\n"))
            .mount(&server)
            .await;

        let client =
            HttpClient::from_config(&http_config(Some(server.uri())), RetryPolicy::immediate(1))
                .unwrap();
        let url = client.resolve("data.csv").unwrap();
        assert_eq!(client.get_bytes(&url).await.unwrap(), b"a,b\n1,2\n");
    }

    #[tokio::test]
    async fn test_status_failures_are_classified() {
        let server = MockServer::start().await;
        Mock::given(path("/busy"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client =
            HttpClient::from_config(&http_config(Some(server.uri())), RetryPolicy::immediate(1))
                .unwrap();
        let busy = client.get_bytes(&client.resolve("busy").unwrap()).await.unwrap_err();
        let gone = client.get_bytes(&client.resolve("gone").unwrap()).await.unwrap_err();
        assert_eq!(busy.kind, FailureKind::Transient);
        assert_eq!(gone.kind, FailureKind::Permanent);
    }
}
