//! Resolved data-source configuration

use serde::{Deserialize, Serialize};
use serde_yaml::Mapping;
use std::collections::BTreeMap;

use super::settings::{
    DEFAULT_HTTP_TIMEOUT_SECS, DEFAULT_RETRY_MAX_ATTEMPTS, DEFAULT_SFTP_CONNECT_TIMEOUT_SECS,
};
use crate::error::ConfigError;

/// Supported protocol families
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    Http,
    Sftp,
}

impl ProtocolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolType::Http => "http",
            ProtocolType::Sftp => "sftp",
        }
    }

    /// Key a strategy uses to reference a config of this protocol, e.g. `sftp_config`
    pub fn reference_key(&self) -> &'static str {
        match self {
            ProtocolType::Http => "http_config",
            ProtocolType::Sftp => "sftp_config",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "http" => Some(ProtocolType::Http),
            "sftp" => Some(ProtocolType::Sftp),
            _ => None,
        }
    }

    pub fn all() -> [ProtocolType; 2] {
        [ProtocolType::Http, ProtocolType::Sftp]
    }
}

impl std::fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Protocol configs
// ============================================================================

/// Token-bucket limit applied to every request made with one HTTP config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    pub requests_per_second: u32,
    #[serde(default)]
    pub burst: Option<u32>,
}

/// HTTP connection parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpProtocolConfig {
    /// Reference name from the `protocols` section
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    /// Total tries per request, the first one included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// SFTP connection parameters; host and credentials live in the secret store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SftpProtocolConfig {
    #[serde(skip)]
    pub name: String,
    #[serde(default = "default_sftp_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl SftpProtocolConfig {
    /// Secret holding `host, username, password, port` for this config
    pub fn secret_name(&self) -> String {
        format!("{}-sftp-credentials", self.name)
    }
}

fn default_http_timeout() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

fn default_sftp_connect_timeout() -> u64 {
    DEFAULT_SFTP_CONNECT_TIMEOUT_SECS
}

fn default_max_attempts() -> u32 {
    DEFAULT_RETRY_MAX_ATTEMPTS
}

/// A loaded protocol config
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolConfig {
    Http(HttpProtocolConfig),
    Sftp(SftpProtocolConfig),
}

impl ProtocolConfig {
    pub fn protocol_type(&self) -> ProtocolType {
        match self {
            ProtocolConfig::Http(_) => ProtocolType::Http,
            ProtocolConfig::Sftp(_) => ProtocolType::Sftp,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ProtocolConfig::Http(c) => &c.name,
            ProtocolConfig::Sftp(c) => &c.name,
        }
    }
}

/// Every protocol config the data source declares, keyed by reference name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedProtocols {
    pub http: BTreeMap<String, HttpProtocolConfig>,
    pub sftp: BTreeMap<String, SftpProtocolConfig>,
}

impl ResolvedProtocols {
    pub fn insert(&mut self, config: ProtocolConfig) {
        match config {
            ProtocolConfig::Http(c) => {
                self.http.insert(c.name.clone(), c);
            },
            ProtocolConfig::Sftp(c) => {
                self.sftp.insert(c.name.clone(), c);
            },
        }
    }

    pub fn contains(&self, protocol: ProtocolType, name: &str) -> bool {
        match protocol {
            ProtocolType::Http => self.http.contains_key(name),
            ProtocolType::Sftp => self.sftp.contains_key(name),
        }
    }

    pub fn http(&self, name: &str) -> Result<&HttpProtocolConfig, ConfigError> {
        self.http
            .get(name)
            .ok_or_else(|| ConfigError::UnresolvedReference {
                protocol: ProtocolType::Http.to_string(),
                name: name.to_string(),
            })
    }

    pub fn sftp(&self, name: &str) -> Result<&SftpProtocolConfig, ConfigError> {
        self.sftp
            .get(name)
            .ok_or_else(|| ConfigError::UnresolvedReference {
                protocol: ProtocolType::Sftp.to_string(),
                name: name.to_string(),
            })
    }
}

// ============================================================================
// Strategies
// ============================================================================

/// One `{ <strategy_type>: { params } }` section of a config document
#[derive(Debug, Clone, PartialEq)]
pub struct StrategySpec {
    pub strategy_type: String,
    pub strategy_id: String,
    pub params: Mapping,
}

impl StrategySpec {
    /// String value of a parameter, if present
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }
}

/// A locator together with its filters and incremental-state prefix
#[derive(Debug, Clone, PartialEq)]
pub struct LocatorSpec {
    pub strategy: StrategySpec,
    pub filters: Vec<StrategySpec>,
    pub state_management_prefix: Option<String>,
}

/// What to do when a locator fails to list or page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocatorErrorPolicy {
    /// Abort the whole data source
    #[default]
    FailFast,
    /// Drop the failing locator and continue with its siblings
    SkipLocator,
}

/// Aggregation rule for resource-level failures
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FailurePolicy {
    /// Abort as soon as more than this many resources have failed
    #[serde(default)]
    pub max_failures: Option<usize>,
    /// Minimum fraction of attempted resources that must succeed, checked on drain
    #[serde(default)]
    pub min_success_ratio: Option<f64>,
}

impl FailurePolicy {
    /// Whether `failed` failures so far already breach `max_failures`
    pub fn exceeded_early(&self, failed: usize) -> bool {
        self.max_failures.is_some_and(|max| failed > max)
    }

    /// Final check once every resource has been attempted; returns the breach reason
    pub fn check_final(&self, succeeded: usize, failed: usize) -> Option<String> {
        if self.exceeded_early(failed) {
            return Some(format!(
                "more than {} resource failures",
                self.max_failures.unwrap_or_default()
            ));
        }

        let total = succeeded + failed;
        match self.min_success_ratio {
            Some(min) if total > 0 => {
                let ratio = succeeded as f64 / total as f64;
                (ratio < min).then(|| format!("success ratio {:.2} below {:.2}", ratio, min))
            },
            _ => None,
        }
    }
}

/// A fully resolved data-source configuration
#[derive(Debug, Clone, PartialEq)]
pub struct DataSourceConfig {
    pub data_source_id: String,
    pub concurrency: usize,
    pub target_queue_size: usize,
    pub on_locator_error: LocatorErrorPolicy,
    pub failure_policy: FailurePolicy,
    pub loader: StrategySpec,
    pub locators: Vec<LocatorSpec>,
    pub protocols: ResolvedProtocols,
}

impl DataSourceConfig {
    /// Distinct state prefixes used by this source's locators, in declaration order
    pub fn state_prefixes(&self) -> Vec<String> {
        let mut prefixes: Vec<String> = Vec::new();
        for prefix in self
            .locators
            .iter()
            .filter_map(|l| l.state_management_prefix.as_ref())
        {
            if !prefixes.contains(prefix) {
                prefixes.push(prefix.clone());
            }
        }
        prefixes
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_defaults() {
        let http: HttpProtocolConfig = serde_yaml::from_str("base_url: https://x.org").unwrap();
        assert_eq!(http.timeout_secs, DEFAULT_HTTP_TIMEOUT_SECS);
        assert_eq!(http.max_attempts, DEFAULT_RETRY_MAX_ATTEMPTS);
        assert!(http.headers.is_empty());

        let mut sftp: SftpProtocolConfig = serde_yaml::from_str("{}").unwrap();
        sftp.name = "us_fl".to_string();
        assert_eq!(sftp.secret_name(), "us_fl-sftp-credentials");
    }

    #[test]
    fn test_attempt_budget_counts_the_first_try() {
        let sftp: SftpProtocolConfig = serde_yaml::from_str("max_attempts: 1").unwrap();
        assert_eq!(sftp.max_attempts, 1);

        // the old retry-count key is rejected rather than silently ignored
        let err = serde_yaml::from_str::<HttpProtocolConfig>("max_retries: 3").unwrap_err();
        assert!(err.to_string().contains("max_retries"));
    }

    #[test]
    fn test_failure_policy_default_permits_partial_bundles() {
        let policy = FailurePolicy::default();
        assert!(!policy.exceeded_early(100));
        assert!(policy.check_final(3, 1).is_none());
    }

    #[test]
    fn test_failure_policy_limits() {
        let policy = FailurePolicy {
            max_failures: Some(1),
            min_success_ratio: Some(0.75),
        };
        assert!(!policy.exceeded_early(1));
        assert!(policy.exceeded_early(2));
        assert!(policy.check_final(3, 1).is_none());
        assert!(policy.check_final(2, 1).is_some());
        assert!(policy.check_final(0, 0).is_none());
    }
}
