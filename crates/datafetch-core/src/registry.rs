//! Strategy registry: string strategy types to factories
//!
//! The registry is built once at startup and passed by reference to whatever
//! needs to build strategies. Adding a protocol or locator variant means
//! registering one more factory; nothing in the pipeline changes.

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::config::{LocatorSpec, ResolvedProtocols, SftpProtocolConfig, StrategySpec};
use crate::credentials::{CredentialsProvider, SftpCredentials};
use crate::error::ConfigError;
use crate::http::HttpClient;
use crate::loader::{self, Loader};
use crate::locator::{self, FilteredLocator, Locator, LocatorBinding, ResourceFilter};
use crate::retry::RetryPolicy;
use crate::sftp::SftpConnector;

/// Builds a loader from `(strategy_id, params, context)`
pub type LoaderFactory = for<'a> fn(
    &'a str,
    &'a Mapping,
    &'a BuildContext,
) -> BoxFuture<'a, Result<Arc<dyn Loader>, ConfigError>>;

/// Builds a locator from `(strategy_id, params, context)`
pub type LocatorFactory = for<'a> fn(
    &'a str,
    &'a Mapping,
    &'a BuildContext,
) -> BoxFuture<'a, Result<Arc<dyn Locator>, ConfigError>>;

/// Builds a filter from `(strategy_id, params)`
pub type FilterFactory = fn(&str, &Mapping) -> Result<Arc<dyn ResourceFilter>, ConfigError>;

/// The three families of strategies a document can name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    Loader,
    Locator,
    Filter,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Loader => "loader",
            StrategyKind::Locator => "locator",
            StrategyKind::Filter => "filter",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Build context
// ============================================================================

/// Everything a factory may need besides its own parameters
pub struct BuildContext {
    protocols: ResolvedProtocols,
    credentials: Arc<dyn CredentialsProvider>,
    sftp_connector: Arc<dyn SftpConnector>,
    retry: RetryPolicy,
    http_clients: Mutex<HashMap<String, HttpClient>>,
}

impl BuildContext {
    pub fn new(
        protocols: ResolvedProtocols,
        credentials: Arc<dyn CredentialsProvider>,
        sftp_connector: Arc<dyn SftpConnector>,
    ) -> Self {
        Self {
            protocols,
            credentials,
            sftp_connector,
            retry: RetryPolicy::default(),
            http_clients: Mutex::new(HashMap::new()),
        }
    }

    /// Backoff used by built strategies; attempt budgets still come from
    /// each protocol config's `max_attempts`
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn protocols(&self) -> &ResolvedProtocols {
        &self.protocols
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Client for the HTTP config `name`.
    ///
    /// One client exists per config, so every strategy that references it
    /// shares the same rate limiter.
    pub fn http_client(&self, name: &str) -> Result<HttpClient, ConfigError> {
        let mut clients = self
            .http_clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(client) = clients.get(name) {
            return Ok(client.clone());
        }

        let client = HttpClient::from_config(self.protocols.http(name)?, self.retry)?;
        debug!(config = name, "Built HTTP client");
        clients.insert(name.to_string(), client.clone());
        Ok(client)
    }

    /// SFTP config `name` plus the credentials from its secret
    pub async fn sftp_credentials(
        &self,
        name: &str,
    ) -> Result<(SftpProtocolConfig, SftpCredentials), ConfigError> {
        let config = self.protocols.sftp(name)?.clone();
        let secret_name = config.secret_name();
        let secret = self.credentials.get_secret(&secret_name).await?;
        let credentials = SftpCredentials::from_secret(&secret_name, &secret)?;
        Ok((config, credentials))
    }

    pub fn sftp_connector(&self) -> Arc<dyn SftpConnector> {
        Arc::clone(&self.sftp_connector)
    }
}

/// Deserialize a strategy's parameters; failures name the strategy
pub fn parse_params<T: DeserializeOwned>(
    strategy_type: &str,
    strategy_id: &str,
    params: &Mapping,
) -> Result<T, ConfigError> {
    serde_yaml::from_value(Value::Mapping(params.clone())).map_err(|e| {
        ConfigError::InvalidStrategy {
            strategy_type: strategy_type.to_string(),
            strategy_id: strategy_id.to_string(),
            message: e.to_string(),
        }
    })
}

// ============================================================================
// Registry
// ============================================================================

/// Immutable map from strategy type to factory
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    loaders: HashMap<String, LoaderFactory>,
    locators: HashMap<String, LocatorFactory>,
    filters: HashMap<String, FilterFactory>,
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("loaders", &self.types(StrategyKind::Loader))
            .field("locators", &self.types(StrategyKind::Locator))
            .field("filters", &self.types(StrategyKind::Filter))
            .finish()
    }
}

impl StrategyRegistry {
    pub fn builder() -> StrategyRegistryBuilder {
        StrategyRegistryBuilder::default()
    }

    /// Registry with every built-in loader, locator and filter
    pub fn with_defaults() -> Self {
        Self::builder()
            .register_loader("http_loader", loader::http::factory)
            .register_loader("sftp_loader", loader::sftp::factory)
            .register_locator("single_http_locator", locator::http::single_factory)
            .register_locator("paginated_http_locator", locator::http::paginated_factory)
            .register_locator("date_range_http_locator", locator::http::date_range_factory)
            .register_locator("sftp_directory_locator", locator::sftp::directory_factory)
            .register_locator("sftp_file_locator", locator::sftp::file_factory)
            .register_filter("glob", locator::filter::glob_factory)
            .register_filter("regex", locator::filter::regex_factory)
            .register_filter("date", locator::filter::date_factory)
            .build()
    }

    pub fn contains(&self, kind: StrategyKind, strategy_type: &str) -> bool {
        match kind {
            StrategyKind::Loader => self.loaders.contains_key(strategy_type),
            StrategyKind::Locator => self.locators.contains_key(strategy_type),
            StrategyKind::Filter => self.filters.contains_key(strategy_type),
        }
    }

    /// Registered type names of one kind, sorted
    pub fn types(&self, kind: StrategyKind) -> Vec<&str> {
        let mut types: Vec<&str> = match kind {
            StrategyKind::Loader => self.loaders.keys().map(String::as_str).collect(),
            StrategyKind::Locator => self.locators.keys().map(String::as_str).collect(),
            StrategyKind::Filter => self.filters.keys().map(String::as_str).collect(),
        };
        types.sort_unstable();
        types
    }

    fn unknown(kind: StrategyKind, strategy_type: &str, strategy_id: &str) -> ConfigError {
        ConfigError::UnknownStrategy {
            kind: kind.to_string(),
            strategy_type: strategy_type.to_string(),
            strategy_id: strategy_id.to_string(),
        }
    }

    pub async fn create_loader(
        &self,
        strategy_type: &str,
        strategy_id: &str,
        params: &Mapping,
        ctx: &BuildContext,
    ) -> Result<Arc<dyn Loader>, ConfigError> {
        let factory = self
            .loaders
            .get(strategy_type)
            .ok_or_else(|| Self::unknown(StrategyKind::Loader, strategy_type, strategy_id))?;
        factory(strategy_id, params, ctx).await
    }

    pub async fn create_locator(
        &self,
        strategy_type: &str,
        strategy_id: &str,
        params: &Mapping,
        ctx: &BuildContext,
    ) -> Result<Arc<dyn Locator>, ConfigError> {
        let factory = self
            .locators
            .get(strategy_type)
            .ok_or_else(|| Self::unknown(StrategyKind::Locator, strategy_type, strategy_id))?;
        factory(strategy_id, params, ctx).await
    }

    pub fn create_filter(
        &self,
        strategy_type: &str,
        strategy_id: &str,
        params: &Mapping,
    ) -> Result<Arc<dyn ResourceFilter>, ConfigError> {
        let factory = self
            .filters
            .get(strategy_type)
            .ok_or_else(|| Self::unknown(StrategyKind::Filter, strategy_type, strategy_id))?;
        factory(strategy_id, params)
    }

    /// Build the loader a document declares
    pub async fn build_loader(
        &self,
        spec: &StrategySpec,
        ctx: &BuildContext,
    ) -> Result<Arc<dyn Loader>, ConfigError> {
        self.create_loader(&spec.strategy_type, &spec.strategy_id, &spec.params, ctx)
            .await
    }

    /// Build a locator decorated with its filters, bound to its state prefix
    pub async fn build_locator(
        &self,
        spec: &LocatorSpec,
        ctx: &BuildContext,
    ) -> Result<LocatorBinding, ConfigError> {
        let strategy = &spec.strategy;
        let mut locator = self
            .create_locator(&strategy.strategy_type, &strategy.strategy_id, &strategy.params, ctx)
            .await?;

        if !spec.filters.is_empty() {
            let filters = spec
                .filters
                .iter()
                .map(|f| self.create_filter(&f.strategy_type, &f.strategy_id, &f.params))
                .collect::<Result<Vec<_>, _>>()?;
            locator = Arc::new(FilteredLocator::new(locator, filters));
        }

        debug!(
            locator = %strategy.strategy_id,
            strategy_type = %strategy.strategy_type,
            filters = spec.filters.len(),
            "Built locator"
        );

        Ok(LocatorBinding::new(locator, spec.state_management_prefix.clone()))
    }
}

/// Collects factories before the registry is frozen
#[derive(Default)]
pub struct StrategyRegistryBuilder {
    registry: StrategyRegistry,
}

impl StrategyRegistryBuilder {
    pub fn register_loader(mut self, strategy_type: impl Into<String>, factory: LoaderFactory) -> Self {
        self.registry.loaders.insert(strategy_type.into(), factory);
        self
    }

    pub fn register_locator(
        mut self,
        strategy_type: impl Into<String>,
        factory: LocatorFactory,
    ) -> Self {
        self.registry.locators.insert(strategy_type.into(), factory);
        self
    }

    pub fn register_filter(mut self, strategy_type: impl Into<String>, factory: FilterFactory) -> Self {
        self.registry.filters.insert(strategy_type.into(), factory);
        self
    }

    pub fn build(self) -> StrategyRegistry {
        self.registry
    }
}
