//! Turns a data-source document into a [`DataSourceConfig`]
//!
//! Resolution reads the root document and every protocol file it references,
//! and either returns a config in which every reference is loaded or fails
//! with a [`ConfigError`]. Nothing else is touched.

use serde_yaml::{Mapping, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::model::{
    DataSourceConfig, FailurePolicy, HttpProtocolConfig, LocatorErrorPolicy, LocatorSpec,
    ProtocolConfig, ProtocolType, ResolvedProtocols, SftpProtocolConfig, StrategySpec,
};
use super::settings::{DEFAULT_CONCURRENCY, DEFAULT_TARGET_QUEUE_SIZE};
use super::source::ConfigSource;
use crate::error::ConfigError;
use crate::registry::{StrategyKind, StrategyRegistry};

/// File name of the root document inside a data source's config directory
pub const CONFIG_FILE_NAME: &str = "fetcher.yaml";

/// A protocol file the document declares but that has not been loaded yet
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolRef {
    pub protocol: ProtocolType,
    pub name: String,
    pub path: String,
}

/// Root document after parsing, before protocol files are loaded
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDocument {
    pub data_source_id: String,
    pub concurrency: usize,
    pub target_queue_size: usize,
    pub on_locator_error: LocatorErrorPolicy,
    pub failure_policy: FailurePolicy,
    pub loader: StrategySpec,
    pub locators: Vec<LocatorSpec>,
    pub protocol_refs: Vec<ProtocolRef>,
}

/// Loads and resolves data-source configurations from a [`ConfigSource`]
#[derive(Clone)]
pub struct ConfigResolver {
    source: Arc<dyn ConfigSource>,
}

impl ConfigResolver {
    pub fn new(source: Arc<dyn ConfigSource>) -> Self {
        Self { source }
    }

    /// Relative path of a data source's root document
    pub fn document_path(data_source_id: &str) -> String {
        format!("{}/{}", data_source_id, CONFIG_FILE_NAME)
    }

    /// Resolve the configuration of `data_source_id`
    #[instrument(skip(self, registry))]
    pub async fn resolve(
        &self,
        data_source_id: &str,
        registry: &StrategyRegistry,
    ) -> Result<DataSourceConfig, ConfigError> {
        let path = Self::document_path(data_source_id);
        let text = self.source.read(&path).await?;
        let document = parse_document(&text, &self.source.describe(&path), registry)?;

        if document.data_source_id != data_source_id {
            return Err(ConfigError::InvalidValue {
                field: "data_source_id".to_string(),
                message: format!(
                    "document at {} declares '{}', expected '{}'",
                    path, document.data_source_id, data_source_id
                ),
            });
        }

        let mut protocols = ResolvedProtocols::default();
        for reference in &document.protocol_refs {
            let config = self.load_protocol(reference).await?;
            protocols.insert(config);
        }

        check_references(&document, &protocols)?;

        info!(
            data_source_id = %document.data_source_id,
            locators = document.locators.len(),
            protocols = document.protocol_refs.len(),
            "Resolved data source configuration"
        );

        Ok(DataSourceConfig {
            data_source_id: document.data_source_id,
            concurrency: document.concurrency,
            target_queue_size: document.target_queue_size,
            on_locator_error: document.on_locator_error,
            failure_policy: document.failure_policy,
            loader: document.loader,
            locators: document.locators,
            protocols,
        })
    }

    async fn load_protocol(&self, reference: &ProtocolRef) -> Result<ProtocolConfig, ConfigError> {
        debug!(
            protocol = %reference.protocol,
            name = %reference.name,
            path = %reference.path,
            "Loading protocol config"
        );

        let text = self.source.read(&reference.path).await?;
        let malformed = |e: serde_yaml::Error| ConfigError::Malformed {
            path: self.source.describe(&reference.path),
            message: e.to_string(),
        };

        // An empty file is a valid config made of defaults
        let text = if text.trim().is_empty() { "{}" } else { text.as_str() };

        let config = match reference.protocol {
            ProtocolType::Http => {
                let mut config: HttpProtocolConfig = serde_yaml::from_str(text).map_err(malformed)?;
                config.name = reference.name.clone();
                if let Some(base) = &config.base_url {
                    url::Url::parse(base).map_err(|e| ConfigError::InvalidValue {
                        field: format!("{}.base_url", reference.name),
                        message: e.to_string(),
                    })?;
                }
                ProtocolConfig::Http(config)
            },
            ProtocolType::Sftp => {
                let mut config: SftpProtocolConfig = serde_yaml::from_str(text).map_err(malformed)?;
                config.name = reference.name.clone();
                ProtocolConfig::Sftp(config)
            },
        };

        Ok(config)
    }
}

/// Parse and validate a root document without touching any protocol file.
pub fn parse_document(
    text: &str,
    path: &str,
    registry: &StrategyRegistry,
) -> Result<ParsedDocument, ConfigError> {
    let root: Value = serde_yaml::from_str(text).map_err(|e| ConfigError::Malformed {
        path: path.to_string(),
        message: e.to_string(),
    })?;
    let root = root.as_mapping().ok_or_else(|| ConfigError::Malformed {
        path: path.to_string(),
        message: "document root must be a mapping".to_string(),
    })?;

    let data_source_id = required(root, "data_source_id", path)?
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ConfigError::InvalidValue {
            field: "data_source_id".to_string(),
            message: "must be a non-empty string".to_string(),
        })?
        .to_string();

    let concurrency = positive_or_default(root, "concurrency", DEFAULT_CONCURRENCY)?;
    let target_queue_size =
        positive_or_default(root, "target_queue_size", DEFAULT_TARGET_QUEUE_SIZE)?;

    let on_locator_error: LocatorErrorPolicy = optional_typed(root, "on_locator_error", path)?;
    let failure_policy: FailurePolicy = optional_typed(root, "failure_policy", path)?;
    if let Some(ratio) = failure_policy.min_success_ratio {
        if !(0.0..=1.0).contains(&ratio) {
            return Err(ConfigError::InvalidValue {
                field: "failure_policy.min_success_ratio".to_string(),
                message: format!("{} is outside 0.0..=1.0", ratio),
            });
        }
    }

    // Loader
    let (loader_type, mut loader_params) =
        strategy_entry(required(root, "loader", path)?, "loader")?;
    let loader_id = match loader_params.remove("meta_load_name") {
        Some(Value::String(name)) if !name.is_empty() => name,
        _ => loader_type.clone(),
    };
    ensure_known(registry, StrategyKind::Loader, &loader_type, &loader_id)?;
    let loader = StrategySpec {
        strategy_type: loader_type,
        strategy_id: loader_id,
        params: loader_params,
    };

    // Locators
    let locator_values = required(root, "locators", path)?
        .as_sequence()
        .ok_or_else(|| ConfigError::InvalidValue {
            field: "locators".to_string(),
            message: "must be a list".to_string(),
        })?;
    if locator_values.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "locators".to_string(),
            message: "at least one locator is required".to_string(),
        });
    }

    let mut locators = Vec::with_capacity(locator_values.len());
    let mut taken_ids = HashSet::new();
    for (index, value) in locator_values.iter().enumerate() {
        locators.push(parse_locator(value, index, &mut taken_ids, registry)?);
    }

    let protocol_refs = parse_protocols(root.get("protocols"))?;

    Ok(ParsedDocument {
        data_source_id,
        concurrency,
        target_queue_size,
        on_locator_error,
        failure_policy,
        loader,
        locators,
        protocol_refs,
    })
}

/// Locator ids come from `id`, then the state prefix, then the type; an id
/// already taken by an earlier locator gets the locator's index appended
fn parse_locator(
    value: &Value,
    index: usize,
    taken_ids: &mut HashSet<String>,
    registry: &StrategyRegistry,
) -> Result<LocatorSpec, ConfigError> {
    let context = format!("locators[{}]", index);
    let (strategy_type, mut params) = strategy_entry(value, &context)?;

    let state_management_prefix = match params.remove("state_management_prefix") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(_) => {
            return Err(ConfigError::InvalidValue {
                field: format!("{}.state_management_prefix", context),
                message: "must be a non-empty string".to_string(),
            })
        },
    };

    let mut strategy_id = match params.remove("id") {
        Some(Value::String(id)) if !id.is_empty() => id,
        _ => state_management_prefix
            .clone()
            .unwrap_or_else(|| format!("{}_{}", strategy_type, index)),
    };
    if taken_ids.contains(&strategy_id) {
        strategy_id = format!("{}_{}", strategy_id, index);
    }
    taken_ids.insert(strategy_id.clone());

    ensure_known(registry, StrategyKind::Locator, &strategy_type, &strategy_id)?;

    let filters = match params.remove("file_filter") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Sequence(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| parse_filter(item, &strategy_id, i, registry))
            .collect::<Result<Vec<_>, _>>()?,
        Some(item) => vec![parse_filter(&item, &strategy_id, 0, registry)?],
    };

    Ok(LocatorSpec {
        strategy: StrategySpec {
            strategy_type,
            strategy_id,
            params,
        },
        filters,
        state_management_prefix,
    })
}

fn parse_filter(
    value: &Value,
    locator_id: &str,
    index: usize,
    registry: &StrategyRegistry,
) -> Result<StrategySpec, ConfigError> {
    let context = format!("{}.file_filter[{}]", locator_id, index);
    let mut params = value.as_mapping().cloned().ok_or_else(|| ConfigError::InvalidValue {
        field: context.clone(),
        message: "filter must be a mapping with a 'type' key".to_string(),
    })?;

    let filter_type = match params.remove("type") {
        Some(Value::String(t)) => t,
        _ => {
            return Err(ConfigError::MissingField {
                field: "type".to_string(),
                context,
            })
        },
    };

    ensure_known(registry, StrategyKind::Filter, &filter_type, &context)?;

    Ok(StrategySpec {
        strategy_type: filter_type,
        strategy_id: context,
        params,
    })
}

fn parse_protocols(value: Option<&Value>) -> Result<Vec<ProtocolRef>, ConfigError> {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return Ok(Vec::new());
    };

    let sections = value.as_mapping().ok_or_else(|| ConfigError::InvalidValue {
        field: "protocols".to_string(),
        message: "must map protocol type to named config paths".to_string(),
    })?;

    let mut refs = Vec::new();
    for (protocol_key, entries) in sections {
        let protocol_name = protocol_key.as_str().unwrap_or_default();
        let protocol =
            ProtocolType::from_name(protocol_name).ok_or_else(|| ConfigError::InvalidValue {
                field: "protocols".to_string(),
                message: format!("unknown protocol type '{}'", protocol_name),
            })?;

        let entries = entries.as_mapping().ok_or_else(|| ConfigError::InvalidValue {
            field: format!("protocols.{}", protocol),
            message: "must map reference names to relative paths".to_string(),
        })?;

        for (name, path) in entries {
            let name = name.as_str().unwrap_or_default();
            let path = path.as_str().ok_or_else(|| ConfigError::InvalidValue {
                field: format!("protocols.{}.{}", protocol, name),
                message: "must be a relative path".to_string(),
            })?;
            refs.push(ProtocolRef {
                protocol,
                name: name.to_string(),
                path: path.to_string(),
            });
        }
    }

    Ok(refs)
}

/// Every `<protocol>_config` reference in a strategy must name a loaded config
fn check_references(
    document: &ParsedDocument,
    protocols: &ResolvedProtocols,
) -> Result<(), ConfigError> {
    let strategies = std::iter::once(&document.loader)
        .chain(document.locators.iter().map(|l| &l.strategy));

    for strategy in strategies {
        for protocol in ProtocolType::all() {
            let Some(reference) = strategy.params.get(protocol.reference_key()) else {
                continue;
            };
            let name = reference.as_str().ok_or_else(|| ConfigError::InvalidValue {
                field: format!("{}.{}", strategy.strategy_id, protocol.reference_key()),
                message: "must be a reference name".to_string(),
            })?;
            if !protocols.contains(protocol, name) {
                return Err(ConfigError::UnresolvedReference {
                    protocol: protocol.to_string(),
                    name: name.to_string(),
                });
            }
        }
    }

    Ok(())
}

fn ensure_known(
    registry: &StrategyRegistry,
    kind: StrategyKind,
    strategy_type: &str,
    strategy_id: &str,
) -> Result<(), ConfigError> {
    if registry.contains(kind, strategy_type) {
        Ok(())
    } else {
        Err(ConfigError::UnknownStrategy {
            kind: kind.to_string(),
            strategy_type: strategy_type.to_string(),
            strategy_id: strategy_id.to_string(),
        })
    }
}

fn required<'a>(root: &'a Mapping, field: &str, context: &str) -> Result<&'a Value, ConfigError> {
    match root.get(field) {
        Some(value) if !value.is_null() => Ok(value),
        _ => Err(ConfigError::MissingField {
            field: field.to_string(),
            context: context.to_string(),
        }),
    }
}

fn positive_or_default(root: &Mapping, field: &str, default: usize) -> Result<usize, ConfigError> {
    match root.get(field) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value
            .as_u64()
            .filter(|n| *n >= 1)
            .map(|n| n as usize)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: field.to_string(),
                message: format!("must be an integer >= 1, got {:?}", value),
            }),
    }
}

fn optional_typed<T>(root: &Mapping, field: &str, path: &str) -> Result<T, ConfigError>
where
    T: serde::de::DeserializeOwned + Default,
{
    match root.get(field) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_yaml::from_value(value.clone()).map_err(|e| ConfigError::Malformed {
            path: path.to_string(),
            message: format!("{}: {}", field, e),
        }),
    }
}

/// Split a `{ <type>: { params } }` section into its type and parameters
pub(crate) fn strategy_entry(value: &Value, context: &str) -> Result<(String, Mapping), ConfigError> {
    let mapping = value.as_mapping().ok_or_else(|| ConfigError::InvalidValue {
        field: context.to_string(),
        message: "must be a single-key mapping of strategy type to parameters".to_string(),
    })?;

    let mut entries = mapping.iter();
    let (Some((key, params)), None) = (entries.next(), entries.next()) else {
        return Err(ConfigError::InvalidValue {
            field: context.to_string(),
            message: format!("expected exactly one strategy type, found {}", mapping.len()),
        });
    };

    let strategy_type = key.as_str().ok_or_else(|| ConfigError::InvalidValue {
        field: context.to_string(),
        message: "strategy type must be a string".to_string(),
    })?;

    let params = match params {
        Value::Null => Mapping::new(),
        Value::Mapping(m) => m.clone(),
        _ => {
            return Err(ConfigError::InvalidValue {
                field: format!("{}.{}", context, strategy_type),
                message: "parameters must be a mapping".to_string(),
            })
        },
    };

    Ok((strategy_type.to_string(), params))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::source::DirConfigSource;

    const DOCUMENT: &str = r#"
data_source_id: us_fl
concurrency: 2
loader:
  sftp_loader: { meta_load_name: us_fl_sftp, sftp_config: us_fl }
locators:
  - sftp_directory_locator:
      sftp_config: us_fl
      remote_dir: /doc/cor
      file_filter: { type: glob, pattern: "*.txt" }
      state_management_prefix: us_fl_daily
  - date_range_http_locator:
      http_config: fr_api
      url_template: "https://example.org/daily/{date}.csv"
      start_date: "2023-06-01"
      file_filter:
        - { type: regex, pattern: "csv$" }
        - { type: date, start_date: "2023-06-01" }
protocols:
  sftp: { us_fl: sftp/us_fl.yaml }
  http: { fr_api: http/fr_api.yaml }
"#;

    fn write_tree(document: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("us_fl")).unwrap();
        std::fs::create_dir_all(root.join("sftp")).unwrap();
        std::fs::create_dir_all(root.join("http")).unwrap();
        std::fs::write(root.join("us_fl/fetcher.yaml"), document).unwrap();
        std::fs::write(root.join("sftp/us_fl.yaml"), "connect_timeout_secs: 5\n").unwrap();
        std::fs::write(
            root.join("http/fr_api.yaml"),
            "base_url: https://example.org\nheaders: { Accept: text/csv }\n",
        )
        .unwrap();
        dir
    }

    fn resolver(dir: &tempfile::TempDir) -> ConfigResolver {
        ConfigResolver::new(Arc::new(DirConfigSource::new(dir.path())))
    }

    #[tokio::test]
    async fn test_resolves_every_reference() {
        let dir = write_tree(DOCUMENT);
        let registry = StrategyRegistry::with_defaults();
        let config = resolver(&dir).resolve("us_fl", &registry).await.unwrap();

        assert_eq!(config.data_source_id, "us_fl");
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.target_queue_size, DEFAULT_TARGET_QUEUE_SIZE);
        assert_eq!(config.loader.strategy_id, "us_fl_sftp");
        assert_eq!(config.locators.len(), 2);
        assert_eq!(config.locators[0].strategy.strategy_id, "us_fl_daily");
        assert_eq!(config.locators[0].filters.len(), 1);
        assert_eq!(config.locators[1].filters.len(), 2);
        assert_eq!(config.protocols.sftp("us_fl").unwrap().connect_timeout_secs, 5);
        assert_eq!(
            config.protocols.http("fr_api").unwrap().headers.get("Accept").unwrap(),
            "text/csv"
        );
        assert_eq!(config.state_prefixes(), vec!["us_fl_daily".to_string()]);
    }

    #[tokio::test]
    async fn test_unresolved_reference_fails() {
        let document = DOCUMENT.replace("http: { fr_api: http/fr_api.yaml }", "");
        let dir = write_tree(&document);
        let registry = StrategyRegistry::with_defaults();
        let err = resolver(&dir).resolve("us_fl", &registry).await.unwrap_err();
        assert!(matches!(err, ConfigError::UnresolvedReference { ref name, .. } if name == "fr_api"));
    }

    #[tokio::test]
    async fn test_missing_protocol_file_fails() {
        let dir = write_tree(DOCUMENT);
        std::fs::remove_file(dir.path().join("http/fr_api.yaml")).unwrap();
        let registry = StrategyRegistry::with_defaults();
        let err = resolver(&dir).resolve("us_fl", &registry).await.unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_unknown_strategy_type_names_type_and_id() {
        let document = DOCUMENT.replace("sftp_directory_locator", "ftp_directory_locator");
        let registry = StrategyRegistry::with_defaults();
        let err = parse_document(&document, "mem", &registry).unwrap_err();
        match err {
            ConfigError::UnknownStrategy {
                strategy_type,
                strategy_id,
                ..
            } => {
                assert_eq!(strategy_type, "ftp_directory_locator");
                assert_eq!(strategy_id, "us_fl_daily");
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_missing_required_field() {
        let registry = StrategyRegistry::with_defaults();
        let err = parse_document("data_source_id: x\nlocators: []\n", "mem", &registry).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { ref field, .. } if field == "loader"));
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let document = DOCUMENT.replace("concurrency: 2", "concurrency: 0");
        let registry = StrategyRegistry::with_defaults();
        let err = parse_document(&document, "mem", &registry).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "concurrency"));
    }

    #[test]
    fn test_malformed_yaml() {
        let registry = StrategyRegistry::with_defaults();
        let err = parse_document("data_source_id: [unclosed", "mem", &registry).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { .. }));
    }

    #[test]
    fn test_strategy_entry_requires_single_key() {
        let value: Value = serde_yaml::from_str("{ a: {}, b: {} }").unwrap();
        assert!(strategy_entry(&value, "loader").is_err());
        let value: Value = serde_yaml::from_str("{ http_loader: }").unwrap();
        let (kind, params) = strategy_entry(&value, "loader").unwrap();
        assert_eq!(kind, "http_loader");
        assert!(params.is_empty());
    }

    #[test]
    fn test_locators_sharing_a_prefix_get_distinct_ids() {
        let document = r#"
data_source_id: us_fl
loader:
  sftp_loader: { sftp_config: us_fl }
locators:
  - sftp_directory_locator: { sftp_config: us_fl, remote_dir: /a, state_management_prefix: daily }
  - sftp_directory_locator: { sftp_config: us_fl, remote_dir: /b, state_management_prefix: daily }
  - sftp_file_locator: { sftp_config: us_fl, path: /c.txt, id: daily }
"#;
        let registry = StrategyRegistry::with_defaults();
        let parsed = parse_document(document, "mem", &registry).unwrap();
        let ids: Vec<&str> = parsed
            .locators
            .iter()
            .map(|l| l.strategy.strategy_id.as_str())
            .collect();
        assert_eq!(ids, vec!["daily", "daily_1", "daily_2"]);
        assert_eq!(parsed.loader.strategy_id, "sftp_loader");
    }

    #[test]
    fn test_consumed_keys_are_not_passed_to_factories() {
        let registry = StrategyRegistry::with_defaults();
        let parsed = parse_document(DOCUMENT, "mem", &registry).unwrap();
        assert!(parsed.loader.params.get("meta_load_name").is_none());
        let params = &parsed.locators[0].strategy.params;
        assert!(params.get("state_management_prefix").is_none());
        assert!(params.get("file_filter").is_none());
        assert_eq!(params.len(), 2);
    }

    #[tokio::test]
    async fn test_mismatched_data_source_id() {
        let dir = write_tree(DOCUMENT);
        std::fs::create_dir_all(dir.path().join("other")).unwrap();
        std::fs::write(dir.path().join("other/fetcher.yaml"), DOCUMENT).unwrap();
        let registry = StrategyRegistry::with_defaults();
        let err = resolver(&dir).resolve("other", &registry).await.unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
