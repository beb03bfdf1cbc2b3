//! Secret lookup behind a narrow capability

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::config::settings::DEFAULT_SFTP_PORT;
use crate::error::CredentialsError;

/// Named string fields of one secret
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretValue {
    fields: BTreeMap<String, String>,
}

// never print field values
impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretValue")
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SecretValue {
    pub fn new<K, V>(fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Parse a JSON object; scalar values are kept as strings
    pub fn from_json(name: &str, text: &str) -> Result<Self, CredentialsError> {
        let malformed = |message: String| CredentialsError::Malformed {
            name: name.to_string(),
            message,
        };

        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| malformed(e.to_string()))?;
        let object = value
            .as_object()
            .ok_or_else(|| malformed("expected a JSON object".to_string()))?;

        let mut fields = BTreeMap::new();
        for (key, value) in object {
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                serde_json::Value::Null => continue,
                _ => return Err(malformed(format!("field '{}' is not a scalar", key))),
            };
            fields.insert(key.clone(), text);
        }

        Ok(Self { fields })
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }
}

/// Source of secrets, resolved by name
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn get_secret(&self, name: &str) -> Result<SecretValue, CredentialsError>;
}

/// Reads each secret from an environment variable holding a JSON object.
///
/// The variable name is the optional prefix followed by the secret name
/// upper-cased with `-` and `.` replaced by `_`, so `us_fl-sftp-credentials`
/// is read from `US_FL_SFTP_CREDENTIALS`.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentialsProvider {
    prefix: Option<String>,
}

impl EnvCredentialsProvider {
    pub fn new(prefix: Option<String>) -> Self {
        Self { prefix }
    }

    pub fn variable_name(&self, secret_name: &str) -> String {
        let name: String = secret_name
            .chars()
            .map(|c| match c {
                '-' | '.' | '/' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        format!("{}{}", self.prefix.as_deref().unwrap_or_default(), name)
    }
}

#[async_trait]
impl CredentialsProvider for EnvCredentialsProvider {
    async fn get_secret(&self, name: &str) -> Result<SecretValue, CredentialsError> {
        let variable = self.variable_name(name);
        debug!(secret = %name, variable = %variable, "Reading secret from environment");
        let text =
            std::env::var(&variable).map_err(|_| CredentialsError::NotFound(name.to_string()))?;
        SecretValue::from_json(name, &text)
    }
}

/// Fixed in-memory secrets
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialsProvider {
    secrets: HashMap<String, SecretValue>,
}

impl StaticCredentialsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: SecretValue) -> Self {
        self.secrets.insert(name.into(), value);
        self
    }
}

#[async_trait]
impl CredentialsProvider for StaticCredentialsProvider {
    async fn get_secret(&self, name: &str) -> Result<SecretValue, CredentialsError> {
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| CredentialsError::NotFound(name.to_string()))
    }
}

/// Connection details carried by a `{name}-sftp-credentials` secret
#[derive(Clone, PartialEq, Eq)]
pub struct SftpCredentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for SftpCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl SftpCredentials {
    pub fn from_secret(name: &str, secret: &SecretValue) -> Result<Self, CredentialsError> {
        let field = |field: &str| {
            secret
                .get(field)
                .map(str::to_string)
                .ok_or_else(|| CredentialsError::MissingField {
                    name: name.to_string(),
                    field: field.to_string(),
                })
        };

        let port = match secret.get("port") {
            Some(port) => port.parse().map_err(|_| CredentialsError::Malformed {
                name: name.to_string(),
                message: format!("port '{}' is not a valid port number", port),
            })?,
            None => DEFAULT_SFTP_PORT,
        };

        Ok(Self {
            host: field("host")?,
            port,
            username: field("username")?,
            password: field("password")?,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
