//! Classified errors for the fetch engine
//!
//! Every component boundary returns its own error type. [`FetchError`] is the
//! umbrella the runner reports, and [`classify`] is the single place that
//! decides whether an error kind is worth retrying.

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, FetchError>;

/// Whether a failure may succeed if the operation is repeated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Timeout, connection reset, rate limiting
    Transient,
    /// Authentication rejected, not found, corrupt or empty payload
    Permanent,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Component errors
// ============================================================================

/// Configuration could not be loaded, parsed or resolved
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config '{path}': {message}")]
    Read { path: String, message: String },

    #[error("Malformed config '{path}': {message}")]
    Malformed { path: String, message: String },

    #[error("Missing required field '{field}' in {context}")]
    MissingField { field: String, context: String },

    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Unresolved {protocol} config reference '{name}'")]
    UnresolvedReference { protocol: String, name: String },

    #[error("Unknown {kind} strategy type '{strategy_type}' (id '{strategy_id}')")]
    UnknownStrategy {
        kind: String,
        strategy_type: String,
        strategy_id: String,
    },

    #[error("Invalid {strategy_type} strategy '{strategy_id}': {message}")]
    InvalidStrategy {
        strategy_type: String,
        strategy_id: String,
        message: String,
    },

    #[error("Secret '{name}' unavailable: {message}")]
    Secret { name: String, message: String },
}

/// A locator could not list or page through its resources
#[derive(Error, Debug, Clone)]
#[error("Locator '{locator}' failed ({kind}): {message}")]
pub struct LocatorError {
    pub locator: String,
    pub kind: FailureKind,
    pub message: String,
}

impl LocatorError {
    pub fn new(locator: impl Into<String>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            kind,
            message: message.into(),
        }
    }
}

/// A single resource could not be retrieved
#[derive(Error, Debug, Clone)]
#[error("{kind} failure fetching '{address}' after {attempts} attempt(s): {message}")]
pub struct LoaderError {
    pub kind: FailureKind,
    pub address: String,
    pub message: String,
    pub attempts: u32,
}

impl LoaderError {
    pub fn transient(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            address: address.into(),
            message: message.into(),
            attempts: 1,
        }
    }

    pub fn permanent(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            address: address.into(),
            message: message.into(),
            attempts: 1,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

/// Object or key-value storage failure
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error on '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage backend error on '{key}': {message}")]
    Backend { key: String, message: String },

    #[error("Invalid object key '{0}'")]
    InvalidKey(String),

    #[error("Failed to encode '{key}': {message}")]
    Encoding { key: String, message: String },
}

/// The incremental state record could not be read or written
#[derive(Error, Debug)]
pub enum StateStoreError {
    #[error("Failed to read state for prefix '{prefix}': {message}")]
    Read { prefix: String, message: String },

    #[error("Failed to write state for prefix '{prefix}': {message}")]
    Write { prefix: String, message: String },

    #[error("Corrupt state record for prefix '{prefix}': {message}")]
    Corrupt { prefix: String, message: String },
}

/// A completion message could not be delivered
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Failed to send message to '{queue}': {message}")]
    Send { queue: String, message: String },

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A secret could not be obtained from the credentials provider
#[derive(Error, Debug, Clone)]
pub enum CredentialsError {
    #[error("Secret '{0}' not found")]
    NotFound(String),

    #[error("Secret '{name}' is malformed: {message}")]
    Malformed { name: String, message: String },

    #[error("Secret '{name}' is missing field '{field}'")]
    MissingField { name: String, field: String },
}

impl From<CredentialsError> for ConfigError {
    fn from(err: CredentialsError) -> Self {
        let name = match &err {
            CredentialsError::NotFound(name) => name.clone(),
            CredentialsError::Malformed { name, .. } => name.clone(),
            CredentialsError::MissingField { name, .. } => name.clone(),
        };
        ConfigError::Secret {
            name,
            message: err.to_string(),
        }
    }
}

// ============================================================================
// Umbrella error and classification
// ============================================================================

/// Any error that ends or degrades a run
#[derive(Error, Debug)]
pub enum FetchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Locator(#[from] LocatorError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    StateStore(#[from] StateStoreError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("Failure threshold exceeded: {failed} failed, {succeeded} succeeded ({reason})")]
    ThresholdExceeded {
        failed: usize,
        succeeded: usize,
        reason: String,
    },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Worker task failed: {0}")]
    TaskFailed(String),
}

/// Error kinds used for structured reporting and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    LocatorTransient,
    LocatorPermanent,
    LoaderTransient,
    LoaderPermanent,
    StorageTransient,
    StoragePermanent,
    StateRead,
    StateWrite,
    Publish,
    ThresholdExceeded,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config_error",
            ErrorKind::LocatorTransient => "locator_transient",
            ErrorKind::LocatorPermanent => "locator_permanent",
            ErrorKind::LoaderTransient => "loader_transient",
            ErrorKind::LoaderPermanent => "loader_permanent",
            ErrorKind::StorageTransient => "storage_transient",
            ErrorKind::StoragePermanent => "storage_permanent",
            ErrorKind::StateRead => "state_read",
            ErrorKind::StateWrite => "state_write",
            ErrorKind::Publish => "publish_error",
            ErrorKind::ThresholdExceeded => "threshold_exceeded",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`classify`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

/// Decide whether an error kind may be retried.
pub fn classify(kind: ErrorKind) -> ErrorClass {
    match kind {
        ErrorKind::LocatorTransient
        | ErrorKind::LoaderTransient
        | ErrorKind::StorageTransient
        | ErrorKind::StateWrite
        | ErrorKind::Publish => ErrorClass::Retryable,
        ErrorKind::Config
        | ErrorKind::LocatorPermanent
        | ErrorKind::LoaderPermanent
        | ErrorKind::StoragePermanent
        | ErrorKind::StateRead
        | ErrorKind::ThresholdExceeded
        | ErrorKind::Cancelled
        | ErrorKind::Internal => ErrorClass::Fatal,
    }
}

/// Errors that know their [`ErrorKind`]
pub trait Classified {
    fn kind(&self) -> ErrorKind;

    fn class(&self) -> ErrorClass {
        classify(self.kind())
    }
}

impl Classified for ConfigError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Config
    }
}

impl Classified for LocatorError {
    fn kind(&self) -> ErrorKind {
        match self.kind {
            FailureKind::Transient => ErrorKind::LocatorTransient,
            FailureKind::Permanent => ErrorKind::LocatorPermanent,
        }
    }
}

impl Classified for LoaderError {
    fn kind(&self) -> ErrorKind {
        match self.kind {
            FailureKind::Transient => ErrorKind::LoaderTransient,
            FailureKind::Permanent => ErrorKind::LoaderPermanent,
        }
    }
}

impl Classified for StorageError {
    fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Io { .. } | StorageError::Backend { .. } => ErrorKind::StorageTransient,
            StorageError::InvalidKey(_) | StorageError::Encoding { .. } => {
                ErrorKind::StoragePermanent
            },
        }
    }
}

impl Classified for StateStoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            StateStoreError::Write { .. } => ErrorKind::StateWrite,
            StateStoreError::Read { .. } | StateStoreError::Corrupt { .. } => ErrorKind::StateRead,
        }
    }
}

impl Classified for PublishError {
    fn kind(&self) -> ErrorKind {
        match self {
            PublishError::Send { .. } => ErrorKind::Publish,
            PublishError::Encode(_) => ErrorKind::Internal,
        }
    }
}

impl Classified for FetchError {
    fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Config(e) => e.kind(),
            FetchError::Locator(e) => e.kind(),
            FetchError::Loader(e) => e.kind(),
            FetchError::Storage(e) => e.kind(),
            FetchError::StateStore(e) => e.kind(),
            FetchError::Publish(e) => e.kind(),
            FetchError::ThresholdExceeded { .. } => ErrorKind::ThresholdExceeded,
            FetchError::Cancelled => ErrorKind::Cancelled,
            FetchError::TaskFailed(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loader_errors_classify_by_kind() {
        let transient = LoaderError::transient("https://x/a", "timed out");
        let permanent = LoaderError::permanent("https://x/a", "404 Not Found");
        assert_eq!(transient.class(), ErrorClass::Retryable);
        assert_eq!(permanent.class(), ErrorClass::Fatal);
        assert_eq!(FetchError::from(permanent).kind(), ErrorKind::LoaderPermanent);
    }

    #[test]
    fn test_state_read_is_fatal_but_write_is_retryable() {
        let read = StateStoreError::Read {
            prefix: "p".into(),
            message: "down".into(),
        };
        let write = StateStoreError::Write {
            prefix: "p".into(),
            message: "down".into(),
        };
        assert_eq!(read.class(), ErrorClass::Fatal);
        assert_eq!(write.class(), ErrorClass::Retryable);
    }

    #[test]
    fn test_storage_key_errors_are_not_retried() {
        assert_eq!(StorageError::InvalidKey("../x".into()).class(), ErrorClass::Fatal);
        let io = StorageError::Io {
            key: "k".into(),
            source: std::io::Error::other("disk"),
        };
        assert_eq!(io.class(), ErrorClass::Retryable);
    }

    #[test]
    fn test_credentials_error_becomes_config_error() {
        let err: ConfigError = CredentialsError::NotFound("fr-sftp-credentials".into()).into();
        match err {
            ConfigError::Secret { name, .. } => assert_eq!(name, "fr-sftp-credentials"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_error_display_names_context() {
        let err = ConfigError::UnknownStrategy {
            kind: "locator".into(),
            strategy_type: "ftp_locator".into(),
            strategy_id: "daily".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("ftp_locator"));
        assert!(msg.contains("daily"));
    }
}
