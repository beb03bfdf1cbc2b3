//! Data-source configuration
//!
//! - [`settings`]: process settings from the environment
//! - [`model`]: resolved configuration types
//! - [`source`]: where documents are read from
//! - [`resolver`]: document parsing and protocol-reference resolution

pub mod model;
pub mod resolver;
pub mod settings;
pub mod source;

pub use model::{
    DataSourceConfig, FailurePolicy, HttpProtocolConfig, LocatorErrorPolicy, LocatorSpec,
    ProtocolConfig, ProtocolType, RateLimitConfig, ResolvedProtocols, SftpProtocolConfig,
    StrategySpec,
};
pub use resolver::{parse_document, ConfigResolver, ParsedDocument, CONFIG_FILE_NAME};
pub use settings::{Settings, StorageBackend};
pub use source::{ConfigSource, DirConfigSource, StoreConfigSource};
