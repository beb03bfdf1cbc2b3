//! Tracing setup shared by the datafetch binaries
//!
//! [`init_logging`] installs one global subscriber with a console layer, a
//! daily-rotated file layer, or both. Fetch code never prints; it emits
//! structured events keyed by the ids an operator greps for:
//!
//! ```rust,ignore
//! info!(data_source_id = %id, bid = %bid, resources = count, "Bundle completed");
//! warn!(address = %address, attempt, error = %err, "Transient fetch failure, retrying");
//! ```
//!
//! ```no_run
//! use datafetch_common::logging::{init_logging, LogConfig};
//!
//! let config = LogConfig::from_env().unwrap_or_default();
//! let _guard = init_logging(&config).expect("logging");
//! ```

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::{self, format::FmtSpan};
use tracing_subscriber::prelude::*;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{EnvFilter, Registry};

/// Environment variables read by [`LogConfig::merge_env`]
pub const ENV_LEVEL: &str = "DATAFETCH_LOG_LEVEL";
pub const ENV_OUTPUT: &str = "DATAFETCH_LOG_OUTPUT";
pub const ENV_FORMAT: &str = "DATAFETCH_LOG_FORMAT";
pub const ENV_DIR: &str = "DATAFETCH_LOG_DIR";
pub const ENV_FILTER: &str = "DATAFETCH_LOG_FILTER";
pub const ENV_SOURCE_LOCATION: &str = "DATAFETCH_LOG_SOURCE_LOCATION";

/// Looks `s` up case-insensitively in a table of accepted spellings
fn lookup<T: Copy>(what: &str, s: &str, table: &[(&str, T)]) -> Result<T> {
    let wanted = s.trim().to_ascii_lowercase();
    table
        .iter()
        .find(|(name, _)| *name == wanted)
        .map(|(_, value)| *value)
        .ok_or_else(|| anyhow!("unknown {} '{}'", what, s))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        lookup(
            "log level",
            s,
            &[
                ("trace", LogLevel::Trace),
                ("debug", LogLevel::Debug),
                ("info", LogLevel::Info),
                ("warn", LogLevel::Warn),
                ("warning", LogLevel::Warn),
                ("error", LogLevel::Error),
            ],
        )
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Level::from(*self))
    }
}

/// Where events are written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

impl LogOutput {
    fn to_console(self) -> bool {
        self != LogOutput::File
    }

    fn to_file(self) -> bool {
        self != LogOutput::Console
    }
}

impl FromStr for LogOutput {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        lookup(
            "log output",
            s,
            &[
                ("console", LogOutput::Console),
                ("stdout", LogOutput::Console),
                ("file", LogOutput::File),
                ("both", LogOutput::Both),
            ],
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per event, for log shippers
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        lookup("log format", s, &[("text", LogFormat::Text), ("json", LogFormat::Json)])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    pub output: LogOutput,
    pub format: LogFormat,

    /// Directory for rotated files; unused for console-only output
    pub log_dir: PathBuf,

    /// File name stem, e.g. "datafetch" gives "datafetch.2024-01-18"
    pub log_file_prefix: String,

    /// Extra `EnvFilter` directives, e.g. "datafetch_core=debug,aws_smithy_runtime=warn"
    pub filter_directives: Option<String>,

    /// Adds file and line to every event
    pub source_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            output: LogOutput::Console,
            format: LogFormat::Text,
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: "datafetch".to_string(),
            filter_directives: None,
            source_location: false,
        }
    }
}

/// Parses the variable `key` when set, leaving `target` untouched otherwise
fn env_override<T>(key: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = std::env::var(key) {
        *target = raw
            .parse()
            .map_err(|e| anyhow!("{}={}: {}", key, raw, e))?;
    }
    Ok(())
}

impl LogConfig {
    pub fn from_env() -> Result<Self> {
        Self::default().merge_env()
    }

    /// Applies the `DATAFETCH_LOG_*` variables on top of `self`
    pub fn merge_env(mut self) -> Result<Self> {
        env_override(ENV_LEVEL, &mut self.level)?;
        env_override(ENV_OUTPUT, &mut self.output)?;
        env_override(ENV_FORMAT, &mut self.format)?;
        env_override(ENV_DIR, &mut self.log_dir)?;
        env_override(ENV_SOURCE_LOCATION, &mut self.source_location)?;
        if let Ok(filter) = std::env::var(ENV_FILTER) {
            self.filter_directives = Some(filter);
        }
        Ok(self)
    }

    pub fn builder() -> LogConfigBuilder {
        LogConfigBuilder::default()
    }

    /// `RUST_LOG` first, then the configured level, then any extra directives
    fn env_filter(&self) -> Result<EnvFilter> {
        let level: Level = self.level.into();
        let mut filter = EnvFilter::from_default_env().add_directive(level.into());

        let extra = self.filter_directives.as_deref().unwrap_or_default();
        for directive in extra.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            let parsed = directive
                .parse::<Directive>()
                .with_context(|| format!("invalid log filter directive '{}'", directive))?;
            filter = filter.add_directive(parsed);
        }
        Ok(filter)
    }
}

#[derive(Default)]
pub struct LogConfigBuilder {
    config: LogConfig,
}

impl LogConfigBuilder {
    pub fn level(mut self, level: LogLevel) -> Self {
        self.config.level = level;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.config.output = output;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.config.format = format;
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.log_dir = dir.into();
        self
    }

    pub fn log_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.log_file_prefix = prefix.into();
        self
    }

    pub fn filter_directives(mut self, filter: impl Into<String>) -> Self {
        self.config.filter_directives = Some(filter.into());
        self
    }

    pub fn build(self) -> LogConfig {
        self.config
    }
}

/// Flushes the file writer when dropped; hold it until the process exits
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

type BoxedLayer = Box<dyn tracing_subscriber::Layer<Registry> + Send + Sync>;

fn event_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_file(config.source_location)
        .with_line_number(config.source_location)
        // closing spans carry the busy/idle timings of each fetch
        .with_span_events(FmtSpan::CLOSE);

    match config.format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuard> {
    let filter = config.env_filter()?;
    let mut layers = Vec::<BoxedLayer>::new();
    let mut file = None;

    if config.output.to_console() {
        layers.push(event_layer(config, std::io::stdout, true));
    }
    if config.output.to_file() {
        std::fs::create_dir_all(&config.log_dir)
            .with_context(|| format!("cannot create log dir {}", config.log_dir.display()))?;
        let rolling = tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix);
        let (writer, guard) = tracing_appender::non_blocking(rolling);
        layers.push(event_layer(config, writer, false));
        file = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("tracing subscriber already installed")?;

    Ok(LoggingGuard { _file: file })
}
