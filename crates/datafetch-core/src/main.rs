//! Datafetch - config-driven resource fetcher

use anyhow::Result;
use clap::Parser;
use datafetch_common::logging::{init_logging, LogConfig, LogLevel};
use datafetch_core::config::settings::DEFAULT_STATE_PREFIX;
use datafetch_core::config::{
    ConfigSource, DirConfigSource, Settings, StorageBackend, StoreConfigSource,
};
use datafetch_core::credentials::EnvCredentialsProvider;
use datafetch_core::error::Classified;
use datafetch_core::kv::ObjectKeyValueStore;
use datafetch_core::publisher::FileQueue;
use datafetch_core::registry::StrategyRegistry;
use datafetch_core::runner::{FetchRunner, Services};
use datafetch_core::sftp::Ssh2Connector;
use datafetch_core::storage::{LocalObjectStore, ObjectStore, S3ObjectStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "datafetch")]
#[command(author, version, about = "Config-driven data fetcher")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Fetch one data source into a new bundle
    Run {
        /// Data source to fetch
        #[arg(long)]
        data_source_id: String,

        /// Directory with data-source documents (overrides DATAFETCH_CONFIG_DIR)
        #[arg(long)]
        config_dir: Option<PathBuf>,

        /// Stage root for bundles (overrides DATAFETCH_STAGE)
        #[arg(long)]
        stage: Option<String>,
    },

    /// Resolve a data source and build its strategies without fetching
    Check {
        #[arg(long)]
        data_source_id: String,

        #[arg(long)]
        config_dir: Option<PathBuf>,
    },
}

async fn services(settings: &Settings) -> Services {
    let store: Arc<dyn ObjectStore> = match settings.storage {
        StorageBackend::Local => Arc::new(LocalObjectStore::new(&settings.storage_path)),
        StorageBackend::S3 => Arc::new(S3ObjectStore::new(settings.s3.clone()).await),
    };

    let config_source: Arc<dyn ConfigSource> = match &settings.config_prefix {
        Some(prefix) => Arc::new(StoreConfigSource::new(Arc::clone(&store), prefix.clone())),
        None => Arc::new(DirConfigSource::new(&settings.config_dir)),
    };

    Services {
        config_source,
        state_store: Arc::new(ObjectKeyValueStore::new(Arc::clone(&store), DEFAULT_STATE_PREFIX)),
        store,
        credentials: Arc::new(EnvCredentialsProvider::new(settings.credentials_prefix.clone())),
        sftp: Arc::new(Ssh2Connector),
        queue: Arc::new(FileQueue::new(&settings.queue_file)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("datafetch".to_string())
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    let _guard = init_logging(&log_config)?;

    let settings = Settings::load()?;

    match cli.command {
        Command::Run {
            data_source_id,
            config_dir,
            stage,
        } => {
            let settings = settings.with_overrides(config_dir, stage)?;

            let runner = FetchRunner::new(
                services(&settings).await,
                StrategyRegistry::with_defaults(),
                settings.stage.clone(),
            );

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, stopping after in-flight fetches");
                    on_signal.cancel();
                }
            });

            let report = match runner.run_with_cancel(&data_source_id, cancel).await {
                Ok(report) => report,
                Err(e) => {
                    error!(data_source_id = %data_source_id, kind = %e.kind(), error = %e, "Run failed");
                    return Err(e.into());
                },
            };

            for warning in &report.warnings {
                warn!(bid = %report.bid, "{}", warning);
            }

            info!(
                bid = %report.bid,
                status = %report.status,
                resources = report.resources_count,
                failed = report.failed_count,
                location = %report.location,
                "Fetch complete"
            );

            if report.needs_reconciliation() {
                anyhow::bail!("Bundle {} is valid but state was not committed", report.bid);
            }
        },
        Command::Check {
            data_source_id,
            config_dir,
        } => {
            let settings = settings.with_overrides(config_dir, None)?;

            let runner = FetchRunner::new(
                services(&settings).await,
                StrategyRegistry::with_defaults(),
                settings.stage.clone(),
            );
            runner.check(&data_source_id).await?;
            info!(data_source_id = %data_source_id, "Check passed");
        },
    }

    Ok(())
}
