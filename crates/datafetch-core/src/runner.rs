//! End-to-end run of one data source
//!
//! resolve config → build strategies → snapshot state → fetch into a bundle →
//! seal the bundle → commit state → publish.

use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use datafetch_common::types::BundleStatus;

use crate::bundler::{BundleOutcome, Bundler};
use crate::config::{ConfigResolver, ConfigSource, DataSourceConfig};
use crate::credentials::CredentialsProvider;
use crate::error::{Classified, FetchError, PublishError, StateStoreError};
use crate::kv::KeyValueStore;
use crate::loader::Loader;
use crate::locator::LocatorBinding;
use crate::pipeline::{FetchPipeline, ResourceSink};
use crate::publisher::{BundleCompletedMessage, MessageQueue, Publisher};
use crate::registry::{BuildContext, StrategyRegistry};
use crate::retry::RetryPolicy;
use crate::sftp::SftpConnector;
use crate::state::StateTracker;
use crate::storage::ObjectStore;

/// External collaborators of a run
#[derive(Clone)]
pub struct Services {
    pub config_source: Arc<dyn ConfigSource>,
    pub store: Arc<dyn ObjectStore>,
    pub state_store: Arc<dyn KeyValueStore>,
    pub credentials: Arc<dyn CredentialsProvider>,
    pub sftp: Arc<dyn SftpConnector>,
    pub queue: Arc<dyn MessageQueue>,
}

/// Non-fatal problems after the bundle was sealed
#[derive(Debug)]
pub enum RunWarning {
    /// State could not be committed; the bundle is valid but the ids must be
    /// reconciled by hand
    StateReconciliation {
        prefix: String,
        identifiers: usize,
        error: StateStoreError,
    },
    /// The completion message was not delivered
    Publish(PublishError),
    /// The bundle completed but `_latest` still names an older one, so the
    /// next run cannot flag a repeat of this one as duplicate
    LatestPointer(String),
}

impl std::fmt::Display for RunWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunWarning::StateReconciliation {
                prefix,
                identifiers,
                error,
            } => write!(
                f,
                "state for '{}' not committed ({} identifiers): {}",
                prefix, identifiers, error
            ),
            RunWarning::Publish(e) => write!(f, "completion not published: {}", e),
            RunWarning::LatestPointer(e) => write!(f, "bundle hash pointer not updated: {}", e),
        }
    }
}

/// Summary of a successful run
#[derive(Debug)]
pub struct RunReport {
    pub data_source_id: String,
    pub run_id: String,
    pub bid: Uuid,
    pub status: BundleStatus,
    pub location: String,
    pub resources_count: usize,
    pub failed_count: usize,
    pub filtered_by_state: usize,
    pub skipped_locators: Vec<String>,
    pub bundle_hash: String,
    pub published: bool,
    pub warnings: Vec<RunWarning>,
}

impl RunReport {
    /// Whether the operator has to reconcile state by hand
    pub fn needs_reconciliation(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, RunWarning::StateReconciliation { .. }))
    }
}

/// Strategies built for a data source, ready to run
pub struct PreparedSource {
    pub config: DataSourceConfig,
    pub loader: Arc<dyn Loader>,
    pub locators: Vec<LocatorBinding>,
}

/// Identifier of one run, e.g. `fetcher_us_fl_20250101120000`
pub fn run_id(data_source_id: &str) -> String {
    format!(
        "fetcher_{}_{}",
        data_source_id,
        Utc::now().format("%Y%m%d%H%M%S")
    )
}

pub struct FetchRunner {
    services: Services,
    registry: StrategyRegistry,
    stage: String,
    retry: RetryPolicy,
}

impl FetchRunner {
    pub fn new(services: Services, registry: StrategyRegistry, stage: impl Into<String>) -> Self {
        Self {
            services,
            registry,
            stage: stage.into(),
            retry: RetryPolicy::default(),
        }
    }

    /// Backoff shared by strategies, storage, state and publishing
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Resolve the configuration and build every strategy it names
    #[instrument(skip(self))]
    pub async fn prepare(&self, data_source_id: &str) -> Result<PreparedSource, FetchError> {
        let resolver = ConfigResolver::new(Arc::clone(&self.services.config_source));
        let config = resolver.resolve(data_source_id, &self.registry).await?;

        let ctx = BuildContext::new(
            config.protocols.clone(),
            Arc::clone(&self.services.credentials),
            Arc::clone(&self.services.sftp),
        )
        .with_retry(self.retry);

        let loader = self.registry.build_loader(&config.loader, &ctx).await?;
        let mut locators = Vec::with_capacity(config.locators.len());
        for spec in &config.locators {
            locators.push(self.registry.build_locator(spec, &ctx).await?);
        }

        Ok(PreparedSource {
            config,
            loader,
            locators,
        })
    }

    /// Validate configuration and secrets without fetching anything
    pub async fn check(&self, data_source_id: &str) -> Result<PreparedSource, FetchError> {
        let prepared = self.prepare(data_source_id).await?;
        info!(
            data_source_id,
            loader = %prepared.loader.id(),
            locators = prepared.locators.len(),
            "Configuration is valid"
        );
        Ok(prepared)
    }

    pub async fn run(&self, data_source_id: &str) -> Result<RunReport, FetchError> {
        self.run_with_cancel(data_source_id, CancellationToken::new())
            .await
    }

    /// Run one data source to completion.
    ///
    /// Returns an error for config, state-read, locator, threshold, storage
    /// and cancellation failures. State-commit and publish failures after the
    /// bundle is sealed are reported as [`RunWarning`]s.
    #[instrument(skip(self, cancel), fields(run_id = tracing::field::Empty))]
    pub async fn run_with_cancel(
        &self,
        data_source_id: &str,
        cancel: CancellationToken,
    ) -> Result<RunReport, FetchError> {
        let run_id = run_id(data_source_id);
        tracing::Span::current().record("run_id", run_id.as_str());

        let PreparedSource {
            config,
            loader,
            locators,
        } = self.prepare(data_source_id).await?;

        let tracker = StateTracker::new(Arc::clone(&self.services.state_store)).with_retry(self.retry);
        let snapshot = tracker.snapshot_all(config.state_prefixes()).await?;

        let bundler = Bundler::new(Arc::clone(&self.services.store), self.stage.clone())
            .with_retry(self.retry);
        let bundle = Arc::new(bundler.open(data_source_id, &run_id));

        let report = FetchPipeline::from_config(&config)
            .run(
                locators,
                loader,
                Arc::new(snapshot),
                Arc::clone(&bundle) as Arc<dyn ResourceSink>,
                cancel,
            )
            .await;

        if let Some(abort) = report.abort {
            error!(bid = %bundle.bid(), kind = %abort.kind(), error = %abort, "Run aborted");
            if let Err(e) = bundle.mark_failed(&abort.to_string()).await {
                error!(bid = %bundle.bid(), error = %e, "Failed to mark bundle failed");
            }
            return Err(abort);
        }

        let outcome = bundle.finish().await?;
        let mut warnings = self.commit_state(&tracker, &outcome).await;
        if let Some(e) = &outcome.latest_error {
            warnings.push(RunWarning::LatestPointer(e.clone()));
        }

        let message = BundleCompletedMessage {
            bid: outcome.bid,
            data_source_id: data_source_id.to_string(),
            stage: self.stage.clone(),
            run_id: run_id.clone(),
            location: outcome.location.clone(),
            resources_count: outcome.resources_count,
            status: outcome.status,
            bundle_hash: outcome.bundle_hash.clone(),
        };
        let publisher = Publisher::new(Arc::clone(&self.services.queue)).with_retry(self.retry);
        let published = match publisher.publish(&message).await {
            Ok(()) => true,
            Err(e) => {
                warn!(bid = %outcome.bid, error = %e, "Completion message not delivered");
                warnings.push(RunWarning::Publish(e));
                false
            },
        };

        info!(
            bid = %outcome.bid,
            status = %outcome.status,
            resources = outcome.resources_count,
            failed = outcome.failed_count,
            filtered_by_state = report.filtered_by_state,
            warnings = warnings.len(),
            "Run finished"
        );

        Ok(RunReport {
            data_source_id: data_source_id.to_string(),
            run_id,
            bid: outcome.bid,
            status: outcome.status,
            location: outcome.location,
            resources_count: outcome.resources_count,
            failed_count: outcome.failed_count,
            filtered_by_state: report.filtered_by_state,
            skipped_locators: report.skipped_locators,
            bundle_hash: outcome.bundle_hash,
            published,
            warnings,
        })
    }

    async fn commit_state(&self, tracker: &StateTracker, outcome: &BundleOutcome) -> Vec<RunWarning> {
        let mut warnings = Vec::new();
        for (prefix, ids) in &outcome.processed {
            match tracker.commit(prefix, ids).await {
                Ok(total) => info!(prefix = %prefix, new = ids.len(), total, "Committed state"),
                Err(e) => {
                    error!(
                        bid = %outcome.bid,
                        prefix = %prefix,
                        identifiers = ids.len(),
                        error = %e,
                        "State commit failed; bundle is valid, reconcile state manually"
                    );
                    warnings.push(RunWarning::StateReconciliation {
                        prefix: prefix.clone(),
                        identifiers: ids.len(),
                        error: e,
                    });
                },
            }
        }
        warnings
    }
}
