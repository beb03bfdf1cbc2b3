//! Producer/worker fetch engine
//!
//! One producer task walks the locators and feeds a bounded queue of
//! `target_queue_size`; `concurrency` workers drain it through the loader and
//! hand results to a [`ResourceSink`]. A full queue blocks the producer, an
//! empty one parks the workers until the producer is done.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use datafetch_common::types::ResourceDescriptor;

use crate::config::{DataSourceConfig, FailurePolicy, LocatorErrorPolicy};
use crate::error::{FetchError, LoaderError, StorageError};
use crate::loader::{FetchedResource, Loader};
use crate::locator::LocatorBinding;
use crate::state::StateSnapshot;

/// Lifecycle of one pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Completed,
    Aborted,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Running => "running",
            PipelineState::Completed => "completed",
            PipelineState::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A descriptor on its way through the queue
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub descriptor: ResourceDescriptor,
    /// Id of the locator that produced it
    pub locator_id: String,
    /// State prefix the resource is tracked under, if any
    pub state_prefix: Option<String>,
}

/// Receives worker results
#[async_trait]
pub trait ResourceSink: Send + Sync {
    /// Persist a fetched resource; an error here is fatal to the run
    async fn accept(&self, item: &WorkItem, resource: FetchedResource) -> Result<(), StorageError>;

    /// Record a resource-level failure
    fn reject(&self, item: &WorkItem, error: &LoaderError);
}

/// Outcome of [`FetchPipeline::run`]
#[derive(Debug)]
pub struct PipelineReport {
    pub state: PipelineState,
    pub succeeded: usize,
    pub failed: usize,
    /// Descriptors dropped because the state snapshot already had them
    pub filtered_by_state: usize,
    /// Descriptors dropped because another locator already yielded them
    pub duplicates: usize,
    /// Locators abandoned under [`LocatorErrorPolicy::SkipLocator`]
    pub skipped_locators: Vec<String>,
    /// Why the run aborted
    pub abort: Option<FetchError>,
}

impl PipelineReport {
    pub fn is_completed(&self) -> bool {
        self.state == PipelineState::Completed
    }
}

#[derive(Debug, Default)]
struct ProducerSummary {
    enqueued: usize,
    filtered_by_state: usize,
    duplicates: usize,
    skipped_locators: Vec<String>,
}

/// Abort signal shared by the producer and the workers; the first reason wins
struct RunControl {
    abort: CancellationToken,
    reason: Mutex<Option<FetchError>>,
}

impl RunControl {
    fn new(cancel: &CancellationToken) -> Self {
        Self {
            abort: cancel.child_token(),
            reason: Mutex::new(None),
        }
    }

    fn abort(&self, reason: FetchError) {
        let mut slot = self.reason.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            warn!(error = %reason, "Aborting pipeline");
            *slot = Some(reason);
        }
        self.abort.cancel();
    }

    fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    fn take_reason(&self) -> Option<FetchError> {
        self.reason.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}

/// Fixed-size worker pool over a bounded queue
#[derive(Debug, Clone)]
pub struct FetchPipeline {
    concurrency: usize,
    target_queue_size: usize,
    failure_policy: FailurePolicy,
    locator_error_policy: LocatorErrorPolicy,
}

impl FetchPipeline {
    pub fn new(concurrency: usize, target_queue_size: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            target_queue_size: target_queue_size.max(1),
            failure_policy: FailurePolicy::default(),
            locator_error_policy: LocatorErrorPolicy::default(),
        }
    }

    pub fn from_config(config: &DataSourceConfig) -> Self {
        Self::new(config.concurrency, config.target_queue_size)
            .with_failure_policy(config.failure_policy)
            .with_locator_error_policy(config.on_locator_error)
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_locator_error_policy(mut self, policy: LocatorErrorPolicy) -> Self {
        self.locator_error_policy = policy;
        self
    }

    /// Drive every locator through the loader into `sink`.
    ///
    /// Cancelling `cancel` stops the producer and lets in-flight fetches
    /// finish; the run then reports [`FetchError::Cancelled`].
    #[instrument(skip_all, fields(concurrency = self.concurrency, queue = self.target_queue_size))]
    pub async fn run(
        self,
        locators: Vec<LocatorBinding>,
        loader: Arc<dyn Loader>,
        snapshot: Arc<StateSnapshot>,
        sink: Arc<dyn ResourceSink>,
        cancel: CancellationToken,
    ) -> PipelineReport {
        let control = Arc::new(RunControl::new(&cancel));
        let succeeded = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));

        info!(state = %PipelineState::Running, locators = locators.len(), "Pipeline started");

        let (tx, rx) = mpsc::channel::<WorkItem>(self.target_queue_size);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let producer = tokio::spawn(produce(
            locators,
            snapshot,
            tx,
            self.locator_error_policy,
            Arc::clone(&control),
        ));

        let mut workers = Vec::with_capacity(self.concurrency);
        for worker_id in 0..self.concurrency {
            workers.push(tokio::spawn(work(
                worker_id,
                Arc::clone(&rx),
                Arc::clone(&loader),
                Arc::clone(&sink),
                Arc::clone(&control),
                Arc::clone(&succeeded),
                Arc::clone(&failed),
                self.failure_policy,
            )));
        }

        let summary = match producer.await {
            Ok(summary) => summary,
            Err(e) => {
                control.abort(FetchError::TaskFailed(format!("producer: {}", e)));
                ProducerSummary::default()
            },
        };
        for worker in workers {
            if let Err(e) = worker.await {
                control.abort(FetchError::TaskFailed(format!("worker: {}", e)));
            }
        }

        let succeeded = succeeded.load(Ordering::SeqCst);
        let failed = failed.load(Ordering::SeqCst);

        let abort = if control.is_aborted() {
            Some(control.take_reason().unwrap_or(FetchError::Cancelled))
        } else {
            self.failure_policy
                .check_final(succeeded, failed)
                .map(|reason| FetchError::ThresholdExceeded {
                    failed,
                    succeeded,
                    reason,
                })
        };

        let state = if abort.is_some() {
            PipelineState::Aborted
        } else {
            PipelineState::Completed
        };

        info!(
            state = %state,
            enqueued = summary.enqueued,
            succeeded,
            failed,
            filtered_by_state = summary.filtered_by_state,
            duplicates = summary.duplicates,
            "Pipeline finished"
        );

        PipelineReport {
            state,
            succeeded,
            failed,
            filtered_by_state: summary.filtered_by_state,
            duplicates: summary.duplicates,
            skipped_locators: summary.skipped_locators,
            abort,
        }
    }
}

/// Walk locators in order, dropping already-processed and repeated
/// descriptors, and enqueue the rest
async fn produce(
    locators: Vec<LocatorBinding>,
    snapshot: Arc<StateSnapshot>,
    tx: mpsc::Sender<WorkItem>,
    policy: LocatorErrorPolicy,
    control: Arc<RunControl>,
) -> ProducerSummary {
    let mut summary = ProducerSummary::default();
    let mut seen: HashSet<String> = HashSet::new();

    'locators: for binding in locators {
        let locator_id = binding.locator.id().to_string();
        let limit = binding.locator.admit_limit();
        let mut admitted = 0usize;
        let mut stream = binding.locator.produce();
        debug!(locator = %locator_id, limit = ?limit, "Producing");

        loop {
            if limit.is_some_and(|max| admitted >= max) {
                debug!(locator = %locator_id, admitted, "Admit limit reached");
                break;
            }

            let next = tokio::select! {
                biased;
                _ = control.abort.cancelled() => break 'locators,
                next = stream.next() => next,
            };

            let descriptor = match next {
                None => break,
                Some(Ok(descriptor)) => descriptor,
                Some(Err(e)) => match policy {
                    LocatorErrorPolicy::FailFast => {
                        error!(locator = %locator_id, error = %e, "Locator failed");
                        control.abort(e.into());
                        break 'locators;
                    },
                    LocatorErrorPolicy::SkipLocator => {
                        warn!(locator = %locator_id, error = %e, "Locator failed, skipping it");
                        summary.skipped_locators.push(locator_id.clone());
                        break;
                    },
                },
            };

            if let Some(prefix) = &binding.state_prefix {
                if snapshot.contains(prefix, descriptor.id()) {
                    summary.filtered_by_state += 1;
                    continue;
                }
            }
            if !seen.insert(descriptor.id().to_string()) {
                summary.duplicates += 1;
                continue;
            }

            let item = WorkItem {
                descriptor,
                locator_id: locator_id.clone(),
                state_prefix: binding.state_prefix.clone(),
            };

            tokio::select! {
                biased;
                _ = control.abort.cancelled() => break 'locators,
                sent = tx.send(item) => {
                    if sent.is_err() {
                        break 'locators;
                    }
                    summary.enqueued += 1;
                    admitted += 1;
                },
            }
        }
    }

    debug!(enqueued = summary.enqueued, "Producer finished");
    summary
}

#[allow(clippy::too_many_arguments)]
async fn work(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>,
    loader: Arc<dyn Loader>,
    sink: Arc<dyn ResourceSink>,
    control: Arc<RunControl>,
    succeeded: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
    policy: FailurePolicy,
) {
    loop {
        let item = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                _ = control.abort.cancelled() => None,
                item = rx.recv() => item,
            }
        };
        let Some(item) = item else {
            break;
        };

        match loader.fetch(&item.descriptor).await {
            Ok(resource) => {
                if let Err(e) = sink.accept(&item, resource).await {
                    error!(worker_id, address = %item.descriptor.address, error = %e, "Failed to store resource");
                    control.abort(e.into());
                    break;
                }
                succeeded.fetch_add(1, Ordering::SeqCst);
            },
            Err(e) => {
                sink.reject(&item, &e);
                let failures = failed.fetch_add(1, Ordering::SeqCst) + 1;
                if policy.exceeded_early(failures) {
                    control.abort(FetchError::ThresholdExceeded {
                        failed: failures,
                        succeeded: succeeded.load(Ordering::SeqCst),
                        reason: format!(
                            "more than {} failures",
                            policy.max_failures.unwrap_or_default()
                        ),
                    });
                }
            },
        }
    }

    debug!(worker_id, "Worker finished");
}
