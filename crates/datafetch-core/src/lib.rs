//! Datafetch Core
//!
//! Config-driven fetching of remote resources into content-addressed bundles.
//!
//! # Overview
//!
//! A data source is described by a YAML document naming one loader, any
//! number of locators (each optionally filtered and bound to a state prefix),
//! and the protocol configs they reference. A run:
//!
//! 1. resolves the document and builds its strategies through a
//!    [`StrategyRegistry`](registry::StrategyRegistry)
//! 2. reads the incremental state snapshot
//! 3. drives the locators through a bounded producer/worker
//!    [`FetchPipeline`](pipeline::FetchPipeline)
//! 4. writes content, a sorted manifest and completion metadata as a bundle
//! 5. commits the processed identifiers and publishes a completion message
//!
//! ## Storage layout
//!
//! ```text
//! <stage>/<data_source_id>/data/bundle_<uuid>/
//!   _manifest.jsonl
//!   metadata/_completed.json
//!   metadata/_failures.jsonl
//!   content/<manifest-key>
//! <stage>/<data_source_id>/bundle_hashes/_latest
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use datafetch_core::config::DirConfigSource;
//! use datafetch_core::credentials::EnvCredentialsProvider;
//! use datafetch_core::kv::ObjectKeyValueStore;
//! use datafetch_core::publisher::MemoryQueue;
//! use datafetch_core::registry::StrategyRegistry;
//! use datafetch_core::runner::{FetchRunner, Services};
//! use datafetch_core::sftp::Ssh2Connector;
//! use datafetch_core::storage::{LocalObjectStore, ObjectStore};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new("./data"));
//! let services = Services {
//!     config_source: Arc::new(DirConfigSource::new("./configs")),
//!     store: Arc::clone(&store),
//!     state_store: Arc::new(ObjectKeyValueStore::new(store, "_state")),
//!     credentials: Arc::new(EnvCredentialsProvider::new(None)),
//!     sftp: Arc::new(Ssh2Connector),
//!     queue: Arc::new(MemoryQueue::new()),
//! };
//!
//! let runner = FetchRunner::new(services, StrategyRegistry::with_defaults(), "raw");
//! let report = runner.run("us_fl").await?;
//! println!("{} resources in bundle {}", report.resources_count, report.bid);
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod bundler;
pub mod config;
pub mod credentials;
pub mod error;
pub mod http;
pub mod kv;
pub mod loader;
pub mod locator;
pub mod pipeline;
pub mod publisher;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod sftp;
pub mod state;
pub mod storage;

pub use error::{FetchError, Result};
