//! Datafetch Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types and utilities for the datafetch workspace.
//!
//! # Overview
//!
//! - **Checksums**: content hashing and the order-independent bundle hash
//! - **Logging**: `tracing` subscriber setup shared by every binary
//! - **Types**: resource descriptors, manifest entries and bundle status
//!
//! # Example
//!
//! ```no_run
//! use datafetch_common::checksum::{bundle_hash, content_hash};
//!
//! let a = content_hash(b"first");
//! let b = content_hash(b"second");
//! let combined = bundle_hash([a.as_str(), b.as_str()]);
//! assert_eq!(combined.len(), 64);
//! ```

pub mod checksum;
pub mod logging;
pub mod types;
