//! Locators: lazy, finite sequences of resources to fetch

use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::trace;

use datafetch_common::types::ResourceDescriptor;

use crate::error::LocatorError;

pub mod filter;
pub mod http;
pub mod sftp;

pub use filter::{DateFilter, GlobFilter, RegexFilter, ResourceFilter};
pub use http::{DateRangeHttpLocator, PaginatedHttpLocator, SingleHttpLocator};
pub use sftp::{SftpDirectoryLocator, SftpFileLocator};

/// Stream of descriptors produced by one [`Locator::produce`] call
pub type DescriptorStream<'a> = BoxStream<'a, Result<ResourceDescriptor, LocatorError>>;

/// Produces the resources a data source should fetch.
///
/// Each call to `produce` starts from scratch; a locator keeps no memory
/// between calls.
pub trait Locator: Send + Sync {
    /// Strategy id, used in logs and errors
    fn id(&self) -> &str;

    fn produce(&self) -> DescriptorStream<'_>;

    /// Most descriptors a run may admit from this locator, counted after
    /// filters and the state snapshot have dropped theirs
    fn admit_limit(&self) -> Option<usize> {
        None
    }
}

/// A locator decorated by filters applied in order
pub struct FilteredLocator {
    inner: Arc<dyn Locator>,
    filters: Vec<Arc<dyn ResourceFilter>>,
}

impl FilteredLocator {
    pub fn new(inner: Arc<dyn Locator>, filters: Vec<Arc<dyn ResourceFilter>>) -> Self {
        Self { inner, filters }
    }
}

impl Locator for FilteredLocator {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn produce(&self) -> DescriptorStream<'_> {
        self.inner
            .produce()
            .try_filter(move |descriptor| {
                let accepted = self.filters.iter().all(|f| f.accepts(descriptor));
                if !accepted {
                    trace!(locator = self.inner.id(), address = %descriptor.address, "Filtered out");
                }
                futures::future::ready(accepted)
            })
            .boxed()
    }

    fn admit_limit(&self) -> Option<usize> {
        self.inner.admit_limit()
    }
}

/// A built locator plus the state prefix its resources are tracked under
#[derive(Clone)]
pub struct LocatorBinding {
    pub locator: Arc<dyn Locator>,
    pub state_prefix: Option<String>,
}

impl LocatorBinding {
    pub fn new(locator: Arc<dyn Locator>, state_prefix: Option<String>) -> Self {
        Self {
            locator,
            state_prefix,
        }
    }
}

impl std::fmt::Debug for LocatorBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocatorBinding")
            .field("locator", &self.locator.id())
            .field("state_prefix", &self.state_prefix)
            .finish()
    }
}

/// Locator over a fixed list; handy for composing and for tests
pub struct StaticLocator {
    id: String,
    items: Vec<Result<ResourceDescriptor, LocatorError>>,
}

impl StaticLocator {
    pub fn new(id: impl Into<String>, descriptors: Vec<ResourceDescriptor>) -> Self {
        Self {
            id: id.into(),
            items: descriptors.into_iter().map(Ok).collect(),
        }
    }

    /// Yields `descriptors`, then fails with `error`
    pub fn failing_after(
        id: impl Into<String>,
        descriptors: Vec<ResourceDescriptor>,
        error: LocatorError,
    ) -> Self {
        let mut locator = Self::new(id, descriptors);
        locator.items.push(Err(error));
        locator
    }
}

impl Locator for StaticLocator {
    fn id(&self) -> &str {
        &self.id
    }

    fn produce(&self) -> DescriptorStream<'_> {
        futures::stream::iter(self.items.iter().cloned()).boxed()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    fn descriptors(addresses: &[&str]) -> Vec<ResourceDescriptor> {
        addresses.iter().map(|a| ResourceDescriptor::new(*a)).collect()
    }

    #[tokio::test]
    async fn test_filters_compose_in_order() {
        let inner = Arc::new(StaticLocator::new(
            "static",
            descriptors(&["/d/a_20230101.txt", "/d/b_20230701.txt", "/d/c_20230801.csv"]),
        ));
        let filters: Vec<Arc<dyn ResourceFilter>> = vec![
            Arc::new(GlobFilter::new("glob", "*.txt").unwrap()),
            Arc::new(DateFilter::new("date", "2023-06-01".parse().unwrap(), None, None, None).unwrap()),
        ];
        let locator = FilteredLocator::new(inner, filters);

        let produced: Vec<String> = locator
            .produce()
            .map_ok(|d| d.address)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(produced, vec!["/d/b_20230701.txt"]);
    }

    #[tokio::test]
    async fn test_errors_pass_through_filters() {
        let error = LocatorError::new("static", FailureKind::Permanent, "listing failed");
        let inner = Arc::new(StaticLocator::failing_after("static", descriptors(&["/a"]), error));
        let locator = FilteredLocator::new(inner, vec![]);
        let results: Vec<_> = locator.produce().collect().await;
        assert_eq!(results.len(), 2);
        assert!(results[1].is_err());
    }

    #[tokio::test]
    async fn test_produce_is_restartable() {
        let locator = StaticLocator::new("static", descriptors(&["/a", "/b"]));
        let first: Vec<_> = locator.produce().try_collect().await.unwrap();
        let second: Vec<_> = locator.produce().try_collect().await.unwrap();
        assert_eq!(first, second);
    }
}
