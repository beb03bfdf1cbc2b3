//! Loaders: retrieve the bytes behind one descriptor

use async_trait::async_trait;

use datafetch_common::checksum::content_hash;
use datafetch_common::types::ResourceDescriptor;

use crate::error::LoaderError;

pub mod http;
pub mod sftp;

pub use http::HttpLoader;
pub use sftp::SftpLoader;

/// A descriptor with its retrieved content
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedResource {
    pub descriptor: ResourceDescriptor,
    pub content: Vec<u8>,
    /// Hex-encoded SHA-256 of `content`
    pub hash: String,
    pub size: u64,
}

impl FetchedResource {
    pub fn new(descriptor: ResourceDescriptor, content: Vec<u8>) -> Self {
        let hash = content_hash(&content);
        let size = content.len() as u64;
        Self {
            descriptor,
            content,
            hash,
            size,
        }
    }
}

/// Fetches one resource.
///
/// Transient failures are retried inside the loader; the returned error is
/// the final, classified outcome for the resource.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Strategy id (`meta_load_name`)
    fn id(&self) -> &str;

    async fn fetch(&self, descriptor: &ResourceDescriptor) -> Result<FetchedResource, LoaderError>;
}

/// An empty payload is a permanent failure
pub(crate) fn non_empty(
    descriptor: &ResourceDescriptor,
    content: Vec<u8>,
    attempts: u32,
) -> Result<FetchedResource, LoaderError> {
    if content.is_empty() {
        return Err(
            LoaderError::permanent(&descriptor.address, "empty payload").with_attempts(attempts)
        );
    }
    Ok(FetchedResource::new(descriptor.clone(), content))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_fetched_resource_hashes_content() {
        let resource = FetchedResource::new(ResourceDescriptor::new("/a.txt"), b"abc".to_vec());
        assert_eq!(resource.size, 3);
        assert_eq!(
            resource.hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_empty_payload_is_permanent() {
        let err = non_empty(&ResourceDescriptor::new("/a.txt"), Vec::new(), 2).unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(err.attempts, 2);
    }
}
