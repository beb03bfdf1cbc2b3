//! Common types used across datafetch

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum::content_hash;

// ============================================================================
// Resources
// ============================================================================

/// Optional facts a locator knows about a resource before it is fetched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMetadata {
    /// Size in bytes as reported by the remote listing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    /// Remote modification time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,

    /// Pagination cursor of the page this resource was discovered on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,

    /// Date the resource covers, when the locator generated it from a date range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
}

/// Address of one remote resource plus what is known about it.
///
/// The address (a URL or a remote path) is the identity key: it is what the
/// state tracker remembers and what the manifest key is derived from.
///
/// # Examples
///
/// ```
/// use datafetch_common::types::ResourceDescriptor;
///
/// let d = ResourceDescriptor::new("https://example.org/files/2024-01-01.csv?part=2");
/// assert_eq!(d.manifest_key(), "example.org/files/2024-01-01.csv_part_2~51a1ed85d387");
///
/// let s = ResourceDescriptor::new("/doc/cor/20240101c.txt");
/// assert_eq!(s.manifest_key(), "doc/cor/20240101c.txt");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub address: String,
    #[serde(default)]
    pub metadata: ResourceMetadata,
}

impl ResourceDescriptor {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            metadata: ResourceMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: ResourceMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Identity used for incremental state tracking
    pub fn id(&self) -> &str {
        &self.address
    }

    /// Final path segment of the address, without any query string
    pub fn file_name(&self) -> &str {
        let without_query = self.address.split(['?', '#']).next().unwrap_or(&self.address);
        without_query
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(without_query)
    }

    /// Stable, storage-safe key for this resource inside a bundle's content area.
    ///
    /// URLs map to `host/path[_query]`; remote paths map to the path without its
    /// leading slash. Characters outside `[A-Za-z0-9._-]` become `_` and `.`/`..`
    /// segments are dropped, so a key can never escape the bundle directory.
    ///
    /// When that mapping loses information (a rewritten character, a query, a
    /// port, a dropped segment) the key gets `~` and a short hash of the
    /// address appended. Two different addresses therefore only share a key
    /// when both map cleanly, and the key never depends on what else is being
    /// fetched.
    pub fn manifest_key(&self) -> String {
        let (raw, scheme) = match url::Url::parse(&self.address) {
            Ok(parsed) if parsed.host_str().is_some() => {
                let mut key = format!("{}{}", parsed.host_str().unwrap_or_default(), parsed.path());
                if let Some(query) = parsed.query().filter(|q| !q.is_empty()) {
                    key.push('_');
                    key.push_str(query);
                }
                (key, Some(parsed.scheme().to_string()))
            },
            _ => (self.address.clone(), None),
        };

        let segments: Vec<String> = raw
            .split('/')
            .filter(|s| !s.is_empty() && *s != "." && *s != "..")
            .map(sanitize_segment)
            .collect();

        let key = if segments.is_empty() {
            "resource".to_string()
        } else {
            segments.join("/")
        };

        let faithful = match scheme {
            Some(scheme) => self.address == format!("{}://{}", scheme, key),
            None => self.address == format!("/{}", key),
        };
        if faithful {
            key
        } else {
            tagged_key(&key, &self.address)
        }
    }
}

/// Separates a manifest key from its disambiguating tag; never produced by
/// segment sanitizing
pub const KEY_TAG_SEPARATOR: char = '~';

const KEY_TAG_LEN: usize = 12;

/// `key` with a tag derived from `address` appended
pub fn tagged_key(key: &str, address: &str) -> String {
    let digest = content_hash(address.as_bytes());
    format!("{}{}{}", key, KEY_TAG_SEPARATOR, &digest[..KEY_TAG_LEN])
}

fn sanitize_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ============================================================================
// Bundles
// ============================================================================

/// One line of a bundle manifest
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Manifest key; also the path under the bundle's `content/` directory
    pub key: String,
    /// Content size in bytes
    pub size: u64,
    /// Hex-encoded SHA-256 of the content
    pub hash: String,
}

/// Lifecycle status of a bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleStatus {
    Pending,
    Completed,
    /// Completed, but identical to the last published bundle
    Duplicate,
    Failed,
}

impl BundleStatus {
    pub fn as_str(&self) -> &str {
        match self {
            BundleStatus::Pending => "pending",
            BundleStatus::Completed => "completed",
            BundleStatus::Duplicate => "duplicate",
            BundleStatus::Failed => "failed",
        }
    }

    /// Whether downstream consumers may read this bundle
    pub fn is_usable(&self) -> bool {
        matches!(self, BundleStatus::Completed | BundleStatus::Duplicate)
    }
}

impl std::fmt::Display for BundleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
