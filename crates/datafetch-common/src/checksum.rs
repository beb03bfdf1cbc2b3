//! Checksum utilities for fetched content and bundles

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of an in-memory payload
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Bundle-level hash over a set of entry hashes.
///
/// The hashes are sorted before combining, so the result depends only on
/// which hashes are present and never on the order they arrived in.
pub fn bundle_hash<'a, I>(entry_hashes: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut hashes: Vec<&str> = entry_hashes.into_iter().collect();
    hashes.sort_unstable();

    let mut hasher = Sha256::new();
    for hash in hashes {
        hasher.update(hash.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
