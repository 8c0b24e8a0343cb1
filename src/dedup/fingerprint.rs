//! Content fingerprints.
//!
//! An album fingerprint is the SHA-256 of the sorted per-file hex digests of
//! its convertible files, so it does not depend on file order or location.
//! Files above the expensive-analysis limit are digested over their first
//! 20 MiB plus their size.

use crate::album::AlbumUnit;
use crate::staging::verify::{digest_prefix, file_digest};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

/// Bytes read from the head of a large file.
pub const LARGE_FILE_HEAD_BYTES: u64 = 20 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentFingerprint(String);

impl ContentFingerprint {
    /// Combine per-file digests in an order-independent way.
    pub fn from_digests(mut digests: Vec<String>) -> Self {
        digests.sort();
        let mut hasher = Sha256::new();
        for digest in &digests {
            hasher.update(digest.as_bytes());
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ContentFingerprint {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Digest of a single file, partial above `limit`.
pub fn file_fingerprint(path: &Path, size: u64, limit: u64) -> std::io::Result<String> {
    if size <= limit {
        return file_digest(path);
    }
    let head = digest_prefix(path, LARGE_FILE_HEAD_BYTES)?;
    let mut hasher = Sha256::new();
    hasher.update(head.as_bytes());
    hasher.update(size.to_le_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Fingerprint over the album's convertible files.
pub fn fingerprint_album(album: &AlbumUnit, limit: u64) -> std::io::Result<ContentFingerprint> {
    let mut digests = Vec::new();
    for file in album.files.iter().filter(|f| f.class.needs_conversion()) {
        digests.push(file_fingerprint(&album.absolute(file), file.size, limit)?);
    }
    Ok(ContentFingerprint::from_digests(digests))
}
