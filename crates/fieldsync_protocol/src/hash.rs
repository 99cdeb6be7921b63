//! Content hashing.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Lowercase hex SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Wraps a hex digest, normalizing it to lowercase.
    pub fn from_hex(hex: impl AsRef<str>) -> Self {
        Self(hex.as_ref().trim().to_ascii_lowercase())
    }

    /// Returns the hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes the SHA-256 digest of `bytes`.
pub fn content_hash(bytes: &[u8]) -> ContentHash {
    let mut hasher = ContentHasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Incremental SHA-256 hasher for streamed content.
#[derive(Debug, Clone, Default)]
pub struct ContentHasher {
    inner: Sha256,
}

impl ContentHasher {
    /// Creates a new hasher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk of content.
    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
    }

    /// Finishes hashing and returns the digest.
    pub fn finalize(self) -> ContentHash {
        ContentHash(hex::encode(self.inner.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        assert_eq!(
            content_hash(b"abc").as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn incremental_matches_one_shot() {
        let mut hasher = ContentHasher::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finalize(), content_hash(b"hello world"));
    }

    #[test]
    fn from_hex_normalizes_case() {
        assert_eq!(ContentHash::from_hex("ABCD "), ContentHash::from_hex("abcd"));
    }
}
