// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Content hashing for artifacts and templates
//!
//! Uses BLAKE3 for fast, secure content hashing.

use blake3::Hasher;
use std::collections::BTreeMap;

use super::ArtifactPayload;

/// Content hasher for artifact payloads
pub struct ContentHasher {
    hasher: Hasher,
}

impl ContentHasher {
    /// Create a new content hasher
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
        }
    }

    /// Hash every file of a payload, in path order
    pub fn hash_files(&mut self, files: &BTreeMap<String, Vec<u8>>) {
        for (path, content) in files {
            // Length prefixes keep ("ab", "c") and ("a", "bc") apart
            self.hasher.update(&(path.len() as u64).to_le_bytes());
            self.hasher.update(path.as_bytes());
            self.hasher.update(&(content.len() as u64).to_le_bytes());
            self.hasher.update(content);
        }
    }

    /// Hash a payload's files and metadata
    pub fn hash_payload(&mut self, payload: &ArtifactPayload) {
        self.hash_files(&payload.files);
        for (k, v) in &payload.metadata {
            self.hasher.update(k.as_bytes());
            self.hasher.update(b"=");
            self.hasher.update(v.as_bytes());
        }
    }

    /// Hash arbitrary bytes
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Finalize and get the hash
    pub fn finalize(self) -> String {
        self.hasher.finalize().to_hex().to_string()
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute a quick hash of a string
pub fn hash_string(s: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(s.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Short form of a hash, as used for source versions
pub fn short_hash(hash: &str) -> &str {
    &hash[..12.min(hash.len())]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_string() {
        let hash1 = hash_string("hello");
        let hash2 = hash_string("hello");
        let hash3 = hash_string("world");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
    }

    #[test]
    fn test_file_boundaries_matter() {
        let mut a = BTreeMap::new();
        a.insert("ab".to_string(), b"c".to_vec());
        let mut b = BTreeMap::new();
        b.insert("a".to_string(), b"bc".to_vec());

        let mut h1 = ContentHasher::new();
        h1.hash_files(&a);
        let mut h2 = ContentHasher::new();
        h2.hash_files(&b);

        assert_ne!(h1.finalize(), h2.finalize());
    }

    #[test]
    fn test_short_hash() {
        let hash = hash_string("v1");
        assert_eq!(short_hash(&hash).len(), 12);
        assert_eq!(short_hash("abc"), "abc");
    }
}
