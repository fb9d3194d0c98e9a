//! Key hashing and on-disk layout
//!
//! Every cached key maps to a file under the cache directory. The file name is the
//! lowercase hex SHA-256 digest of the key's UTF-8 bytes, so arbitrary keys (URLs,
//! command lines, ...) become fixed-length, filesystem-safe names.

use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// Hash a key into a 64-character lowercase hex identifier.
pub fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Maps a cache key to its path relative to the cache directory.
///
/// Implementations must be pure: the same key always yields the same path.
pub trait KeyCodec: Send + Sync + 'static {
    fn relative_path(&self, key: &str) -> PathBuf;
}

/// Flat layout: `<cache_dir>/<sha256 hex>`
#[derive(Debug, Clone, Copy, Default)]
pub struct HashKeyCodec;

impl KeyCodec for HashKeyCodec {
    fn relative_path(&self, key: &str) -> PathBuf {
        PathBuf::from(hash_key(key))
    }
}

/// Sharded layout: `<cache_dir>/<first prefix_len hex chars>/<sha256 hex>`
///
/// Useful when the key space is large enough that a single flat directory gets slow.
#[derive(Debug, Clone, Copy)]
pub struct ShardedHashKeyCodec {
    prefix_len: usize,
}

impl ShardedHashKeyCodec {
    /// `prefix_len` is clamped to the digest length.
    pub fn new(prefix_len: usize) -> Self {
        Self {
            prefix_len: prefix_len.min(64),
        }
    }
}

impl Default for ShardedHashKeyCodec {
    fn default() -> Self {
        Self::new(2)
    }
}

impl KeyCodec for ShardedHashKeyCodec {
    fn relative_path(&self, key: &str) -> PathBuf {
        let digest = hash_key(key);
        PathBuf::from(&digest[..self.prefix_len]).join(&digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_key_known_digests() {
        assert_eq!(
            hash_key(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            hash_key("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hash_key_is_deterministic_and_distinct() {
        let a = hash_key("https://example.com/a");
        assert_eq!(a, hash_key("https://example.com/a"));
        assert_ne!(a, hash_key("https://example.com/b"));
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_hash_key_uses_utf8_bytes() {
        let key = "clé/ключ/鍵";
        let expected = hex::encode(Sha256::digest(key.as_bytes()));
        assert_eq!(hash_key(key), expected);
    }

    #[test]
    fn test_flat_codec() {
        assert_eq!(
            HashKeyCodec.relative_path("abc"),
            PathBuf::from("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn test_sharded_codec() {
        let path = ShardedHashKeyCodec::default().relative_path("abc");
        assert_eq!(
            path,
            PathBuf::from("ba")
                .join("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );

        // Oversized prefixes are clamped
        let path = ShardedHashKeyCodec::new(100).relative_path("abc");
        assert_eq!(path.components().count(), 2);
    }
}
