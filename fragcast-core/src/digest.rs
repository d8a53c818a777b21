//! Digest primitives for fragcast
//!
//! Provides:
//! - `HashString`, the fixed 32-byte digest used as Merkle node and root
//! - leaf and pair hashing for the authenticated tree (Blake3)
//! - `ContentHash`, a printable wrapper used for forensic logging

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Digest length in bytes
pub const HASH_LEN: usize = 32;

/// Fixed-size digest, the atomic unit of the tree and of fragment identity
pub type HashString = [u8; HASH_LEN];

/// Hash a leaf payload
pub fn hash_leaf(data: &[u8]) -> HashString {
    *blake3::hash(data).as_bytes()
}

/// Hash two child nodes into their parent, `left` first
pub fn hash_pair(left: &HashString, right: &HashString) -> HashString {
    let mut hasher = blake3::Hasher::new();
    hasher.update(left);
    hasher.update(right);
    *hasher.finalize().as_bytes()
}

/// First 8 bytes of a digest as hex, for log lines
pub fn short_hex(hash: &HashString) -> String {
    hex::encode(&hash[..8])
}

/// Blake3 hash wrapper for content addressing and diagnostics
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(blake3::Hash);

impl ContentHash {
    pub fn compute(data: &[u8]) -> Self {
        Self(blake3::hash(data))
    }

    /// Same digest as [`compute`](Self::compute), hashed on the rayon pool
    ///
    /// Only pays off for inputs of a few hundred KiB and up.
    pub fn compute_parallel(data: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update_rayon(data);
        Self(hasher.finalize())
    }

    /// Hash a sequence of byte slices as one stream
    pub fn compute_all<'a, I>(parts: I) -> Self
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(part);
        }
        Self(hasher.finalize())
    }

    /// Wrap an existing digest
    pub fn from_bytes(bytes: HashString) -> Self {
        Self(blake3::Hash::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &HashString {
        self.0.as_bytes()
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    /// Parse the 64-character form produced by [`to_hex`](Self::to_hex)
    pub fn from_hex(hex: &str) -> Result<Self> {
        let hash =
            blake3::Hash::from_hex(hex).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Self(hash))
    }

    pub fn verify(&self, data: &[u8]) -> bool {
        blake3::hash(data) == self.0
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", short_hex(self.as_bytes()))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        Self::from_hex(&encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_detects_flipped_byte() {
        let mut shard: Vec<u8> = (0..4096u32).map(|i| (i % 241) as u8).collect();
        let hash = ContentHash::compute(&shard);
        assert!(hash.verify(&shard));

        shard[2048] ^= 0x01;
        assert!(!hash.verify(&shard));
        assert_ne!(ContentHash::compute(&shard), hash);
    }

    #[test]
    fn test_parallel_matches_serial() {
        let block: Vec<u8> = (0..3 * 1024 * 1024u32).map(|i| (i >> 3) as u8).collect();
        assert_eq!(
            ContentHash::compute_parallel(&block),
            ContentHash::compute(&block)
        );
        assert_eq!(ContentHash::compute(&block).as_bytes(), &hash_leaf(&block));
    }

    #[test]
    fn test_compute_all_matches_concatenation() {
        let parts: [&[u8]; 3] = [b"alpha", b"", b"beta"];
        let joined = ContentHash::compute(b"alphabeta");
        assert_eq!(ContentHash::compute_all(parts), joined);
    }

    #[test]
    fn test_pair_hash_is_ordered() {
        let a = hash_leaf(b"left");
        let b = hash_leaf(b"right");
        assert_ne!(hash_pair(&a, &b), hash_pair(&b, &a));
        assert_eq!(hash_pair(&a, &b), hash_pair(&a, &b));
    }

    #[test]
    fn test_serde_uses_hex() {
        let root = ContentHash::from_bytes(hash_pair(&[1u8; HASH_LEN], &[2u8; HASH_LEN]));
        let text = serialized_form(&root);
        assert_eq!(text, root.to_hex());
        assert_eq!(ContentHash::from_hex(&text).unwrap(), root);
        assert!(ContentHash::from_hex("zz").is_err());
        assert_eq!(format!("{:?}", root), format!("ContentHash({})", short_hex(root.as_bytes())));
    }

    fn serialized_form(hash: &ContentHash) -> String {
        let encoded = bincode::serialize(hash).unwrap();
        bincode::deserialize::<String>(&encoded).unwrap()
    }
}
