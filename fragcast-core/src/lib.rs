//! fragcast Core Library
//!
//! Core primitives for dispersing large blocks as authenticated fragments.
//! This crate provides:
//! - Reed-Solomon erasure coding behind a two-operation codec trait
//! - A parallel Merkle tree with per-leaf inclusion proofs (Blake3)
//! - Configuration loading and metric names
//! - Common types and error handling

pub mod config;
pub mod digest;
pub mod erasure;
pub mod error;
pub mod merkle;
pub mod metrics;

pub use config::{ConfigError, FragcastConfig, FragmentConfig, RetentionSettings};
pub use digest::{hash_leaf, hash_pair, ContentHash, HashString, HASH_LEN};
pub use erasure::{
    new_codec, CodecBackend, DecodeResult, EncodeResult, ErasureCodec, ErasureConfig,
};
pub use error::{Error, Result};
pub use merkle::{DataBlock, MerkleConfig, MerkleTree, Proof, TreeMode};

/// Default erasure coding configuration for [`ErasureConfig::default`]
/// - 10 data shards: minimum required to reconstruct
/// - 4 parity shards: can tolerate 4 lost fragments
pub const DATA_SHARDS: usize = 10;
pub const PARITY_SHARDS: usize = 4;
pub const TOTAL_SHARDS: usize = DATA_SHARDS + PARITY_SHARDS;

/// Shards larger than this are digested in parallel
pub const PARALLEL_LEAF_THRESHOLD: usize = 1024;

/// Trees with more leaves than this hash their levels in parallel
pub const PARALLEL_LEVEL_THRESHOLD: usize = 1024;
