//! Error types for fragcast
//!
//! Provides the unified error type for codec, tree and configuration failures.

use thiserror::Error;

/// Result type alias for fragcast core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the core primitives
#[derive(Error, Debug)]
pub enum Error {
    // ===== Erasure Coding Errors =====
    #[error("Erasure coding error: {0}")]
    ErasureCoding(String),

    #[error("No erasure backend can serve k={data_shards}, m={parity_shards}")]
    CodecUnavailable {
        data_shards: usize,
        parity_shards: usize,
    },

    #[error("Insufficient shards: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    #[error("Shard size mismatch: expected {expected}, got {actual}")]
    ShardSizeMismatch { expected: usize, actual: usize },

    #[error("Invalid shard index: {index} (max: {max})")]
    InvalidShardIndex { index: usize, max: usize },

    // ===== Merkle Tree Errors =====
    #[error("Merkle tree error: {0}")]
    Merkle(String),

    #[error("Leaf digest failed at index {0}")]
    DigestFailed(usize),

    // ===== Serialization Errors =====
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ===== Generic Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<reed_solomon_erasure::Error> for Error {
    fn from(err: reed_solomon_erasure::Error) -> Self {
        Error::ErasureCoding(err.to_string())
    }
}

impl From<reed_solomon_simd::Error> for Error {
    fn from(err: reed_solomon_simd::Error) -> Self {
        Error::ErasureCoding(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
