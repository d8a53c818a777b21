//! fragcast Replicator
//!
//! Turns a message into authenticated, erasure-coded fragments and back:
//! - `FragmentGenerator` provisions pooled codecs and hands out contexts
//! - `Context` encodes, serializes, validates and regenerates one message
//! - `FragmentEnvelope` is the transport unit for a fragment range
//! - `BlockReceiver` assembles envelopes into ordered blocks in a `BlockStore`

pub mod context;
pub mod envelope;
pub mod generator;
pub mod receiver;
pub mod sync;
pub mod wire;

pub use context::Context;
pub use envelope::{EnvelopeHeader, FragmentEnvelope};
pub use generator::FragmentGenerator;
pub use receiver::{BlockReceiver, ReceiveOutcome};

use thiserror::Error;

/// Result type alias for replicator operations
pub type Result<T> = std::result::Result<T, ReplicatorError>;

/// Replicator errors
#[derive(Error, Debug)]
pub enum ReplicatorError {
    #[error("Fragment range [{start}, {end}) out of bounds for {fragment_count} fragments")]
    OutOfRange {
        start: usize,
        end: usize,
        fragment_count: usize,
    },

    #[error("Context already holds a message")]
    AlreadyInitialized,

    #[error("Context holds no message")]
    NotInitialized,

    #[error("Malformed fragment data: {0}")]
    Malformed(String),

    #[error("Fragment {fragment} failed verification")]
    VerificationFailed { fragment: usize },

    #[error("Reconstruction failed: {0}")]
    Reconstruction(String),

    #[error("No codec pool provisioned for k={data_shards}, m={parity_shards}")]
    UnprovisionedConfig {
        data_shards: usize,
        parity_shards: usize,
    },

    #[error("Context needs {requested} codecs but the pool only holds {capacity}")]
    PoolTooSmall { requested: usize, capacity: usize },

    #[error("Timed out waiting for codecs")]
    Timeout,

    #[error("Block {actual} arrived where block {expected} was announced")]
    UnexpectedBlock { expected: u64, actual: u64 },

    #[error(transparent)]
    Core(#[from] fragcast_core::Error),

    #[error(transparent)]
    Storage(#[from] fragcast_storage::StorageError),
}

impl ReplicatorError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        ReplicatorError::Malformed(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ReplicatorError::OutOfRange {
            start: 4,
            end: 40,
            fragment_count: 33,
        };
        assert_eq!(
            err.to_string(),
            "Fragment range [4, 40) out of bounds for 33 fragments"
        );

        let err: ReplicatorError = fragcast_core::Error::InsufficientShards {
            available: 3,
            required: 11,
        }
        .into();
        assert_eq!(err.to_string(), "Insufficient shards: have 3, need 11");
    }
}
