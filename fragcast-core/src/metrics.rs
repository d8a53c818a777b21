//! Metrics for fragcast
//!
//! Metrics are emitted through the `metrics` facade; installing an exporter
//! is left to the embedding process.

use metrics::{describe_counter, describe_histogram};

/// Metric names as constants
pub mod names {
    // Erasure metrics
    pub const CODEC_FALLBACKS: &str = "fragcast_codec_fallbacks_total";
    pub const MESSAGES_ENCODED: &str = "fragcast_messages_encoded_total";
    pub const ENCODE_DURATION: &str = "fragcast_encode_duration_seconds";

    // Merkle metrics
    pub const MERKLE_TREES_BUILT: &str = "fragcast_merkle_trees_built_total";
    pub const MERKLE_BUILD_DURATION: &str = "fragcast_merkle_build_duration_seconds";

    // Fragment metrics
    pub const FRAGMENTS_SERIALIZED: &str = "fragcast_fragments_serialized_total";
    pub const FRAGMENTS_VERIFIED: &str = "fragcast_fragments_verified_total";
    pub const FRAGMENTS_REJECTED: &str = "fragcast_fragments_rejected_total";
    pub const FRAGMENT_CLAIMS_LOST: &str = "fragcast_fragment_claims_lost_total";

    // Reconstruction metrics
    pub const MESSAGES_REGENERATED: &str = "fragcast_messages_regenerated_total";
    pub const REGENERATE_FAILURES: &str = "fragcast_regenerate_failures_total";
    pub const REGENERATE_DURATION: &str = "fragcast_regenerate_duration_seconds";

    // Store metrics
    pub const BLOCKS_INSERTED: &str = "fragcast_blocks_inserted_total";
    pub const BLOCKS_EVICTED: &str = "fragcast_blocks_evicted_total";
    pub const STORE_WAIT_TIMEOUTS: &str = "fragcast_store_wait_timeouts_total";
}

/// Register metric descriptions
pub fn describe_metrics() {
    // Erasure metrics
    describe_counter!(
        names::CODEC_FALLBACKS,
        "Codecs built on the fallback backend"
    );
    describe_counter!(
        names::MESSAGES_ENCODED,
        "Messages split and erasure coded"
    );
    describe_histogram!(
        names::ENCODE_DURATION,
        "Time to encode a message and build its tree, in seconds"
    );

    // Merkle metrics
    describe_counter!(names::MERKLE_TREES_BUILT, "Merkle trees built");
    describe_histogram!(
        names::MERKLE_BUILD_DURATION,
        "Merkle tree build duration in seconds"
    );

    // Fragment metrics
    describe_counter!(
        names::FRAGMENTS_SERIALIZED,
        "Sub-fragments written to the wire"
    );
    describe_counter!(
        names::FRAGMENTS_VERIFIED,
        "Fragment indices verified and stored"
    );
    describe_counter!(
        names::FRAGMENTS_REJECTED,
        "Fragment indices that failed proof verification"
    );
    describe_counter!(
        names::FRAGMENT_CLAIMS_LOST,
        "Fragment indices skipped because another caller held the claim"
    );

    // Reconstruction metrics
    describe_counter!(
        names::MESSAGES_REGENERATED,
        "Messages reconstructed from fragments"
    );
    describe_counter!(
        names::REGENERATE_FAILURES,
        "Failed reconstructions"
    );
    describe_histogram!(
        names::REGENERATE_DURATION,
        "Reconstruction duration in seconds"
    );

    // Store metrics
    describe_counter!(names::BLOCKS_INSERTED, "Blocks inserted into the store");
    describe_counter!(
        names::BLOCKS_EVICTED,
        "Blocks evicted by the retention policy"
    );
    describe_counter!(
        names::STORE_WAIT_TIMEOUTS,
        "Block waits that timed out"
    );
}
