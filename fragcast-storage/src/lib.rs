//! fragcast Block Store
//!
//! Provides ordered, blocking delivery of reconstructed blocks:
//! - `Block`, the stored entity and its binary encoding
//! - `RetentionPolicy` with sliding-window and LRU caches
//! - `Watermark`, a monotone counter with blocking waits
//! - `BlockStore`, one watermark and cache per region plus subscriber queues

pub mod block;
pub mod retention;
pub mod store;
pub mod watermark;

pub use block::{
    Block, BlockBody, BlockHeader, BlockMetadata, ExecuteResult, KeyValue, ReadWriteSet, Signature,
    SignedRequest,
};
pub use retention::{BlockCache, LruWindow, RetentionPolicy, SlidingWindow};
pub use store::{BlockStore, SubscriberId};
pub use watermark::Watermark;

use fragcast_core::config::StoreSettings;
use thiserror::Error;

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Store errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid region {region} (store has {regions})")]
    InvalidRegion { region: usize, regions: usize },

    #[error("Block serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Block store configuration
#[derive(Debug, Clone)]
pub struct BlockStoreConfig {
    /// Number of independent regions (block number sequences)
    pub regions: usize,

    /// Cache retention applied to every region
    pub retention: RetentionPolicy,
}

impl Default for BlockStoreConfig {
    fn default() -> Self {
        Self {
            regions: 1,
            retention: RetentionPolicy::SlidingWindow { max_size: 64 },
        }
    }
}

impl BlockStoreConfig {
    /// Create a config with `regions` regions and default retention
    pub fn new(regions: usize) -> Self {
        Self {
            regions,
            ..Default::default()
        }
    }

    /// Set the retention policy
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }
}

impl From<&StoreSettings> for BlockStoreConfig {
    fn from(settings: &StoreSettings) -> Self {
        Self {
            regions: settings.regions,
            retention: settings.retention.into(),
        }
    }
}

/// Per-region statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionStats {
    /// Blocks currently cached
    pub cached: usize,

    /// Highest stored block number
    pub max_stored: Option<u64>,

    /// Highest block number marked persisted
    pub max_persisted: Option<u64>,

    /// Blocks dropped by the retention policy
    pub evicted: u64,
}

impl RegionStats {
    /// Blocks stored but not yet persisted
    pub fn unpersisted(&self) -> u64 {
        match (self.max_stored, self.max_persisted) {
            (Some(stored), Some(persisted)) => stored.saturating_sub(persisted),
            (Some(stored), None) => stored + 1,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fragcast_core::config::RetentionSettings;

    #[test]
    fn test_config_from_settings() {
        let settings = StoreSettings {
            regions: 3,
            retention: RetentionSettings::Lru { size: 8 },
        };
        let config = BlockStoreConfig::from(&settings);
        assert_eq!(config.regions, 3);
        assert_eq!(config.retention, RetentionPolicy::Lru { capacity: 8 });
    }

    #[test]
    fn test_unpersisted() {
        let mut stats = RegionStats::default();
        assert_eq!(stats.unpersisted(), 0);
        stats.max_stored = Some(4);
        assert_eq!(stats.unpersisted(), 5);
        stats.max_persisted = Some(2);
        assert_eq!(stats.unpersisted(), 2);
    }
}
