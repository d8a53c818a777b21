//! Per-region block caches
//!
//! Retention only bounds memory; it never affects watermarks or waiting.

use crate::block::Block;
use fragcast_core::config::RetentionSettings;
use lru::LruCache;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Which blocks a region keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Keep the newest `max_size` block numbers
    SlidingWindow { max_size: usize },
    /// Keep the `capacity` most recently inserted or read blocks
    Lru { capacity: usize },
}

impl RetentionPolicy {
    /// Fresh, empty cache for one region
    pub fn build(&self) -> Box<dyn BlockCache> {
        match *self {
            RetentionPolicy::SlidingWindow { max_size } => Box::new(SlidingWindow::new(max_size)),
            RetentionPolicy::Lru { capacity } => Box::new(LruWindow::new(capacity)),
        }
    }
}

impl From<RetentionSettings> for RetentionPolicy {
    fn from(settings: RetentionSettings) -> Self {
        match settings {
            RetentionSettings::Window { size } => RetentionPolicy::SlidingWindow { max_size: size },
            RetentionSettings::Lru { size } => RetentionPolicy::Lru { capacity: size },
        }
    }
}

/// Bounded number -> block map
///
/// Callers serialize access; `get` may update recency.
pub trait BlockCache: Send {
    fn insert(&mut self, number: u64, block: Arc<Block>);

    fn get(&mut self, number: u64) -> Option<Arc<Block>>;

    /// Drop entries beyond the bound, returning how many were dropped
    fn prune(&mut self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keeps the highest `max_size` block numbers
pub struct SlidingWindow {
    max_size: usize,
    blocks: BTreeMap<u64, Arc<Block>>,
}

impl SlidingWindow {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            blocks: BTreeMap::new(),
        }
    }
}

impl BlockCache for SlidingWindow {
    fn insert(&mut self, number: u64, block: Arc<Block>) {
        self.blocks.insert(number, block);
    }

    fn get(&mut self, number: u64) -> Option<Arc<Block>> {
        self.blocks.get(&number).cloned()
    }

    fn prune(&mut self) -> usize {
        let mut dropped = 0;
        while self.blocks.len() > self.max_size {
            self.blocks.pop_first();
            dropped += 1;
        }
        dropped
    }

    fn len(&self) -> usize {
        self.blocks.len()
    }
}

/// Keeps the `capacity` most recently used blocks
pub struct LruWindow {
    capacity: usize,
    blocks: LruCache<u64, Arc<Block>>,
}

impl LruWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            blocks: LruCache::unbounded(),
        }
    }
}

impl BlockCache for LruWindow {
    fn insert(&mut self, number: u64, block: Arc<Block>) {
        self.blocks.put(number, block);
    }

    fn get(&mut self, number: u64) -> Option<Arc<Block>> {
        self.blocks.get(&number).cloned()
    }

    fn prune(&mut self) -> usize {
        let mut dropped = 0;
        while self.blocks.len() > self.capacity {
            self.blocks.pop_lru();
            dropped += 1;
        }
        dropped
    }

    fn len(&self) -> usize {
        self.blocks.len()
    }
}
