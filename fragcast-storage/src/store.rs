//! Multi-region block store
//!
//! Each region is an independent, gapless sequence of block numbers starting
//! at 0. Inserts advance the region's watermark and wake blocked readers;
//! subscribers see every insert of every region in insertion order.

use crate::block::Block;
use crate::retention::BlockCache;
use crate::watermark::Watermark;
use crate::{BlockStoreConfig, RegionStats, Result, StorageError};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use fragcast_core::metrics::names;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Handle returned by [`BlockStore::new_subscriber`]
pub type SubscriberId = u64;

/// A delivered `(region, block)` pair
pub type Delivery = (usize, Arc<Block>);

struct Region {
    stored: Watermark,
    persisted: Watermark,
    /// Held across a whole insert so per-region ordering is total
    cache: Mutex<Box<dyn BlockCache>>,
    evicted: AtomicU64,
}

struct Subscriber {
    tx: Sender<Delivery>,
    rx: Receiver<Delivery>,
}

/// Blocking, ordered block store
pub struct BlockStore {
    regions: Vec<Region>,
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    next_subscriber: AtomicU64,
}

impl BlockStore {
    pub fn new(config: BlockStoreConfig) -> Self {
        let regions = (0..config.regions.max(1))
            .map(|_| Region {
                stored: Watermark::new(),
                persisted: Watermark::new(),
                cache: Mutex::new(config.retention.build()),
                evicted: AtomicU64::new(0),
            })
            .collect();
        Self {
            regions,
            subscribers: RwLock::new(HashMap::new()),
            next_subscriber: AtomicU64::new(0),
        }
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    fn region(&self, region: usize) -> Result<&Region> {
        self.regions.get(region).ok_or(StorageError::InvalidRegion {
            region,
            regions: self.regions.len(),
        })
    }

    /// Store `block` as the next block of `region` and notify everyone
    ///
    /// # Panics
    ///
    /// If the block number is not exactly one past the region's highest
    /// stored number (0 for the first block). Upstream ordering is broken
    /// at that point and continuing would corrupt every consumer.
    pub fn insert_block_and_notify(&self, region: usize, block: Block) -> Result<()> {
        let state = self.region(region)?;
        let number = block.number();
        let block = Arc::new(block);

        let mut cache = state.cache.lock();
        let expected = state.stored.get().map_or(0, |max| max + 1);
        assert_eq!(
            number, expected,
            "block number out of order in region {}: got {}, expected {}",
            region, number, expected
        );

        cache.insert(number, block.clone());
        state.stored.advance(number);

        for subscriber in self.subscribers.read().values() {
            // The store keeps the receiver alive, so sending cannot fail
            let _ = subscriber.tx.send((region, block.clone()));
        }

        let dropped = cache.prune();
        if dropped > 0 {
            state.evicted.fetch_add(dropped as u64, Ordering::Relaxed);
            counter!(names::BLOCKS_EVICTED).increment(dropped as u64);
        }
        drop(cache);

        counter!(names::BLOCKS_INSERTED, "region" => region.to_string()).increment(1);
        debug!(region, number, "Inserted block");
        Ok(())
    }

    /// Block until `number` is stored in `region`, then return it
    ///
    /// `None` on timeout, or when the block was already pruned.
    pub fn wait_for_block(
        &self,
        region: usize,
        number: u64,
        timeout: Option<Duration>,
    ) -> Result<Option<Arc<Block>>> {
        let state = self.region(region)?;
        if !state.stored.wait_for(number, timeout) {
            counter!(names::STORE_WAIT_TIMEOUTS).increment(1);
            trace!(region, number, ?timeout, "Timed out waiting for block");
            return Ok(None);
        }
        Ok(state.cache.lock().get(number))
    }

    /// Cached block, without waiting
    pub fn get_block(&self, region: usize, number: u64) -> Result<Option<Arc<Block>>> {
        let state = self.region(region)?;
        if !state.stored.reaches(number) {
            return Ok(None);
        }
        Ok(state.cache.lock().get(number))
    }

    pub fn get_max_stored_block_number(&self, region: usize) -> Result<Option<u64>> {
        Ok(self.region(region)?.stored.get())
    }

    /// Record that every block of `region` up to `number` is durable
    ///
    /// Numbers beyond the stored watermark are clamped to it.
    pub fn mark_persisted(&self, region: usize, number: u64) -> Result<()> {
        let state = self.region(region)?;
        let Some(max_stored) = state.stored.get() else {
            warn!(region, number, "Nothing stored yet, ignoring persisted mark");
            return Ok(());
        };
        if number > max_stored {
            warn!(region, number, max_stored, "Persisted mark beyond stored blocks");
        }
        state.persisted.advance(number.min(max_stored));
        Ok(())
    }

    pub fn is_persisted(&self, region: usize, number: u64) -> Result<bool> {
        Ok(self.region(region)?.persisted.reaches(number))
    }

    /// Block until `number` of `region` is marked persisted
    pub fn wait_for_persisted(
        &self,
        region: usize,
        number: u64,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        Ok(self.region(region)?.persisted.wait_for(number, timeout))
    }

    /// Register a subscriber; it sees inserts made after this call
    pub fn new_subscriber(&self) -> SubscriberId {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = channel::unbounded();
        self.subscribers.write().insert(id, Subscriber { tx, rx });
        debug!(subscriber = id, "Registered subscriber");
        id
    }

    /// Drop a subscriber and its pending deliveries
    pub fn remove_subscriber(&self, id: SubscriberId) -> bool {
        self.subscribers.write().remove(&id).is_some()
    }

    /// Next `(region, block)` delivered to subscriber `id`
    ///
    /// `Some(Duration::ZERO)` polls, `None` waits forever, `Some(d)` waits up
    /// to `d`. Unknown or removed subscribers get `None`.
    pub fn subscriber_wait_for_block(
        &self,
        id: SubscriberId,
        timeout: Option<Duration>,
    ) -> Option<Delivery> {
        let rx = match self.subscribers.read().get(&id) {
            Some(subscriber) => subscriber.rx.clone(),
            None => {
                warn!(subscriber = id, "Unknown subscriber");
                return None;
            }
        };

        match timeout {
            Some(timeout) if timeout.is_zero() => match rx.try_recv() {
                Ok(delivery) => Some(delivery),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
            },
            Some(timeout) => match rx.recv_timeout(timeout) {
                Ok(delivery) => Some(delivery),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
            },
            None => rx.recv().ok(),
        }
    }

    pub fn stats(&self, region: usize) -> Result<RegionStats> {
        let state = self.region(region)?;
        Ok(RegionStats {
            cached: state.cache.lock().len(),
            max_stored: state.stored.get(),
            max_persisted: state.persisted.get(),
            evicted: state.evicted.load(Ordering::Relaxed),
        })
    }
}

impl Default for BlockStore {
    fn default() -> Self {
        Self::new(BlockStoreConfig::default())
    }
}
