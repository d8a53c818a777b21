//! Codec pools and context hand-out
//!
//! One pool per `(k, m)`: a bounded lock-free queue of codec instances and a
//! counting semaphore with the same number of permits. A context takes
//! `instance_count` permits at once, then pops that many codecs.

use crate::context::Context;
use crate::sync::Semaphore;
use crate::{ReplicatorError, Result};
use crossbeam::queue::ArrayQueue;
use fragcast_core::config::FragmentConfig;
use fragcast_core::erasure::{new_codec, CodecBackend, ErasureCodec, ErasureConfig};
use rayon::ThreadPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub(crate) struct CodecPool {
    erasure: ErasureConfig,
    backend: CodecBackend,
    capacity: usize,
    codecs: ArrayQueue<Box<dyn ErasureCodec>>,
    permits: Semaphore,
}

impl CodecPool {
    fn new(erasure: ErasureConfig, backend: CodecBackend, capacity: usize) -> Result<Self> {
        let codecs = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            if codecs.push(new_codec(erasure, backend)?).is_err() {
                return Err(fragcast_core::Error::Internal(
                    "codec queue overflow while provisioning".to_string(),
                )
                .into());
            }
        }
        Ok(Self {
            erasure,
            backend,
            capacity,
            codecs,
            permits: Semaphore::new(capacity),
        })
    }

    /// Pop `n` codecs; the caller already holds `n` permits
    fn take(&self, n: usize) -> Result<Vec<Box<dyn ErasureCodec>>> {
        let mut taken = Vec::with_capacity(n);
        for _ in 0..n {
            match self.codecs.pop() {
                Some(codec) => taken.push(codec),
                None => {
                    let missing = n - taken.len();
                    self.give_back(taken);
                    self.permits.release(missing);
                    return Err(fragcast_core::Error::Internal(
                        "codec pool drained below its permit count".to_string(),
                    )
                    .into());
                }
            }
        }
        Ok(taken)
    }

    /// Return codecs and their permits
    ///
    /// Only codecs that made it back into the queue release a permit, so
    /// permits never outnumber queued codecs.
    pub(crate) fn give_back(&self, codecs: Vec<Box<dyn ErasureCodec>>) -> usize {
        let mut returned = 0;
        for codec in codecs {
            match self.codecs.push(codec) {
                Ok(()) => returned += 1,
                Err(_) => warn!(
                    data_shards = self.erasure.data_shards,
                    parity_shards = self.erasure.parity_shards,
                    capacity = self.capacity,
                    "Codec pool full, dropping returned codec"
                ),
            }
        }
        self.permits.release(returned);
        returned
    }
}

/// Hands out [`Context`]s backed by pooled codecs
pub struct FragmentGenerator {
    pools: HashMap<ErasureConfig, Arc<CodecPool>>,
    workers: Arc<ThreadPool>,
}

impl FragmentGenerator {
    /// Provision codec pools for `configs`
    ///
    /// Configs sharing `(k, m)` share one pool sized for all of them.
    pub fn new(configs: &[FragmentConfig], workers: Arc<ThreadPool>) -> Result<Self> {
        let mut demand: HashMap<ErasureConfig, (CodecBackend, usize)> = HashMap::new();
        for config in configs {
            config.validate().map_err(fragcast_core::Error::from)?;
            let entry = demand
                .entry(config.erasure())
                .or_insert((config.backend, 0));
            if entry.0 != config.backend {
                warn!(
                    data_shards = config.data_shards,
                    parity_shards = config.parity_shards,
                    kept = ?entry.0,
                    ignored = ?config.backend,
                    "Conflicting backends for one shard count, keeping the first"
                );
            }
            entry.1 += config.codec_demand();
        }

        let mut pools = HashMap::with_capacity(demand.len());
        for (erasure, (backend, capacity)) in demand {
            let pool = CodecPool::new(erasure, backend, capacity)?;
            info!(
                data_shards = erasure.data_shards,
                parity_shards = erasure.parity_shards,
                capacity,
                "Provisioned codec pool"
            );
            pools.insert(erasure, Arc::new(pool));
        }

        Ok(Self { pools, workers })
    }

    fn pool_for(&self, config: &FragmentConfig) -> Result<&Arc<CodecPool>> {
        let pool = self
            .pools
            .get(&config.erasure())
            .ok_or(ReplicatorError::UnprovisionedConfig {
                data_shards: config.data_shards,
                parity_shards: config.parity_shards,
            })?;
        if config.instance_count == 0 || config.instance_count > pool.capacity {
            return Err(ReplicatorError::PoolTooSmall {
                requested: config.instance_count,
                capacity: pool.capacity,
            });
        }
        Ok(pool)
    }

    fn lease(&self, config: &FragmentConfig, pool: &Arc<CodecPool>) -> Result<Context> {
        let codecs = pool.take(config.instance_count)?;
        debug!(
            data_shards = config.data_shards,
            parity_shards = config.parity_shards,
            instances = config.instance_count,
            "Leased context"
        );
        Ok(Context::leased(
            *config,
            codecs,
            pool.clone(),
            self.workers.clone(),
        ))
    }

    /// Context for `config`, blocking until enough codecs are free
    pub fn get_empty_context(&self, config: &FragmentConfig) -> Result<Context> {
        let pool = self.pool_for(config)?;
        pool.permits.acquire(config.instance_count);
        self.lease(config, pool)
    }

    /// Like [`get_empty_context`](Self::get_empty_context), giving up after `timeout`
    pub fn get_empty_context_timeout(
        &self,
        config: &FragmentConfig,
        timeout: Duration,
    ) -> Result<Context> {
        let pool = self.pool_for(config)?;
        if !pool.permits.acquire_timeout(config.instance_count, timeout) {
            return Err(ReplicatorError::Timeout);
        }
        self.lease(config, pool)
    }

    /// Return a context's codecs to its pool
    ///
    /// Equivalent to dropping the context.
    pub fn free_context(&self, context: Context) {
        drop(context);
    }

    /// Codecs currently free for `config`'s shard count
    pub fn available(&self, config: &FragmentConfig) -> Option<usize> {
        self.pools
            .get(&config.erasure())
            .map(|pool| pool.permits.available())
    }

    /// Backend bound for `config`'s shard count
    pub fn backend(&self, config: &FragmentConfig) -> Option<CodecBackend> {
        self.pools.get(&config.erasure()).map(|pool| pool.backend)
    }

    pub fn workers(&self) -> &Arc<ThreadPool> {
        &self.workers
    }
}

impl std::fmt::Debug for CodecPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecPool")
            .field("erasure", &self.erasure)
            .field("backend", &self.backend)
            .field("capacity", &self.capacity)
            .field("free", &self.codecs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(capacity: usize) -> CodecPool {
        let erasure = ErasureConfig::new(3, 2).unwrap();
        CodecPool::new(erasure, CodecBackend::Galois8, capacity).unwrap()
    }

    #[test]
    fn test_take_and_give_back() {
        let pool = pool(3);
        pool.permits.acquire(2);
        let codecs = pool.take(2).unwrap();
        assert_eq!(pool.codecs.len(), 1);

        assert_eq!(pool.give_back(codecs), 2);
        assert_eq!(pool.permits.available(), 3);
        assert_eq!(pool.codecs.len(), 3);
    }

    #[test]
    fn test_overflowing_give_back_keeps_permits_in_step() {
        let pool = pool(2);
        pool.permits.acquire(1);
        let mut codecs = pool.take(1).unwrap();
        codecs.push(new_codec(pool.erasure, pool.backend).unwrap());

        // Only one slot is free, so only one permit comes back
        assert_eq!(pool.give_back(codecs), 1);
        assert_eq!(pool.permits.available(), 2);
        assert_eq!(pool.codecs.len(), 2);

        pool.permits.acquire(2);
        assert_eq!(pool.take(2).unwrap().len(), 2);
    }
}
