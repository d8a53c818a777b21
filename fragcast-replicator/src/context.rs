//! Fragment session for one message
//!
//! A context either encodes a message into authenticated fragments
//! (`init_with_message` + `serialize_fragments`) or collects verified
//! fragments from peers and rebuilds the message
//! (`validate_and_deserialize_fragments` + `regenerate_message`).
//!
//! The message is split into `instance_count` contiguous slices, each coded
//! by its own codec. Fragment `j` bundles shard `j` of every instance; in the
//! Merkle tree it occupies leaves `j * instance_count ..= j * instance_count
//! + instance_count - 1`.

use crate::generator::CodecPool;
use crate::wire::{self, WireReader};
use crate::{ReplicatorError, Result};
use bytes::Bytes;
use fragcast_core::config::FragmentConfig;
use fragcast_core::digest::{short_hex, ContentHash, HashString, HASH_LEN};
use fragcast_core::erasure::{new_codec, EncodeResult, ErasureCodec};
use fragcast_core::merkle::{tree_depth, MerkleConfig, MerkleTree, Proof, TreeMode};
use fragcast_core::metrics::names;
use fragcast_core::{PARALLEL_LEAF_THRESHOLD, PARALLEL_LEVEL_THRESHOLD};
use metrics::{counter, histogram};
use parking_lot::Mutex;
use rayon::prelude::*;
use rayon::ThreadPool;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{debug, error, warn};

/// Encoded message held on the generating side
struct Encoded {
    tree: MerkleTree,
    instances: Vec<EncodeResult>,
}

/// One message's fragment session
pub struct Context {
    config: FragmentConfig,
    codecs: Vec<Mutex<Box<dyn ErasureCodec>>>,
    /// Pool the codecs return to on drop, if leased
    lease: Option<Arc<CodecPool>>,
    workers: Arc<ThreadPool>,

    encoded: Option<Encoded>,

    /// Per fragment index: set by the caller that verifies it
    claims: Vec<AtomicBool>,
    /// Per fragment index: one slice per instance, zero-copy into the input
    fragments: Vec<OnceLock<Vec<Bytes>>>,
    verified: AtomicUsize,
}

/// Byte range of instance `index` within a message of `len` bytes
fn slice_range(len: usize, instances: usize, index: usize) -> std::ops::Range<usize> {
    let slice_len = len.div_ceil(instances);
    let start = (index * slice_len).min(len);
    let end = (start + slice_len).min(len);
    start..end
}

impl Context {
    pub(crate) fn leased(
        config: FragmentConfig,
        codecs: Vec<Box<dyn ErasureCodec>>,
        pool: Arc<CodecPool>,
        workers: Arc<ThreadPool>,
    ) -> Self {
        let mut context = Self::with_codecs(config, codecs, workers);
        context.lease = Some(pool);
        context
    }

    /// Context with its own codecs, outside any pool
    pub fn new(config: FragmentConfig, workers: Arc<ThreadPool>) -> Result<Self> {
        config.validate().map_err(fragcast_core::Error::from)?;
        let codecs = (0..config.instance_count)
            .map(|_| new_codec(config.erasure(), config.backend))
            .collect::<fragcast_core::Result<Vec<_>>>()?;
        Ok(Self::with_codecs(config, codecs, workers))
    }

    fn with_codecs(
        config: FragmentConfig,
        codecs: Vec<Box<dyn ErasureCodec>>,
        workers: Arc<ThreadPool>,
    ) -> Self {
        let fragment_count = config.fragment_count();
        Self {
            config,
            codecs: codecs.into_iter().map(Mutex::new).collect(),
            lease: None,
            workers,
            encoded: None,
            claims: (0..fragment_count).map(|_| AtomicBool::new(false)).collect(),
            fragments: (0..fragment_count).map(|_| OnceLock::new()).collect(),
            verified: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &FragmentConfig {
        &self.config
    }

    pub fn fragment_count(&self) -> usize {
        self.config.fragment_count()
    }

    pub fn instance_count(&self) -> usize {
        self.config.instance_count
    }

    /// Depth of the tree over all sub-fragments
    pub fn tree_depth(&self) -> usize {
        tree_depth(self.fragment_count() * self.instance_count())
    }

    fn check_range(&self, start: usize, end: usize) -> Result<()> {
        if start >= end || end > self.fragment_count() {
            return Err(ReplicatorError::OutOfRange {
                start,
                end,
                fragment_count: self.fragment_count(),
            });
        }
        Ok(())
    }

    // ===== Generate path =====

    /// Encode `message` and build its Merkle tree
    pub fn init_with_message(&mut self, message: &[u8]) -> Result<()> {
        if self.encoded.is_some() {
            return Err(ReplicatorError::AlreadyInitialized);
        }
        let started = Instant::now();
        let instances = self.instance_count();

        let encode = |(index, codec): (usize, &mut Mutex<Box<dyn ErasureCodec>>)| {
            let range = slice_range(message.len(), instances, index);
            codec.get_mut().encode(&message[range])
        };
        let encoded: fragcast_core::Result<Vec<EncodeResult>> = if instances == 1 {
            self.codecs.iter_mut().enumerate().map(encode).collect()
        } else {
            let codecs = &mut self.codecs;
            self.workers
                .install(|| codecs.par_iter_mut().enumerate().map(encode).collect())
        };
        let encoded = encoded?;

        let mut leaves: Vec<&[u8]> = Vec::with_capacity(self.fragment_count() * instances);
        for fragment in 0..self.fragment_count() {
            for instance in &encoded {
                let shard = instance.shard(fragment).ok_or_else(|| {
                    fragcast_core::Error::InvalidShardIndex {
                        index: fragment,
                        max: instance.len(),
                    }
                })?;
                leaves.push(shard);
            }
        }

        let max_shard = encoded.iter().map(EncodeResult::shard_len).max().unwrap_or(0);
        let merkle = MerkleConfig::new(TreeMode::ProofGenAndTreeBuild).with_parallelism(
            self.workers.current_num_threads(),
            max_shard > PARALLEL_LEAF_THRESHOLD,
            leaves.len() > PARALLEL_LEVEL_THRESHOLD,
        );
        let tree = self.workers.install(|| MerkleTree::build(&leaves, merkle))?;
        drop(leaves);

        debug!(
            size = message.len(),
            instances,
            fragments = self.fragment_count(),
            root = %short_hex(tree.root()),
            "Encoded message"
        );
        counter!(names::MESSAGES_ENCODED).increment(1);
        histogram!(names::ENCODE_DURATION).record(started.elapsed().as_secs_f64());

        self.encoded = Some(Encoded {
            tree,
            instances: encoded,
        });
        Ok(())
    }

    fn encoded(&self) -> Result<&Encoded> {
        self.encoded.as_ref().ok_or(ReplicatorError::NotInitialized)
    }

    /// Root of the encoded message's tree
    pub fn root(&self) -> Result<HashString> {
        Ok(*self.encoded()?.tree.root())
    }

    /// Proof of sub-fragment `instance` of fragment `fragment`
    pub fn proof(&self, fragment: usize, instance: usize) -> Result<&Proof> {
        let encoded = self.encoded()?;
        if instance >= self.instance_count() {
            return Err(ReplicatorError::OutOfRange {
                start: fragment,
                end: fragment + 1,
                fragment_count: self.fragment_count(),
            });
        }
        encoded
            .tree
            .proof(fragment * self.instance_count() + instance)
            .ok_or(ReplicatorError::OutOfRange {
                start: fragment,
                end: fragment + 1,
                fragment_count: self.fragment_count(),
            })
    }

    /// Write fragments `[start, end)` at byte `offset` of `out`
    ///
    /// `out` is truncated or zero-extended to `offset` first.
    pub fn serialize_fragments(
        &self,
        start: usize,
        end: usize,
        out: &mut Vec<u8>,
        offset: usize,
    ) -> Result<()> {
        let encoded = self.encoded()?;
        self.check_range(start, end)?;
        let instances = self.instance_count();

        out.resize(offset, 0);
        wire::put_depth(out, encoded.tree.depth());

        let mut previous: Option<&Proof> = None;
        for fragment in start..end {
            for (instance, shards) in encoded.instances.iter().enumerate() {
                let leaf = fragment * instances + instance;
                let (Some(proof), Some(shard)) =
                    (encoded.tree.proof(leaf), shards.shard(fragment))
                else {
                    return Err(fragcast_core::Error::Internal(format!(
                        "leaf {} missing from encoded message",
                        leaf
                    ))
                    .into());
                };
                let fresh = wire::fresh_count(previous, proof);
                wire::put_leaf(out, proof, fresh, shard);
                previous = Some(proof);
            }
        }

        counter!(names::FRAGMENTS_SERIALIZED).increment(((end - start) * instances) as u64);
        debug!(start, end, bytes = out.len() - offset, "Serialized fragments");
        Ok(())
    }

    // ===== Validate path =====

    /// Verify fragments `[start, end)` from `raw` against `root` and keep them
    pub fn validate_and_deserialize_fragments(
        &self,
        root: &HashString,
        raw: Bytes,
        start: usize,
        end: usize,
    ) -> Result<()> {
        self.validate_fragments_from(None, root, raw, start, end)
    }

    /// Same as [`validate_and_deserialize_fragments`], tagging logs with `peer`
    ///
    /// [`validate_and_deserialize_fragments`]: Self::validate_and_deserialize_fragments
    pub fn validate_fragments_from(
        &self,
        peer: Option<&str>,
        root: &HashString,
        raw: Bytes,
        start: usize,
        end: usize,
    ) -> Result<()> {
        self.check_range(start, end)?;
        let peer = peer.unwrap_or("unknown");
        let instances = self.instance_count();

        let mut reader = WireReader::new(raw);
        let depth = reader.read_depth()?;
        if depth != self.tree_depth() {
            return Err(ReplicatorError::malformed(format!(
                "depth {} does not match {} for {} leaves",
                depth,
                self.tree_depth(),
                self.fragment_count() * instances
            )));
        }

        // Siblings omitted on the wire come from the previous leaf of this call
        let mut running = vec![[0u8; HASH_LEN]; depth];
        let mut first = true;

        for fragment in start..end {
            let claimed = self.claims[fragment]
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();

            let outcome = self.read_fragment(
                &mut reader,
                &mut running,
                &mut first,
                fragment,
                claimed.then_some((root, peer)),
            );
            match outcome {
                Ok(Some(shards)) => {
                    if self.fragments[fragment].set(shards).is_ok() {
                        self.verified.fetch_add(1, Ordering::AcqRel);
                        counter!(names::FRAGMENTS_VERIFIED).increment(1);
                    }
                }
                Ok(None) => {
                    counter!(names::FRAGMENT_CLAIMS_LOST).increment(1);
                }
                Err(err) => {
                    if claimed {
                        self.claims[fragment].store(false, Ordering::Release);
                        warn!(fragment, peer, "Released fragment claim");
                    }
                    return Err(err);
                }
            }
        }

        if reader.remaining() > 0 {
            return Err(ReplicatorError::malformed(format!(
                "{} trailing bytes after fragment {}",
                reader.remaining(),
                end - 1
            )));
        }
        debug!(start, end, peer, "Validated fragments");
        Ok(())
    }

    /// Parse one fragment; verify it when `verify` carries the root
    ///
    /// Returns the sub-fragments only when they were verified.
    fn read_fragment(
        &self,
        reader: &mut WireReader,
        running: &mut [HashString],
        first: &mut bool,
        fragment: usize,
        verify: Option<(&HashString, &str)>,
    ) -> Result<Option<Vec<Bytes>>> {
        let instances = self.instance_count();
        let mut shards = Vec::with_capacity(if verify.is_some() { instances } else { 0 });

        for instance in 0..instances {
            let (path, shard) = reader.read_leaf(running, *first)?;
            *first = false;

            let Some((root, peer)) = verify else {
                continue;
            };
            let proof = Proof {
                siblings: running.to_vec(),
                path,
            };
            let leaf = fragment * instances + instance;
            let valid = proof.leaf_index() == leaf
                && MerkleTree::verify(&shard[..], &proof, root) == Some(true);
            if !valid {
                counter!(names::FRAGMENTS_REJECTED).increment(1);
                error!(
                    fragment,
                    instance,
                    peer,
                    hash = %ContentHash::compute(&shard),
                    root = %short_hex(root),
                    "Fragment failed verification"
                );
                return Err(ReplicatorError::VerificationFailed { fragment });
            }
            shards.push(shard);
        }

        Ok(verify.map(|_| shards))
    }

    /// Number of fragment indices verified and stored
    pub fn verified_fragments(&self) -> usize {
        self.verified.load(Ordering::Acquire)
    }

    /// Whether enough fragments are stored to regenerate
    pub fn is_ready(&self) -> bool {
        self.verified_fragments() >= self.config.data_shards
    }

    /// Rebuild the `actual_size`-byte message into `out`
    pub fn regenerate_message(&self, actual_size: usize, out: &mut Vec<u8>) -> Result<()> {
        let available = self.verified_fragments();
        if available < self.config.data_shards {
            return Err(fragcast_core::Error::InsufficientShards {
                available,
                required: self.config.data_shards,
            }
            .into());
        }
        let started = Instant::now();
        let instances = self.instance_count();

        out.clear();
        out.resize(actual_size, 0);

        // Split the output into one destination per instance
        let mut targets: Vec<&mut [u8]> = Vec::with_capacity(instances);
        let mut rest = out.as_mut_slice();
        for index in 0..instances {
            let len = slice_range(actual_size, instances, index).len();
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(len);
            targets.push(head);
            rest = tail;
        }

        let decode = |(index, target): (usize, &mut [u8])| -> Result<()> {
            let shards: Vec<Option<&[u8]>> = self
                .fragments
                .iter()
                .map(|slot| slot.get().and_then(|subs| subs.get(index)).map(|s| &s[..]))
                .collect();
            let decoded = self.codecs[index].lock().decode(&shards, target.len())?;
            if decoded.data().len() != target.len() {
                return Err(ReplicatorError::Reconstruction(format!(
                    "instance {} produced {} bytes, expected {}",
                    index,
                    decoded.data().len(),
                    target.len()
                )));
            }
            target.copy_from_slice(decoded.data());
            Ok(())
        };

        let result = if instances == 1 {
            targets.into_iter().enumerate().try_for_each(decode)
        } else {
            self.workers
                .install(|| targets.into_par_iter().enumerate().try_for_each(decode))
        };

        if let Err(err) = result {
            let hash = ContentHash::compute_all(
                self.fragments
                    .iter()
                    .filter_map(OnceLock::get)
                    .flatten()
                    .map(|s| &s[..]),
            );
            counter!(names::REGENERATE_FAILURES).increment(1);
            error!(
                size = actual_size,
                fragments = available,
                hash = %hash,
                error = %err,
                "Message regeneration failed"
            );
            return Err(ReplicatorError::Reconstruction(err.to_string()));
        }

        counter!(names::MESSAGES_REGENERATED).increment(1);
        histogram!(names::REGENERATE_DURATION).record(started.elapsed().as_secs_f64());
        debug!(size = actual_size, fragments = available, "Regenerated message");
        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Some(pool) = self.lease.take() {
            let codecs = self.codecs.drain(..).map(Mutex::into_inner).collect();
            pool.give_back(codecs);
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("initialized", &self.encoded.is_some())
            .field("verified", &self.verified_fragments())
            .field("leased", &self.lease.is_some())
            .finish()
    }
}
