//! Parallel authenticated Merkle tree
//!
//! Builds a binary hash tree over an ordered list of [`DataBlock`]s and
//! produces per-leaf inclusion proofs.
//!
//! Layout:
//! - level 0 holds the leaf digests, level `depth - 1` holds exactly two nodes
//! - a level with an odd number of nodes duplicates its last node
//! - `root = hash(level[depth - 1][0], level[depth - 1][1])`
//!
//! Proof bit `i` set means the node is the left child at level `i`.

use crate::digest::{hash_pair, short_hex, HashString, HASH_LEN};
use crate::error::{Error, Result};
use crate::metrics::names;
use metrics::{counter, histogram};
use rayon::prelude::*;
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;
use tracing::{debug, warn};

/// Minimum units of work handed to one routine
pub const ROUTINE_FACTOR: usize = 16;

/// Paths are a `u32` bitmask
pub const MAX_DEPTH: usize = 32;

/// Number of routines for `work` units when `requested` are available
///
/// `requested == 0` means the current rayon pool's thread count.
pub fn calculate_num_routines(requested: usize, work: usize) -> usize {
    let requested = if requested == 0 {
        rayon::current_num_threads()
    } else {
        requested
    };
    requested.min(work / ROUTINE_FACTOR).max(1)
}

/// What a build keeps around
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TreeMode {
    /// Emit proofs, discard the levels
    #[default]
    ProofGen,
    /// Retain levels and the leaf map, no proofs
    TreeBuild,
    /// Both
    ProofGenAndTreeBuild,
}

impl TreeMode {
    pub fn generates_proofs(self) -> bool {
        matches!(self, TreeMode::ProofGen | TreeMode::ProofGenAndTreeBuild)
    }

    pub fn builds_tree(self) -> bool {
        matches!(self, TreeMode::TreeBuild | TreeMode::ProofGenAndTreeBuild)
    }
}

/// Build options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MerkleConfig {
    pub mode: TreeMode,
    /// Upper bound on routines per level, 0 = pool size
    pub num_routines: usize,
    /// Digest leaves in parallel
    pub leaf_gen_parallel: bool,
    /// Hash levels and emit proofs in parallel
    pub run_in_parallel: bool,
}

impl MerkleConfig {
    pub fn new(mode: TreeMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn with_parallelism(
        mut self,
        num_routines: usize,
        leaf_gen_parallel: bool,
        run_in_parallel: bool,
    ) -> Self {
        self.num_routines = num_routines;
        self.leaf_gen_parallel = leaf_gen_parallel;
        self.run_in_parallel = run_in_parallel;
        self
    }
}

/// Something that can be turned into a leaf digest
///
/// Digesting may fail, which aborts a build or a verification.
pub trait DataBlock {
    fn digest(&self) -> Option<HashString>;
}

impl DataBlock for [u8] {
    fn digest(&self) -> Option<HashString> {
        Some(crate::digest::hash_leaf(self))
    }
}

impl DataBlock for Vec<u8> {
    fn digest(&self) -> Option<HashString> {
        self.as_slice().digest()
    }
}

impl<const N: usize> DataBlock for [u8; N] {
    fn digest(&self) -> Option<HashString> {
        self.as_slice().digest()
    }
}

impl<T: DataBlock + ?Sized> DataBlock for &T {
    fn digest(&self) -> Option<HashString> {
        (**self).digest()
    }
}

/// Inclusion proof for one leaf
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Proof {
    /// `siblings[i]` is the sibling at level `i`
    pub siblings: Vec<HashString>,
    /// Bit `i` set: the node is the left child at level `i`
    pub path: u32,
}

impl Proof {
    pub fn depth(&self) -> usize {
        self.siblings.len()
    }

    pub fn is_left(&self, level: usize) -> bool {
        self.path & (1 << level) != 0
    }

    /// Fold `leaf` up the tree
    pub fn compute_root(&self, leaf: &HashString) -> HashString {
        self.siblings
            .iter()
            .enumerate()
            .fold(*leaf, |node, (level, sibling)| {
                if self.is_left(level) {
                    hash_pair(&node, sibling)
                } else {
                    hash_pair(sibling, &node)
                }
            })
    }

    /// Index of the leaf this proof belongs to
    ///
    /// Right children are odd, so the leaf index is the complement of `path`.
    pub fn leaf_index(&self) -> usize {
        let mask = if self.depth() >= MAX_DEPTH {
            u32::MAX
        } else {
            (1u32 << self.depth()) - 1
        };
        (!self.path & mask) as usize
    }
}

impl fmt::Display for Proof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Proof {{ path: {:#b}, siblings: [", self.path)?;
        for (i, sibling) in self.siblings.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", short_hex(sibling))?;
        }
        write!(f, "] }}")
    }
}

/// Merkle tree over an ordered leaf list
#[derive(Debug, Clone)]
pub struct MerkleTree {
    mode: TreeMode,
    depth: usize,
    leaf_count: usize,
    root: HashString,
    /// Padded levels, level 0 first; kept in TreeBuild modes
    levels: Vec<Vec<HashString>>,
    /// First leaf index per digest; kept in TreeBuild modes
    leaf_map: HashMap<HashString, usize>,
    /// Per-leaf proofs; kept in ProofGen modes
    proofs: Vec<Proof>,
}

impl MerkleTree {
    /// Build a tree over `blocks`
    pub fn build<B>(blocks: &[B], config: MerkleConfig) -> Result<Self>
    where
        B: DataBlock + Sync,
    {
        let leaf_count = blocks.len();
        if leaf_count < 2 {
            return Err(Error::Merkle(format!(
                "need at least two leaves, got {}",
                leaf_count
            )));
        }
        let depth = tree_depth(leaf_count);
        if depth > MAX_DEPTH {
            return Err(Error::Merkle(format!(
                "{} leaves exceed the maximum depth of {}",
                leaf_count, MAX_DEPTH
            )));
        }

        let start = Instant::now();
        let leaves = digest_leaves(blocks, config.leaf_gen_parallel, config.num_routines)?;

        let mut levels = Vec::with_capacity(depth);
        let mut current = leaves;
        for level in 0..depth {
            if current.len() % 2 == 1 {
                let last = current[current.len() - 1];
                current.push(last);
            }
            let next = if level + 1 < depth {
                hash_level(&current, config.run_in_parallel, config.num_routines)
            } else {
                Vec::new()
            };
            levels.push(std::mem::replace(&mut current, next));
        }
        let top = &levels[depth - 1];
        debug_assert_eq!(top.len(), 2);
        let root = hash_pair(&top[0], &top[1]);

        let proofs = if config.mode.generates_proofs() {
            if config.run_in_parallel {
                (0..leaf_count)
                    .into_par_iter()
                    .map(|index| proof_from_levels(&levels, index))
                    .collect()
            } else {
                (0..leaf_count)
                    .map(|index| proof_from_levels(&levels, index))
                    .collect()
            }
        } else {
            Vec::new()
        };

        let leaf_map = if config.mode.builds_tree() {
            let mut map = HashMap::with_capacity(leaf_count);
            for (index, leaf) in levels[0].iter().take(leaf_count).enumerate() {
                map.entry(*leaf).or_insert(index);
            }
            map
        } else {
            levels.clear();
            HashMap::new()
        };

        histogram!(names::MERKLE_BUILD_DURATION).record(start.elapsed().as_secs_f64());
        counter!(names::MERKLE_TREES_BUILT).increment(1);
        debug!(
            leaves = leaf_count,
            depth,
            root = %short_hex(&root),
            mode = ?config.mode,
            "Built Merkle tree"
        );

        Ok(Self {
            mode: config.mode,
            depth,
            leaf_count,
            root,
            levels,
            leaf_map,
            proofs,
        })
    }

    /// Check `proof` for `block` against `root`
    ///
    /// `None` when the block cannot be digested.
    pub fn verify<B>(block: &B, proof: &Proof, root: &HashString) -> Option<bool>
    where
        B: DataBlock + ?Sized,
    {
        let leaf = block.digest()?;
        Some(proof.compute_root(&leaf) == *root)
    }

    /// Proof for `block`, looked up by its digest
    pub fn generate_proof<B>(&self, block: &B) -> Option<Proof>
    where
        B: DataBlock + ?Sized,
    {
        if !self.mode.builds_tree() {
            warn!(mode = ?self.mode, "Proof requested from a tree without retained levels");
            return None;
        }
        let leaf = block.digest()?;
        match self.leaf_map.get(&leaf) {
            Some(&index) => self.proof_at(index),
            None => {
                debug!(leaf = %short_hex(&leaf), "Block is not a member of the tree");
                None
            }
        }
    }

    /// Proof for the leaf at `index`, walking the retained levels
    pub fn proof_at(&self, index: usize) -> Option<Proof> {
        if self.levels.is_empty() {
            warn!(mode = ?self.mode, "Proof requested from a tree without retained levels");
            return None;
        }
        if index >= self.leaf_count {
            debug!(index, leaf_count = self.leaf_count, "Leaf index out of range");
            return None;
        }
        Some(proof_from_levels(&self.levels, index))
    }

    pub fn root(&self) -> &HashString {
        &self.root
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    pub fn mode(&self) -> TreeMode {
        self.mode
    }

    /// Precomputed proofs, empty in TreeBuild mode
    pub fn proofs(&self) -> &[Proof] {
        &self.proofs
    }

    pub fn proof(&self, index: usize) -> Option<&Proof> {
        self.proofs.get(index)
    }

    /// Leaf digests, empty in ProofGen mode
    pub fn leaves(&self) -> &[HashString] {
        self.levels
            .first()
            .map(|level| &level[..self.leaf_count])
            .unwrap_or(&[])
    }
}

/// `ceil(log2(n))` for `n >= 2`
pub fn tree_depth(leaf_count: usize) -> usize {
    debug_assert!(leaf_count >= 2);
    (usize::BITS - (leaf_count - 1).leading_zeros()) as usize
}

fn digest_leaves<B>(blocks: &[B], parallel: bool, requested: usize) -> Result<Vec<HashString>>
where
    B: DataBlock + Sync,
{
    let mut leaves = vec![[0u8; HASH_LEN]; blocks.len()];
    if parallel {
        let chunk = blocks
            .len()
            .div_ceil(calculate_num_routines(requested, blocks.len()));
        leaves
            .par_chunks_mut(chunk)
            .zip(blocks.par_chunks(chunk))
            .enumerate()
            .try_for_each(|(routine, (out, input))| {
                digest_into(out, input, routine * chunk)
            })?;
    } else {
        digest_into(&mut leaves, blocks, 0)?;
    }
    Ok(leaves)
}

fn digest_into<B: DataBlock>(out: &mut [HashString], blocks: &[B], offset: usize) -> Result<()> {
    for (i, (slot, block)) in out.iter_mut().zip(blocks).enumerate() {
        *slot = block.digest().ok_or(Error::DigestFailed(offset + i))?;
    }
    Ok(())
}

/// Hash adjacent pairs of an even-length level
fn hash_level(level: &[HashString], parallel: bool, requested: usize) -> Vec<HashString> {
    let pairs = level.len() / 2;
    let mut next = vec![[0u8; HASH_LEN]; pairs];
    let hash_chunk = |out: &mut [HashString], input: &[HashString]| {
        for (slot, pair) in out.iter_mut().zip(input.chunks_exact(2)) {
            *slot = hash_pair(&pair[0], &pair[1]);
        }
    };
    if parallel {
        let chunk = pairs.div_ceil(calculate_num_routines(requested, pairs));
        next.par_chunks_mut(chunk)
            .zip(level.par_chunks(chunk * 2))
            .for_each(|(out, input)| hash_chunk(out, input));
    } else {
        hash_chunk(&mut next, level);
    }
    next
}

fn proof_from_levels(levels: &[Vec<HashString>], index: usize) -> Proof {
    let mut siblings = Vec::with_capacity(levels.len());
    let mut path = 0u32;
    let mut node = index;
    for (level, nodes) in levels.iter().enumerate() {
        if node % 2 == 0 {
            siblings.push(nodes[node + 1]);
            path |= 1 << level;
        } else {
            siblings.push(nodes[node - 1]);
        }
        node >>= 1;
    }
    Proof { siblings, path }
}
