//! Fragment range wire format
//!
//! All integers are little-endian:
//!
//! ```text
//! i64 depth
//! per leaf:
//!     u32 path
//!     i64 fresh_count
//!     fresh_count x [u8; 32]   siblings[0 .. fresh_count]
//!     u64 len, len x u8        shard bytes
//! ```
//!
//! The first leaf of a range carries its whole proof. Later leaves carry only
//! the siblings below the highest level where they differ from the preceding
//! leaf; the rest are inherited from it.

use crate::{ReplicatorError, Result};
use bytes::{Buf, BufMut, Bytes};
use fragcast_core::digest::{HashString, HASH_LEN};
use fragcast_core::merkle::{Proof, MAX_DEPTH};

pub fn put_depth(out: &mut Vec<u8>, depth: usize) {
    out.put_i64_le(depth as i64);
}

/// Number of low-level siblings `proof` must send after `previous`
pub fn fresh_count(previous: Option<&Proof>, proof: &Proof) -> usize {
    let depth = proof.depth();
    let Some(previous) = previous else {
        return depth;
    };
    let mut last = depth - 1;
    while last > 0 && previous.siblings[last] == proof.siblings[last] {
        last -= 1;
    }
    last + 1
}

pub fn put_leaf(out: &mut Vec<u8>, proof: &Proof, fresh: usize, shard: &[u8]) {
    out.reserve(4 + 8 + fresh * HASH_LEN + 8 + shard.len());
    out.put_u32_le(proof.path);
    out.put_i64_le(fresh as i64);
    for sibling in &proof.siblings[..fresh] {
        out.put_slice(sibling);
    }
    out.put_u64_le(shard.len() as u64);
    out.put_slice(shard);
}

/// Bounds-checked reader over a received range
///
/// Shards are returned as zero-copy slices of the input.
pub struct WireReader {
    buf: Bytes,
}

impl WireReader {
    pub fn new(raw: Bytes) -> Self {
        Self { buf: raw }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(ReplicatorError::malformed(format!(
                "truncated {}: need {} bytes, have {}",
                what,
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn get_i64(&mut self, what: &str) -> Result<i64> {
        self.need(8, what)?;
        Ok(self.buf.get_i64_le())
    }

    /// Tree depth heading the range
    pub fn read_depth(&mut self) -> Result<usize> {
        let depth = self.get_i64("depth")?;
        if depth < 1 || depth as usize > MAX_DEPTH {
            return Err(ReplicatorError::malformed(format!("invalid depth {}", depth)));
        }
        Ok(depth as usize)
    }

    /// Read one leaf, updating `running` with its fresh siblings
    ///
    /// After the call `running` holds the leaf's complete sibling list.
    pub fn read_leaf(&mut self, running: &mut [HashString], first: bool) -> Result<(u32, Bytes)> {
        self.need(4, "path")?;
        let path = self.buf.get_u32_le();

        let depth = running.len();
        let fresh = self.get_i64("sibling count")?;
        if fresh < 1 || fresh as usize > depth {
            return Err(ReplicatorError::malformed(format!(
                "sibling count {} outside 1..={}",
                fresh, depth
            )));
        }
        let fresh = fresh as usize;
        if first && fresh != depth {
            return Err(ReplicatorError::malformed(format!(
                "first leaf carries {} of {} siblings",
                fresh, depth
            )));
        }

        self.need(fresh * HASH_LEN, "siblings")?;
        for sibling in &mut running[..fresh] {
            self.buf.copy_to_slice(sibling);
        }

        self.need(8, "shard length")?;
        let len = self.buf.get_u64_le();
        let len = usize::try_from(len)
            .map_err(|_| ReplicatorError::malformed(format!("shard length {}", len)))?;
        self.need(len, "shard")?;
        Ok((path, self.buf.split_to(len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proof(siblings: &[u8], path: u32) -> Proof {
        Proof {
            siblings: siblings.iter().map(|&b| [b; HASH_LEN]).collect(),
            path,
        }
    }

    #[test]
    fn test_fresh_count() {
        let a = proof(&[1, 2, 3], 0b111);
        let b = proof(&[9, 2, 3], 0b110);
        let c = proof(&[8, 7, 3], 0b101);
        let d = proof(&[8, 7, 6], 0b011);
        assert_eq!(fresh_count(None, &a), 3);
        assert_eq!(fresh_count(Some(&a), &b), 1);
        assert_eq!(fresh_count(Some(&b), &c), 2);
        assert_eq!(fresh_count(Some(&c), &d), 3);
        // Identical proofs still send the lowest sibling
        assert_eq!(fresh_count(Some(&a), &a), 1);
    }

    #[test]
    fn test_leaf_layout() {
        let mut out = Vec::new();
        put_depth(&mut out, 2);
        put_leaf(&mut out, &proof(&[5, 6], 0b10), 2, b"abc");
        assert_eq!(out.len(), 8 + 4 + 8 + 64 + 8 + 3);
        assert_eq!(&out[..8], &2i64.to_le_bytes());
        assert_eq!(&out[8..12], &2u32.to_le_bytes());

        let mut reader = WireReader::new(Bytes::from(out));
        assert_eq!(reader.read_depth().unwrap(), 2);
        let mut running = vec![[0u8; HASH_LEN]; 2];
        let (path, shard) = reader.read_leaf(&mut running, true).unwrap();
        assert_eq!(path, 0b10);
        assert_eq!(&shard[..], b"abc");
        assert_eq!(running, vec![[5u8; HASH_LEN], [6u8; HASH_LEN]]);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_rejects_bad_input() {
        let mut reader = WireReader::new(Bytes::from_static(&[1, 0, 0]));
        assert!(matches!(
            reader.read_depth(),
            Err(ReplicatorError::Malformed(_))
        ));

        let mut out = Vec::new();
        put_depth(&mut out, 0);
        assert!(WireReader::new(Bytes::from(out)).read_depth().is_err());

        // Partial proof on the first leaf
        let mut out = Vec::new();
        put_leaf(&mut out, &proof(&[5, 6], 0), 1, b"x");
        let mut running = vec![[0u8; HASH_LEN]; 2];
        assert!(WireReader::new(Bytes::from(out.clone()))
            .read_leaf(&mut running, true)
            .is_err());
        assert!(WireReader::new(Bytes::from(out.clone()))
            .read_leaf(&mut running, false)
            .is_ok());

        // Truncated shard
        out.truncate(out.len() - 1);
        assert!(WireReader::new(Bytes::from(out))
            .read_leaf(&mut running, false)
            .is_err());
    }
}
