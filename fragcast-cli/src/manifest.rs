//! Dispersal manifest (manifest.json)

use anyhow::{Context, Result};
use fragcast_core::{ContentHash, FragmentConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const MANIFEST_FILE: &str = "manifest.json";

/// One envelope file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeEntry {
    pub start: usize,
    pub end: usize,
    /// File name relative to the manifest
    pub file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Name of the dispersed input, if it had one
    pub source: Option<String>,
    pub block_number: u64,
    pub message_size: u64,
    /// Digest of the whole input, checked after regeneration
    pub content_hash: ContentHash,
    /// Merkle root every envelope must carry
    pub root: ContentHash,
    pub fragment: FragmentConfig,
    pub ranges: Vec<RangeEntry>,
}

impl Manifest {
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize manifest")?;
        fs::write(dir.join(MANIFEST_FILE), content).context("Failed to write manifest")
    }
}

/// Split `[0, count)` into consecutive ranges of at most `size` fragments
pub fn plan_ranges(count: usize, size: usize) -> Vec<(usize, usize)> {
    let size = size.max(1);
    (0..count)
        .step_by(size)
        .map(|start| (start, (start + size).min(count)))
        .collect()
}

pub fn range_file_name(start: usize, end: usize) -> String {
    format!("range-{:03}-{:03}.frag", start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_ranges() {
        assert_eq!(plan_ranges(10, 4), vec![(0, 4), (4, 8), (8, 10)]);
        assert_eq!(plan_ranges(3, 5), vec![(0, 3)]);
        assert_eq!(plan_ranges(2, 0), vec![(0, 1), (1, 2)]);
    }

    #[test]
    fn test_range_file_name() {
        assert_eq!(range_file_name(4, 12), "range-004-012.frag");
    }
}
