//! CLI Commands

pub mod disperse;
pub mod reconstruct;

pub use disperse::run as disperse;
pub use reconstruct::run as reconstruct;

use console::Emoji;

/// Checkmark, ASCII on terminals without emoji support
pub const CHECK: Emoji<'static, 'static> = Emoji("\u{2713}", "[OK]");

#[cfg(test)]
mod tests {
    use super::disperse::DisperseConfig;
    use super::reconstruct::ReconstructConfig;
    use super::*;
    use crate::manifest::Manifest;
    use fragcast_core::FragcastConfig;
    use rayon::{ThreadPool, ThreadPoolBuilder};
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;

    fn workers() -> Arc<ThreadPool> {
        Arc::new(ThreadPoolBuilder::new().num_threads(2).build().unwrap())
    }

    fn settings(k: usize, m: usize) -> FragcastConfig {
        let mut settings = FragcastConfig::default();
        settings.erasure[0].data_shards = k;
        settings.erasure[0].parity_shards = m;
        settings
    }

    fn disperse_file(dir: &Path, settings: &FragcastConfig, data: &[u8]) -> Manifest {
        let input = dir.join("input.bin");
        fs::write(&input, data).unwrap();
        disperse(
            settings,
            workers(),
            DisperseConfig {
                input,
                out: dir.join("out"),
                range_size: 2,
                instances: Some(2),
                block_number: 7,
                quiet: true,
            },
        )
        .unwrap()
    }

    fn reconstruct_with(dir: &Path, ranges: Vec<usize>) -> anyhow::Result<Vec<u8>> {
        let output = dir.join("restored.bin");
        reconstruct(
            workers(),
            ReconstructConfig {
                dir: dir.join("out"),
                output: output.clone(),
                ranges,
                quiet: true,
            },
        )?;
        Ok(fs::read(output)?)
    }

    #[test]
    fn test_disperse_then_reconstruct() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..123_457u32).map(|i| (i * 13 % 256) as u8).collect();
        let manifest = disperse_file(dir.path(), &settings(4, 6), &data);

        assert_eq!(manifest.ranges.len(), 5);
        assert_eq!(manifest.block_number, 7);
        assert_eq!(manifest.fragment.instance_count, 2);
        let reloaded = Manifest::load(&dir.path().join("out")).unwrap();
        assert_eq!(reloaded.root, manifest.root);

        // Parity ranges only, out of order
        assert_eq!(reconstruct_with(dir.path(), vec![4, 2, 3]).unwrap(), data);
        assert_eq!(reconstruct_with(dir.path(), Vec::new()).unwrap(), data);
    }

    #[test]
    fn test_reconstruct_skips_damaged_envelopes() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"a short message that still gets fragmented".repeat(50);
        let manifest = disperse_file(dir.path(), &settings(2, 4), &data);

        let damaged = dir.path().join("out").join(&manifest.ranges[0].file);
        let mut raw = fs::read(&damaged).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        fs::write(&damaged, raw).unwrap();
        fs::remove_file(dir.path().join("out").join(&manifest.ranges[1].file)).unwrap();

        assert!(reconstruct_with(dir.path(), vec![0, 1]).is_err());
        assert_eq!(reconstruct_with(dir.path(), vec![0, 1, 2]).unwrap(), data);
    }

    #[test]
    fn test_reconstruct_rejects_unknown_range() {
        let dir = tempfile::tempdir().unwrap();
        disperse_file(dir.path(), &settings(2, 2), b"tiny");
        assert!(reconstruct_with(dir.path(), vec![9]).is_err());
    }
}
