//! Reconstruct Command
//!
//! Validates envelopes listed in a manifest and rebuilds the original file.

use crate::manifest::{Manifest, RangeEntry};
use anyhow::{Context, Result};
use bytes::Bytes;
use console::style;
use fragcast_core::ContentHash;
use fragcast_replicator::{FragmentEnvelope, FragmentGenerator};
use rayon::ThreadPool;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Reconstruct configuration
pub struct ReconstructConfig {
    pub dir: PathBuf,
    pub output: PathBuf,
    /// Manifest range indices to use, in order; empty means all
    pub ranges: Vec<usize>,
    pub quiet: bool,
}

/// Run reconstruct command, returning the number of bytes written
pub fn run(workers: Arc<ThreadPool>, config: ReconstructConfig) -> Result<usize> {
    let manifest = Manifest::load(&config.dir)?;
    let selected: Vec<&RangeEntry> = if config.ranges.is_empty() {
        manifest.ranges.iter().collect()
    } else {
        config
            .ranges
            .iter()
            .map(|&index| {
                manifest.ranges.get(index).with_context(|| {
                    format!(
                        "Range {} not in manifest ({} ranges)",
                        index,
                        manifest.ranges.len()
                    )
                })
            })
            .collect::<Result<_>>()?
    };

    let fragment = manifest.fragment;
    let root = *manifest.root.as_bytes();
    let generator = FragmentGenerator::new(&[fragment], workers)
        .context("Failed to provision erasure codecs")?;
    let context = generator.get_empty_context(&fragment)?;

    for entry in selected {
        let path = config.dir.join(&entry.file);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(file = %entry.file, error = %e, "Skipping unreadable envelope");
                continue;
            }
        };
        let outcome = FragmentEnvelope::decode(Bytes::from(raw)).and_then(|envelope| {
            let range = envelope.header.range();
            if envelope.header.root != root || range != (entry.start..entry.end) {
                return Err(fragcast_replicator::ReplicatorError::Malformed(format!(
                    "{} does not match the manifest",
                    entry.file
                )));
            }
            context.validate_fragments_from(
                Some(&entry.file),
                &root,
                envelope.payload,
                range.start,
                range.end,
            )
        });
        match outcome {
            Ok(()) => info!(
                file = %entry.file,
                verified = context.verified_fragments(),
                "Validated envelope"
            ),
            Err(e) => warn!(file = %entry.file, error = %e, "Rejected envelope"),
        }
    }

    if !context.is_ready() {
        anyhow::bail!(
            "Only {} of {} required fragments verified",
            context.verified_fragments(),
            fragment.data_shards
        );
    }

    let mut message = Vec::new();
    context
        .regenerate_message(manifest.message_size as usize, &mut message)
        .context("Failed to regenerate input")?;
    let hash = ContentHash::compute_parallel(&message);
    if hash != manifest.content_hash {
        anyhow::bail!(
            "Regenerated content hash {} does not match manifest {}",
            hash,
            manifest.content_hash
        );
    }

    fs::write(&config.output, &message)
        .with_context(|| format!("Failed to write {}", config.output.display()))?;

    if !config.quiet {
        println!(
            "{} {} bytes from {} fragments -> {}",
            style(super::CHECK).green(),
            message.len(),
            context.verified_fragments(),
            config.output.display()
        );
    }
    Ok(message.len())
}
