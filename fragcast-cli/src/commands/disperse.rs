//! Disperse Command
//!
//! Encodes a file into fragment envelopes, one file per range, plus a
//! manifest describing them.

use crate::manifest::{plan_ranges, range_file_name, Manifest, RangeEntry};
use anyhow::{Context, Result};
use console::style;
use fragcast_core::{ContentHash, FragcastConfig};
use fragcast_replicator::{EnvelopeHeader, FragmentEnvelope, FragmentGenerator};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::ThreadPool;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Disperse configuration
pub struct DisperseConfig {
    pub input: PathBuf,
    pub out: PathBuf,
    /// Fragments per envelope
    pub range_size: usize,
    /// Overrides the configured instance count
    pub instances: Option<usize>,
    pub block_number: u64,
    pub quiet: bool,
}

/// Run disperse command
pub fn run(
    settings: &FragcastConfig,
    workers: Arc<ThreadPool>,
    config: DisperseConfig,
) -> Result<Manifest> {
    let mut fragment = *settings
        .primary_fragment()
        .context("No [[erasure]] entry configured")?;
    if let Some(instances) = config.instances {
        fragment.instance_count = instances;
    }
    // One context at a time
    fragment.concurrency = 1;

    let message = fs::read(&config.input)
        .with_context(|| format!("Failed to read {}", config.input.display()))?;
    fs::create_dir_all(&config.out)
        .with_context(|| format!("Failed to create {}", config.out.display()))?;

    let generator = FragmentGenerator::new(&[fragment], workers)
        .context("Failed to provision erasure codecs")?;
    let mut context = generator.get_empty_context(&fragment)?;
    context
        .init_with_message(&message)
        .context("Failed to encode input")?;
    let root = context.root()?;

    let ranges = plan_ranges(context.fragment_count(), config.range_size);
    let pb = if config.quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(ranges.len() as u64)
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let mut entries = Vec::with_capacity(ranges.len());
    for (start, end) in ranges {
        let header =
            EnvelopeHeader::for_range(&context, config.block_number, message.len(), start, end)?;
        let raw = FragmentEnvelope::seal(&context, header)?;
        let file = range_file_name(start, end);
        fs::write(config.out.join(&file), &raw)
            .with_context(|| format!("Failed to write {}", file))?;
        pb.set_message(file.clone());
        pb.inc(1);
        entries.push(RangeEntry { start, end, file });
    }
    pb.finish_and_clear();

    let manifest = Manifest {
        source: config
            .input
            .file_name()
            .map(|name| name.to_string_lossy().into_owned()),
        block_number: config.block_number,
        message_size: message.len() as u64,
        content_hash: ContentHash::compute_parallel(&message),
        root: ContentHash::from_bytes(root),
        fragment,
        ranges: entries,
    };
    manifest.save(&config.out)?;
    info!(
        size = message.len(),
        ranges = manifest.ranges.len(),
        root = %manifest.root,
        "Dispersed input"
    );

    if !config.quiet {
        println!(
            "{} {} bytes -> {} envelopes in {}",
            style(super::CHECK).green(),
            message.len(),
            manifest.ranges.len(),
            config.out.display()
        );
        println!(
            "  k={} m={} instances={} root={}",
            fragment.data_shards,
            fragment.parity_shards,
            fragment.instance_count,
            style(&manifest.root).dim()
        );
    }
    Ok(manifest)
}
