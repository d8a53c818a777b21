//! fragcast CLI
//!
//! Disperses files into authenticated erasure-coded fragment envelopes and
//! rebuilds them from any sufficient subset.
//!
//! # Commands
//! - `disperse` - Encode a file into envelopes plus a manifest
//! - `reconstruct` - Validate envelopes and rebuild the file
//! - `config` - Show or initialize configuration
//!
//! # Configuration
//! Config file: ~/.fragcast/config.toml (or `--config` / `FRAGCAST_CONFIG`)

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use console::style;
use fragcast_core::FragcastConfig;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod manifest;

use commands::{disperse, reconstruct};

#[derive(Parser)]
#[command(name = "fragcast")]
#[command(about = "Authenticated erasure-coded message dispersal")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.fragcast/config.toml)
    #[arg(long, global = true, env = "FRAGCAST_CONFIG")]
    config: Option<PathBuf>,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a file into fragment envelopes
    Disperse {
        /// File to disperse
        input: PathBuf,

        /// Output directory for envelopes and manifest.json
        #[arg(short, long)]
        out: PathBuf,

        /// Fragments per envelope
        #[arg(long, default_value_t = 4)]
        range_size: usize,

        /// Parallel encodings (overrides the config)
        #[arg(long)]
        instances: Option<usize>,

        /// Block number recorded in every envelope
        #[arg(long, default_value_t = 0)]
        block_number: u64,
    },

    /// Rebuild a file from dispersed envelopes
    Reconstruct {
        /// Directory holding manifest.json
        dir: PathBuf,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,

        /// Manifest range indices to validate, in order (default: all)
        #[arg(long, value_delimiter = ',')]
        ranges: Vec<usize>,
    },

    /// Show the effective configuration
    Config {
        /// Print the config file path only
        #[arg(long)]
        path: bool,

        /// Write the default configuration to the config file
        #[arg(long)]
        init: bool,

        /// Overwrite an existing file with --init
        #[arg(short, long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match (cli.quiet, cli.verbose) {
        (true, _) => Level::ERROR,
        (false, 0) => Level::WARN,
        (false, 1) => Level::INFO,
        (false, 2) => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();
    fragcast_core::metrics::describe_metrics();

    match cli.command {
        Commands::Disperse {
            input,
            out,
            range_size,
            instances,
            block_number,
        } => {
            let (settings, workers) = load_runtime(cli.config.as_deref())?;
            let config = disperse::DisperseConfig {
                input,
                out,
                range_size,
                instances,
                block_number,
                quiet: cli.quiet,
            };
            disperse(&settings, workers, config)?;
        }

        Commands::Reconstruct {
            dir,
            output,
            ranges,
        } => {
            let (_, workers) = load_runtime(cli.config.as_deref())?;
            let config = reconstruct::ReconstructConfig {
                dir,
                output,
                ranges,
                quiet: cli.quiet,
            };
            reconstruct(workers, config)?;
        }

        Commands::Config { path, init, force } => {
            handle_config_command(cli.config, path, init, force)?;
        }
    }

    Ok(())
}

/// Effective configuration and the worker pool it sizes
fn load_runtime(explicit: Option<&Path>) -> Result<(FragcastConfig, Arc<ThreadPool>)> {
    let (settings, source) = config::load(explicit)?;
    tracing::debug!(?source, "Loaded configuration");

    let workers = ThreadPoolBuilder::new()
        .num_threads(settings.workers.thread_count())
        .thread_name(|i| format!("fragcast-worker-{}", i))
        .build()
        .context("Failed to start worker pool")?;
    Ok((settings, Arc::new(workers)))
}

/// Handle the config command
fn handle_config_command(
    explicit: Option<PathBuf>,
    path_only: bool,
    init: bool,
    force: bool,
) -> Result<()> {
    let path = match explicit.clone() {
        Some(path) => path,
        None => config::config_file_path()?,
    };

    if path_only {
        println!("{}", path.display());
        return Ok(());
    }

    if init {
        if path.exists() && !force {
            println!(
                "{} Config file already exists at {}",
                style("!").yellow(),
                path.display()
            );
            println!("Use --force to overwrite");
            return Ok(());
        }
        config::save(&FragcastConfig::default(), &path)?;
        println!(
            "{} Config file created at {}",
            style(commands::CHECK).green(),
            path.display()
        );
        return Ok(());
    }

    let (settings, source) = config::load(explicit.as_deref())?;
    println!("{}", config::render(&settings)?);
    match source {
        config::Source::File(path) => {
            println!("{} {}", style("Config file:").dim(), path.display());
        }
        config::Source::Defaults => {
            println!(
                "{} {} {}",
                style("(defaults)").yellow(),
                style("Run").dim(),
                style("fragcast config --init").green()
            );
        }
    }
    Ok(())
}
