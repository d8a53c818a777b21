//! Configuration file handling
//!
//! Default location: ~/.fragcast/config.toml. An explicit `--config` path
//! must exist; the default one falls back to built-in defaults.

use anyhow::{Context, Result};
use fragcast_core::FragcastConfig;
use std::fs;
use std::path::{Path, PathBuf};

/// Get the config directory path (~/.fragcast/)
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".fragcast"))
}

/// Get the default config file path
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Where the configuration comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    File(PathBuf),
    Defaults,
}

/// Load the effective configuration: file or defaults, then env overrides
pub fn load(explicit: Option<&Path>) -> Result<(FragcastConfig, Source)> {
    let (config, source) = match explicit {
        Some(path) => {
            let config = FragcastConfig::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?;
            (config, Source::File(path.to_path_buf()))
        }
        None => {
            let path = config_file_path()?;
            if path.exists() {
                let config = FragcastConfig::from_file(&path)
                    .with_context(|| format!("Failed to load config {}", path.display()))?;
                (config, Source::File(path))
            } else {
                (FragcastConfig::default(), Source::Defaults)
            }
        }
    };

    let config = config.with_env_overrides();
    config
        .validate()
        .context("Invalid configuration after environment overrides")?;
    Ok((config, source))
}

/// Render a configuration as TOML
pub fn render(config: &FragcastConfig) -> Result<String> {
    toml::to_string_pretty(config).context("Failed to serialize config")
}

/// Write `config` to `path`, creating parent directories
pub fn save(config: &FragcastConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(path, render(config)?).context("Failed to write config file")?;
    Ok(())
}
