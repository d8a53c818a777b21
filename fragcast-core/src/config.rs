//! Configuration management for fragcast
//!
//! Supports loading from TOML files and environment variables.

use crate::erasure::{CodecBackend, ErasureConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for crate::Error {
    fn from(err: ConfigError) -> Self {
        crate::Error::Configuration(err.to_string())
    }
}

/// Complete fragcast configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragcastConfig {
    /// Shared worker pool
    #[serde(default)]
    pub workers: WorkerSettings,

    /// Erasure configurations to provision codec pools for
    #[serde(default = "default_erasure")]
    pub erasure: Vec<FragmentConfig>,

    /// Block store settings
    #[serde(default)]
    pub store: StoreSettings,
}

impl Default for FragcastConfig {
    fn default() -> Self {
        Self {
            workers: WorkerSettings::default(),
            erasure: default_erasure(),
            store: StoreSettings::default(),
        }
    }
}

impl FragcastConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: FragcastConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load config, using defaults");
                Self::default()
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.erasure.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one [[erasure]] entry is required".to_string(),
            ));
        }
        for fragment in &self.erasure {
            fragment.validate()?;
        }
        self.store.validate()
    }

    /// Apply environment variable overrides to all settings
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(threads) = env_usize("FRAGCAST_THREADS") {
            self.workers.threads = threads;
        }

        // Shard overrides apply to every erasure entry
        if let Some(data_shards) = env_usize("FRAGCAST_DATA_SHARDS") {
            for fragment in &mut self.erasure {
                fragment.data_shards = data_shards;
            }
        }
        if let Some(parity_shards) = env_usize("FRAGCAST_PARITY_SHARDS") {
            for fragment in &mut self.erasure {
                fragment.parity_shards = parity_shards;
            }
        }

        if let Some(regions) = env_usize("FRAGCAST_REGIONS") {
            self.store.regions = regions;
        }

        self
    }

    /// The first erasure entry, used when a caller does not pick one
    pub fn primary_fragment(&self) -> Option<&FragmentConfig> {
        self.erasure.first()
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse::<usize>().ok())
}

/// Worker pool settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Thread count, 0 = number of CPUs
    #[serde(default)]
    pub threads: usize,
}

impl WorkerSettings {
    /// Resolved thread count
    pub fn thread_count(&self) -> usize {
        if self.threads > 0 {
            return self.threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// One dispersal configuration
///
/// `instance_count` independent encodings run side by side per message;
/// `concurrency` is the number of messages that may be in flight at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FragmentConfig {
    pub data_shards: usize,
    pub parity_shards: usize,
    #[serde(default = "default_one")]
    pub instance_count: usize,
    #[serde(default = "default_one")]
    pub concurrency: usize,
    #[serde(default)]
    pub backend: CodecBackend,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            data_shards: 11,
            parity_shards: 22,
            instance_count: 1,
            concurrency: 2,
            backend: CodecBackend::default(),
        }
    }
}

impl FragmentConfig {
    pub fn new(data_shards: usize, parity_shards: usize, instance_count: usize) -> Self {
        Self {
            data_shards,
            parity_shards,
            instance_count,
            concurrency: 1,
            backend: CodecBackend::default(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_backend(mut self, backend: CodecBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Number of fragment indices (k + m)
    pub fn fragment_count(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Codec instances this config needs in its pool
    pub fn codec_demand(&self) -> usize {
        self.instance_count * self.concurrency
    }

    pub fn erasure(&self) -> ErasureConfig {
        ErasureConfig {
            data_shards: self.data_shards,
            parity_shards: self.parity_shards,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |what: &str| {
            Err(ConfigError::ValidationError(format!(
                "{} in k={}, m={}",
                what, self.data_shards, self.parity_shards
            )))
        };
        if self.data_shards == 0 {
            return invalid("data_shards must be > 0");
        }
        if self.parity_shards == 0 {
            return invalid("parity_shards must be > 0");
        }
        if self.instance_count == 0 {
            return invalid("instance_count must be > 0");
        }
        if self.concurrency == 0 {
            return invalid("concurrency must be > 0");
        }
        if self.backend.resolve(&self.erasure()).is_none() {
            return invalid("no erasure backend supports this shard count");
        }
        Ok(())
    }
}

/// Block store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default = "default_one")]
    pub regions: usize,
    #[serde(default)]
    pub retention: RetentionSettings,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            regions: 1,
            retention: RetentionSettings::default(),
        }
    }
}

impl StoreSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.regions == 0 {
            return Err(ConfigError::ValidationError(
                "store.regions must be > 0".to_string(),
            ));
        }
        if self.retention.size() == 0 {
            return Err(ConfigError::ValidationError(
                "store.retention.size must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Cache retention per region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum RetentionSettings {
    /// Keep the newest `size` blocks
    Window { size: usize },
    /// Keep the `size` most recently used blocks
    Lru { size: usize },
}

impl Default for RetentionSettings {
    fn default() -> Self {
        RetentionSettings::Window { size: 64 }
    }
}

impl RetentionSettings {
    pub fn size(&self) -> usize {
        match self {
            RetentionSettings::Window { size } | RetentionSettings::Lru { size } => *size,
        }
    }
}

fn default_erasure() -> Vec<FragmentConfig> {
    vec![FragmentConfig::default()]
}

fn default_one() -> usize {
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = FragcastConfig::default();
        assert_eq!(config.erasure.len(), 1);
        assert_eq!(config.erasure[0].fragment_count(), 33);
        assert_eq!(config.store.regions, 1);
        assert_eq!(config.store.retention, RetentionSettings::Window { size: 64 });
        assert!(config.workers.thread_count() >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            [workers]
            threads = 4

            [[erasure]]
            data_shards = 11
            parity_shards = 22
            instance_count = 2
            concurrency = 3

            [[erasure]]
            data_shards = 4
            parity_shards = 2
            backend = "galois8"

            [store]
            regions = 3
            retention = { policy = "lru", size = 16 }
        "#;

        let config: FragcastConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.workers.thread_count(), 4);
        assert_eq!(config.erasure[0].codec_demand(), 6);
        assert_eq!(config.erasure[1].instance_count, 1);
        assert_eq!(config.erasure[1].backend, CodecBackend::Galois8);
        assert_eq!(config.store.regions, 3);
        assert_eq!(config.store.retention, RetentionSettings::Lru { size: 16 });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("fragcast.toml");
        std::fs::write(&path, "[store]\nregions = 2\n").unwrap();

        let config = FragcastConfig::from_file(&path).unwrap();
        assert_eq!(config.store.regions, 2);
        assert_eq!(config.erasure, default_erasure());

        let missing = FragcastConfig::load_or_default(temp_dir.path().join("absent.toml"));
        assert_eq!(missing.store.regions, 1);
    }

    #[test]
    fn test_config_validation() {
        let mut config = FragcastConfig::default();
        config.erasure[0].parity_shards = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = FragcastConfig::default();
        config.erasure.clear();
        assert!(config.validate().is_err());

        let mut config = FragcastConfig::default();
        config.store.retention = RetentionSettings::Window { size: 0 };
        assert!(config.validate().is_err());

        assert!(FragmentConfig::new(2, 2, 0).validate().is_err());
        assert!(FragmentConfig::new(2, 2, 1)
            .with_concurrency(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("FRAGCAST_DATA_SHARDS", "6");
        std::env::set_var("FRAGCAST_REGIONS", "5");
        let config = FragcastConfig::default().with_env_overrides();
        std::env::remove_var("FRAGCAST_DATA_SHARDS");
        std::env::remove_var("FRAGCAST_REGIONS");

        assert_eq!(config.erasure[0].data_shards, 6);
        assert_eq!(config.erasure[0].parity_shards, 22);
        assert_eq!(config.store.regions, 5);
    }
}
