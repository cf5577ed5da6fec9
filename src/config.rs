//! Configuration Module
//!
//! Object layout configuration shared by every reader component, plus the
//! YAML file format consumed by the `ecstore` binary.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::num::NonZeroUsize;
use std::path::Path;
use thiserror::Error;

/// Largest stripe count a GF(2^8) Reed-Solomon code supports
pub const MAX_TOTAL_STRIPES: usize = 255;

/// Errors that can occur while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },
}

/// Layout of one erasure-coded object.
///
/// Immutable once a reader is built from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectConfig {
    /// Object name, the prefix of every chunk and container name
    pub object: String,
    /// Ordered placement group; each entry is a URL prefix of one server
    pub placement_group: Vec<String>,
    /// Number of data stripes per block (k)
    pub data_stripes: usize,
    /// Number of parity stripes per block (p)
    pub parity_stripes: usize,
    /// Logical bytes per block
    pub block_size: u64,
}

impl ObjectConfig {
    pub fn new(
        object: impl Into<String>,
        placement_group: Vec<String>,
        data_stripes: usize,
        parity_stripes: usize,
        block_size: u64,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            object: object.into(),
            placement_group,
            data_stripes,
            parity_stripes,
            block_size,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.object.is_empty() {
            return Err(invalid("object name must not be empty"));
        }

        if self.data_stripes == 0 {
            return Err(invalid("data_stripes must be greater than 0"));
        }

        if self.parity_stripes == 0 {
            return Err(invalid("parity_stripes must be greater than 0"));
        }

        if self.stripe_count() > MAX_TOTAL_STRIPES {
            return Err(invalid(format!(
                "total stripes ({}) cannot exceed {}",
                self.stripe_count(),
                MAX_TOTAL_STRIPES
            )));
        }

        if self.block_size < self.data_stripes as u64 {
            return Err(invalid(format!(
                "block_size ({}) must be at least data_stripes ({})",
                self.block_size, self.data_stripes
            )));
        }

        if self.placement_group.len() < self.stripe_count() {
            return Err(invalid(format!(
                "placement group has {} members, need at least {}",
                self.placement_group.len(),
                self.stripe_count()
            )));
        }

        let mut seen = HashSet::new();
        for server in &self.placement_group {
            if !seen.insert(server.as_str()) {
                return Err(invalid(format!("duplicate placement group member: {server}")));
            }
        }

        Ok(())
    }

    /// Data plus parity stripes per block (k + p)
    pub fn stripe_count(&self) -> usize {
        self.data_stripes + self.parity_stripes
    }

    /// Size of one stripe; the last data stripe of a block may be shorter
    pub fn stripe_size(&self) -> usize {
        self.block_size.div_ceil(self.data_stripes as u64) as usize
    }

    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }
}

/// Stripe cache sizing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Upper bound on cached blocks; unbounded when absent
    #[serde(default)]
    pub max_blocks: Option<NonZeroUsize>,
}

/// Everything the binary needs to build a reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderConfig {
    pub object: ObjectConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl ReaderConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.object.validate()?;
        Ok(config)
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidConfiguration {
        reason: reason.into(),
    }
}
