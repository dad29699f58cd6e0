//! Options for the tree and blob stores
//!
//! Both option structs deserialize with defaults for missing fields, so a
//! config file only needs to name what it overrides.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;

/// Default tree page size in bytes
pub const DEFAULT_PAGE_SIZE: usize = 8192;

/// Default number of tree pages kept in memory
pub const DEFAULT_CACHE_SIZE: usize = 256;

/// Default blob block size in bytes
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Default number of blob blocks kept in memory
pub const DEFAULT_CACHE_BLOCKS: usize = 32;

pub const MIN_PAGE_SIZE: usize = 256;
pub const MAX_PAGE_SIZE: usize = 64 * 1024;
pub const MIN_BLOCK_SIZE: usize = 64;
pub const MAX_BLOCK_SIZE: usize = 16 * 1024 * 1024;

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Options for a `BTree`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BTreeOptions {
    /// Size of each page in bytes, fixed for the life of the file
    pub page_size: usize,
    /// Number of pages kept in memory
    pub cache_size: usize,
}

impl Default for BTreeOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
        }
    }
}

impl BTreeOptions {
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    /// Check the size bounds that do not depend on the key type
    pub fn validate(&self) -> ConfigResult<()> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(ConfigError::Invalid(format!(
                "page_size {} outside [{MIN_PAGE_SIZE}, {MAX_PAGE_SIZE}]",
                self.page_size
            )));
        }
        if self.cache_size == 0 {
            return Err(ConfigError::Invalid("cache_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Options for a `BlobFileSystem`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobOptions {
    /// Size of each block in bytes, fixed for the life of the file
    pub block_size: usize,
    /// Number of blocks kept in memory
    pub cache_blocks: usize,
}

impl Default for BlobOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            cache_blocks: DEFAULT_CACHE_BLOCKS,
        }
    }
}

impl BlobOptions {
    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn cache_blocks(mut self, cache_blocks: usize) -> Self {
        self.cache_blocks = cache_blocks;
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size) {
            return Err(ConfigError::Invalid(format!(
                "block_size {} outside [{MIN_BLOCK_SIZE}, {MAX_BLOCK_SIZE}]",
                self.block_size
            )));
        }
        if self.cache_blocks == 0 {
            return Err(ConfigError::Invalid("cache_blocks must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Combined options for an application using both stores
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub btree: BTreeOptions,
    pub blob: BlobOptions,
}

impl StoreConfig {
    /// Parse and validate a JSON config
    pub fn from_json(text: &str) -> ConfigResult<Self> {
        let config: StoreConfig = serde_json::from_str(text)?;
        config.btree.validate()?;
        config.blob.validate()?;
        Ok(config)
    }

    /// Read a JSON config file
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}
