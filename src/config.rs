//! Configuration for patch creation

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::binary_diff::DEFAULT_LARGE_FILE_THRESHOLD;
use crate::create::{GeneratorOptions, ModifyStrategy};
use crate::error::{IoResultExt, PatchError, Result};
use crate::patch_format::Compression;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatchConfig {
    /// Where `create` writes patches when no output path is given
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Hashing threads used while scanning (1 = sequential)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Files larger than this are copied in chunks and never diffed
    #[serde(default = "default_large_file_threshold")]
    pub large_file_threshold: u64,

    #[serde(default = "default_true")]
    pub skip_identical: bool,

    #[serde(default)]
    pub compression: Compression,

    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    #[serde(default)]
    pub modify_strategy: ModifyStrategy,

    /// Split patches larger than this many bytes into parts
    #[serde(default)]
    pub max_part_size: Option<u64>,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("patches")
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

fn default_large_file_threshold() -> u64 {
    DEFAULT_LARGE_FILE_THRESHOLD
}

fn default_true() -> bool {
    true
}

fn default_compression_level() -> i32 {
    3
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            workers: default_workers(),
            large_file_threshold: default_large_file_threshold(),
            skip_identical: true,
            compression: Compression::default(),
            compression_level: default_compression_level(),
            modify_strategy: ModifyStrategy::default(),
            max_part_size: None,
        }
    }
}

impl PatchConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: PatchConfig = toml::from_str(contents)
            .map_err(|e| PatchError::Validation(format!("Invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file, or fall back to defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path).at(path)?;
                Self::from_toml_str(&contents)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(PatchError::Validation("workers must be at least 1".into()));
        }
        if self.max_part_size == Some(0) {
            return Err(PatchError::Validation("max_part_size must be positive".into()));
        }
        let levels = match self.compression {
            Compression::None => return Ok(()),
            Compression::Zstd => 1..=22,
            Compression::Gzip => 0..=9,
        };
        if !levels.contains(&self.compression_level) {
            return Err(PatchError::Validation(format!(
                "compression_level {} is out of range for {}",
                self.compression_level, self.compression
            )));
        }
        Ok(())
    }

    pub fn generator_options(&self) -> GeneratorOptions {
        GeneratorOptions {
            skip_identical: self.skip_identical,
            modify_strategy: self.modify_strategy,
            large_file_threshold: self.large_file_threshold,
        }
    }

    pub fn scan_workers(&self) -> usize {
        self.workers.max(1)
    }
}
