//! Benchmark configuration
//!
//! Layered, later layers win: built-in defaults, an optional TOML file,
//! `CONDUIT_*` environment variables, then command-line flags.

use anyhow::{bail, Context, Result};
use conduit_interop::diagnostics::DEFAULT_DIAGNOSTICS_CAPACITY;
use conduit_interop::session::{DEFAULT_DMA_QUEUE_CAPACITY, MAX_DMA_QUEUE_CAPACITY};
use conduit_shared::utils::parse_size;
use conduit_shared::{DEFAULT_FILE_COUNT, DEFAULT_UNIT_LEN};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Config file read when `--config` is not given, if it exists.
pub const DEFAULT_CONFIG_FILE: &str = "conduit.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process simulation of both APIs
    Loopback,
    /// D3D12 + DirectStorage exporting to Vulkan
    Native,
}

impl Default for Backend {
    fn default() -> Self {
        if cfg!(all(windows, feature = "native")) {
            Backend::Native
        } else {
            Backend::Loopback
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Backend::Loopback => "loopback",
            Backend::Native => "native",
        })
    }
}

impl std::str::FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "loopback" => Ok(Backend::Loopback),
            "native" => Ok(Backend::Native),
            _ => bail!("Invalid backend: {} (expected loopback or native)", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Directory holding `file0.bin .. file{N-1}.bin`
    pub data_dir: PathBuf,

    /// Bytes per file, and size of the shared buffer
    #[serde(deserialize_with = "deserialize_size")]
    pub unit_len: u64,

    /// Number of files per pass
    pub file_count: usize,

    /// Measured passes per strategy
    pub iterations: u32,

    /// Unmeasured passes before measuring
    pub warmup: u32,

    pub dma_queue_capacity: u16,

    pub diagnostics_capacity: usize,

    /// Enable the D3D12 debug layer (native backend only)
    pub debug_layer: bool,

    pub backend: Backend,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            unit_len: DEFAULT_UNIT_LEN,
            file_count: DEFAULT_FILE_COUNT,
            iterations: 5,
            warmup: 1,
            dma_queue_capacity: DEFAULT_DMA_QUEUE_CAPACITY,
            diagnostics_capacity: DEFAULT_DIAGNOSTICS_CAPACITY,
            debug_layer: false,
            backend: Backend::default(),
        }
    }
}

impl BenchConfig {
    /// Load defaults, then `path` (or `conduit.toml` if present), then the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&BenchConfig::default())
            .context("Failed to build default configuration")?;

        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE)
                .format(config::FileFormat::Toml)
                .required(false),
        };

        config::Config::builder()
            .add_source(defaults)
            .add_source(file)
            .add_source(config::Environment::with_prefix("CONDUIT").try_parsing(true))
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.unit_len == 0 {
            bail!("unit_len must be greater than zero");
        }
        if usize::try_from(self.unit_len).is_err() {
            bail!("unit_len {} does not fit in host memory", self.unit_len);
        }
        if self.file_count == 0 {
            bail!("file_count must be greater than zero");
        }
        if self.iterations == 0 {
            bail!("iterations must be greater than zero");
        }
        if self.dma_queue_capacity == 0 || self.dma_queue_capacity > MAX_DMA_QUEUE_CAPACITY {
            bail!(
                "dma_queue_capacity must be between 1 and {} (got {})",
                MAX_DMA_QUEUE_CAPACITY,
                self.dma_queue_capacity
            );
        }
        if self.diagnostics_capacity == 0 {
            bail!("diagnostics_capacity must be greater than zero");
        }
        Ok(())
    }
}

/// Accept plain byte counts or sizes with a suffix ("256KiB", "1M").
fn deserialize_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Bytes(u64),
        Text(String),
    }

    match Size::deserialize(deserializer)? {
        Size::Bytes(bytes) => Ok(bytes),
        Size::Text(text) => parse_size(&text).map_err(serde::de::Error::custom),
    }
}
