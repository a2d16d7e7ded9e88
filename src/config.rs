//! Runtime configuration for block-streamer.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Volume layout, tier capacities, the initial classification and the
//! listen address all live here.

use std::path::{Path, PathBuf};

use anyhow::bail;
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::cache::classifier::{ClassificationType, ValueRange};
use crate::streaming::StreamingLimits;
use crate::volume::{DataType, VolumeGeometry};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "block-streamer", about = "Out-of-core volume block streaming engine")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Build the block index by scanning the raw file if no index exists.
    #[arg(long)]
    pub scan: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Raw volume layout.
    pub volume: VolumeConfig,

    /// Tier capacities and frame pacing.
    pub streaming: StreamingConfig,

    /// Classification applied at startup.
    pub classification: ClassificationConfig,

    /// HTTP server configuration.
    pub server: ServerConfig,
}

/// Raw volume file and its block decomposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Path to the raw voxel file.
    pub data_path: PathBuf,

    /// Path to the block index (defaults to `<data_path>.index.json`).
    pub index_path: Option<PathBuf>,

    /// Voxel element type.
    pub data_type: DataType,

    /// Voxel dimensions of the raster; x and y are the row and slab sizes.
    pub dims: [u64; 3],

    /// Blocks along each axis.
    pub block_count: [u64; 3],
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("volume.raw"),
            index_path: None,
            data_type: DataType::Float,
            dims: [32, 32, 32],
            block_count: [1, 1, 1],
        }
    }
}

impl VolumeConfig {
    pub fn index_path(&self) -> PathBuf {
        self.index_path.clone().unwrap_or_else(|| {
            let mut name = self.data_path.clone().into_os_string();
            name.push(".index.json");
            PathBuf::from(name)
        })
    }
}

/// Tier capacities and render loop pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Main-memory tier capacity in blocks.
    pub max_cpu_blocks: usize,

    /// GPU tier capacity in blocks.
    pub max_gpu_blocks: usize,

    /// Time the render thread may spend uploading per frame.
    pub upload_budget_ms: u64,

    /// Frame cadence of the headless render loop.
    pub frame_interval_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_cpu_blocks: 64,
            max_gpu_blocks: 32,
            upload_budget_ms: 4,
            frame_interval_ms: 16,
        }
    }
}

impl StreamingConfig {
    pub fn limits(&self) -> StreamingLimits {
        StreamingLimits {
            max_cpu_blocks: self.max_cpu_blocks,
            max_gpu_blocks: self.max_gpu_blocks,
        }
    }
}

/// Initial classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
    pub kind: ClassificationType,
    pub low: f64,
    pub high: f64,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            kind: ClassificationType::RangeOfValues,
            low: 0.1,
            high: 1.0,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "127.0.0.1:8090").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8090".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Reject settings the loader cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let s = &self.streaming;
        if s.max_cpu_blocks == 0 || s.max_gpu_blocks == 0 {
            bail!("max_cpu_blocks and max_gpu_blocks must be non-zero");
        }
        if s.max_gpu_blocks > s.max_cpu_blocks {
            bail!(
                "max_gpu_blocks ({}) cannot exceed max_cpu_blocks ({}): GPU blocks keep their CPU buffer",
                s.max_gpu_blocks,
                s.max_cpu_blocks
            );
        }

        self.geometry()?;

        let c = &self.classification;
        ValueRange::new(c.low, c.high)?;
        Ok(())
    }

    /// Block decomposition described by the volume section.
    pub fn geometry(&self) -> anyhow::Result<VolumeGeometry> {
        Ok(VolumeGeometry::new(self.volume.dims, self.volume.block_count)?)
    }
}
