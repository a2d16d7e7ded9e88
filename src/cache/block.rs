//! Block types and the fixed block set.
//!
//! A block is one cell of the regular volume grid and the unit of movement
//! between tiers. Blocks are created once from the index and live until
//! shutdown; only their status and visibility change afterwards.

use std::ops::Index;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::volume::{BlockMeta, DataType, VolumeGeometry, VolumeIndex};

/// Linear index of a block within its grid.
pub type BlockId = usize;

/// Identifies a residency tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Host memory pixel buffers.
    Main,
    /// GPU textures.
    Gpu,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Main => write!(f, "RAM"),
            Tier::Gpu => write!(f, "GPU"),
        }
    }
}

/// Residency state of a block.
///
/// A block owns a CPU buffer exactly in `CpuResident`, `GpuReady` and
/// `GpuResident`, and a texture exactly in `GpuReady` and `GpuResident`.
/// `Loading` blocks are read into the loader's scratch buffer and own nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlockStatus {
    Unloaded = 0,
    Loading = 1,
    CpuResident = 2,
    GpuReady = 3,
    GpuResident = 4,
}

impl BlockStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => BlockStatus::Loading,
            2 => BlockStatus::CpuResident,
            3 => BlockStatus::GpuReady,
            4 => BlockStatus::GpuResident,
            _ => BlockStatus::Unloaded,
        }
    }

    pub fn holds_cpu_buffer(&self) -> bool {
        matches!(
            self,
            BlockStatus::CpuResident | BlockStatus::GpuReady | BlockStatus::GpuResident
        )
    }

    pub fn holds_texture(&self) -> bool {
        matches!(self, BlockStatus::GpuReady | BlockStatus::GpuResident)
    }
}

impl std::fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BlockStatus::Unloaded => "unloaded",
            BlockStatus::Loading => "loading",
            BlockStatus::CpuResident => "cpu-resident",
            BlockStatus::GpuReady => "gpu-ready",
            BlockStatus::GpuResident => "gpu-resident",
        };
        f.write_str(name)
    }
}

/// One block of the volume.
#[derive(Debug)]
pub struct Block {
    id: BlockId,

    meta: BlockMeta,

    /// World-space centre of the block.
    origin: [f32; 3],

    /// World-space size of the block.
    scale: [f32; 3],

    status: AtomicU8,

    /// Set by classification, read by the loader when picking eviction victims.
    visible: AtomicBool,
}

impl Block {
    pub fn new(meta: BlockMeta, geometry: &VolumeGeometry) -> Self {
        Self {
            id: geometry.linear_index(meta.coord),
            origin: geometry.world_origin(meta.coord),
            scale: geometry.world_scale(),
            meta,
            status: AtomicU8::new(BlockStatus::Unloaded as u8),
            visible: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn coord(&self) -> [u64; 3] {
        self.meta.coord
    }

    pub fn extent(&self) -> [u64; 3] {
        self.meta.extent
    }

    pub fn origin(&self) -> [f32; 3] {
        self.origin
    }

    pub fn scale(&self) -> [f32; 3] {
        self.scale
    }

    pub fn meta(&self) -> &BlockMeta {
        &self.meta
    }

    pub fn range_of_values(&self) -> f64 {
        self.meta.range_of_values
    }

    pub fn average(&self) -> f64 {
        self.meta.average
    }

    pub fn status(&self) -> BlockStatus {
        BlockStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Status changes are made while holding the loader's cache lock.
    pub(crate) fn set_status(&self, status: BlockStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::Acquire)
    }

    pub(crate) fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::Release);
    }
}

/// The complete, fixed set of blocks for one volume.
#[derive(Debug)]
pub struct BlockSet {
    geometry: VolumeGeometry,
    data_type: DataType,
    blocks: Vec<Block>,
}

impl BlockSet {
    /// Build the block set from a validated index.
    pub fn from_index(index: &VolumeIndex) -> Self {
        let blocks = index
            .blocks
            .iter()
            .map(|meta| Block::new(meta.clone(), &index.geometry))
            .collect();

        Self {
            geometry: index.geometry,
            data_type: index.data_type,
            blocks,
        }
    }

    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    /// Voxel type of the raw file the blocks were indexed from.
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn get(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Block> {
        self.blocks.iter()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Number of blocks currently in `status`.
    pub fn count_status(&self, status: BlockStatus) -> usize {
        self.blocks.iter().filter(|b| b.status() == status).count()
    }
}

impl Index<BlockId> for BlockSet {
    type Output = Block;

    fn index(&self, id: BlockId) -> &Block {
        &self.blocks[id]
    }
}
