//! Voxel data types and the regular block decomposition of a volume.
//!
//! The geometry is an immutable value handed to everything that needs block
//! dimensions (block construction, the disk reader, the loader), so several
//! independent volumes can coexist in one process.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::volume::VolumeError;

/// Element type of the raw volume file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Char,
    #[serde(alias = "unsigned char")]
    UChar,
    Short,
    #[serde(alias = "unsigned short")]
    UShort,
    Int,
    #[serde(alias = "unsigned integer")]
    UInt,
    Float,
}

impl DataType {
    /// Bytes occupied by one voxel on disk.
    pub fn size_bytes(&self) -> usize {
        match self {
            DataType::Char | DataType::UChar => 1,
            DataType::Short | DataType::UShort => 2,
            DataType::Int | DataType::UInt | DataType::Float => 4,
        }
    }

    /// Decode one native-endian voxel. `bytes` must hold exactly `size_bytes()`.
    pub fn decode(&self, bytes: &[u8]) -> f64 {
        match self {
            DataType::Char => bytemuck::pod_read_unaligned::<i8>(bytes) as f64,
            DataType::UChar => bytes[0] as f64,
            DataType::Short => bytemuck::pod_read_unaligned::<i16>(bytes) as f64,
            DataType::UShort => bytemuck::pod_read_unaligned::<u16>(bytes) as f64,
            DataType::Int => bytemuck::pod_read_unaligned::<i32>(bytes) as f64,
            DataType::UInt => bytemuck::pod_read_unaligned::<u32>(bytes) as f64,
            DataType::Float => bytemuck::pod_read_unaligned::<f32>(bytes) as f64,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Char => "char",
            DataType::UChar => "uchar",
            DataType::Short => "short",
            DataType::UShort => "ushort",
            DataType::Int => "int",
            DataType::UInt => "uint",
            DataType::Float => "float",
        };
        f.write_str(name)
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "char" => Ok(DataType::Char),
            "uchar" | "unsigned char" => Ok(DataType::UChar),
            "short" => Ok(DataType::Short),
            "ushort" | "unsigned short" => Ok(DataType::UShort),
            "int" => Ok(DataType::Int),
            "uint" | "unsigned integer" => Ok(DataType::UInt),
            "float" => Ok(DataType::Float),
            other => Err(format!("unknown data type '{other}'")),
        }
    }
}

/// Regular decomposition of a `dims` voxel raster into `block_count` blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGeometry {
    /// Voxel dimensions of the whole raster (x is the row length, x*y the slab).
    pub dims: [u64; 3],

    /// Number of blocks along each axis.
    pub block_count: [u64; 3],
}

impl VolumeGeometry {
    /// Validate and build a geometry. Every axis must divide evenly into blocks.
    pub fn new(dims: [u64; 3], block_count: [u64; 3]) -> Result<Self, VolumeError> {
        for axis in 0..3 {
            if dims[axis] == 0 || block_count[axis] == 0 {
                return Err(VolumeError::InvalidGeometry(format!(
                    "axis {axis}: dims {} and block count {} must be non-zero",
                    dims[axis], block_count[axis]
                )));
            }
            if dims[axis] % block_count[axis] != 0 {
                return Err(VolumeError::InvalidGeometry(format!(
                    "axis {axis}: {} voxels do not split into {} equal blocks",
                    dims[axis], block_count[axis]
                )));
            }
        }
        Ok(Self { dims, block_count })
    }

    /// Voxel extent of every block.
    pub fn block_extent(&self) -> [u64; 3] {
        [
            self.dims[0] / self.block_count[0],
            self.dims[1] / self.block_count[1],
            self.dims[2] / self.block_count[2],
        ]
    }

    /// Number of voxels in one block (also the length of its pixel buffer).
    pub fn block_voxels(&self) -> usize {
        let e = self.block_extent();
        (e[0] * e[1] * e[2]) as usize
    }

    pub fn total_blocks(&self) -> usize {
        (self.block_count[0] * self.block_count[1] * self.block_count[2]) as usize
    }

    pub fn total_voxels(&self) -> u64 {
        self.dims[0] * self.dims[1] * self.dims[2]
    }

    /// Row and slab dimensions used to address voxels in the raw file.
    pub fn slab_dims(&self) -> [u64; 2] {
        [self.dims[0], self.dims[1]]
    }

    /// Linear block index of grid coordinate (i, j, k).
    pub fn linear_index(&self, coord: [u64; 3]) -> usize {
        let [nx, ny, _] = self.block_count;
        (coord[0] + coord[1] * nx + coord[2] * nx * ny) as usize
    }

    /// Grid coordinate of a linear block index.
    pub fn coord_of(&self, index: usize) -> [u64; 3] {
        let [nx, ny, _] = self.block_count;
        let index = index as u64;
        [index % nx, (index / nx) % ny, index / (nx * ny)]
    }

    /// Element offset of a voxel within the raster.
    pub fn voxel_offset(&self, voxel: [u64; 3]) -> u64 {
        let [vx, vy] = self.slab_dims();
        voxel[0] + voxel[1] * vx + voxel[2] * vx * vy
    }

    /// First voxel of block `coord`.
    pub fn block_start(&self, coord: [u64; 3]) -> [u64; 3] {
        let e = self.block_extent();
        [coord[0] * e[0], coord[1] * e[1], coord[2] * e[2]]
    }

    /// Byte offset of block `coord`'s first voxel in the raw file.
    pub fn block_byte_offset(&self, coord: [u64; 3], data_type: DataType) -> u64 {
        self.voxel_offset(self.block_start(coord)) * data_type.size_bytes() as u64
    }

    /// World-space size of one block. The whole volume spans a unit cube.
    pub fn world_scale(&self) -> [f32; 3] {
        [
            1.0 / self.block_count[0] as f32,
            1.0 / self.block_count[1] as f32,
            1.0 / self.block_count[2] as f32,
        ]
    }

    /// World-space centre of block `coord`, with the volume centred on the origin.
    pub fn world_origin(&self, coord: [u64; 3]) -> [f32; 3] {
        let s = self.world_scale();
        [
            coord[0] as f32 * s[0] + s[0] * 0.5 - 0.5,
            coord[1] as f32 * s[1] + s[1] * 0.5 - 0.5,
            coord[2] as f32 * s[2] + s[2] * 0.5 - 0.5,
        ]
    }
}
