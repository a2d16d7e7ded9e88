//! Volume description: voxel data types, block grid geometry, and the
//! per-block metadata index.
//!
//! - [`geometry`]: DataType, VolumeGeometry (block extents, offsets, world transform)
//! - [`index`]: BlockMeta and VolumeIndex (JSON load/save, raw-file scan)

pub mod geometry;
pub mod index;

use std::path::PathBuf;

use thiserror::Error;

pub use geometry::{DataType, VolumeGeometry};
pub use index::{BlockMeta, VolumeIndex};

#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid index JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Index file not found: {0}")]
    IndexNotFound(PathBuf),

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Index lists {found} blocks, geometry requires {expected}")]
    BlockCountMismatch { expected: usize, found: usize },

    #[error("Block {index} has coordinate {found:?}, expected {expected:?}")]
    BlockOrder {
        index: usize,
        expected: [u64; 3],
        found: [u64; 3],
    },

    #[error("Raw file holds {actual} bytes, volume needs {required}")]
    RawFileTooShort { required: u64, actual: u64 },

    #[error("Index was built for {index:?} voxels but {configured:?} is configured")]
    DataTypeMismatch {
        index: DataType,
        configured: DataType,
    },

    #[error("Failed to read block data: {0}")]
    Read(#[from] crate::transfer::disk_io::DiskIoError),
}
