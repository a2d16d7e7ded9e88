//! Per-block metadata index.
//!
//! The index is produced once per dataset (by [`VolumeIndex::scan`] or an
//! external preprocessor) and read at startup to build the fixed block set.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::transfer::disk_io::BlockReader;
use crate::volume::{DataType, VolumeError, VolumeGeometry};

/// Metadata for one block, as recorded in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMeta {
    /// Grid coordinate (i, j, k).
    pub coord: [u64; 3],

    /// Byte offset of the block's first voxel in the raw file.
    pub data_offset: u64,

    /// Voxel extent of the block.
    pub extent: [u64; 3],

    /// Normalized max - min of the block's voxels.
    pub range_of_values: f64,

    /// Normalized mean of the block's voxels.
    pub average: f64,
}

/// The complete index for one raw volume file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeIndex {
    pub geometry: VolumeGeometry,

    pub data_type: DataType,

    /// Smallest raw value in the raster.
    pub value_min: f64,

    /// Largest raw value in the raster.
    pub value_max: f64,

    /// One entry per block, in linear index order.
    pub blocks: Vec<BlockMeta>,
}

impl VolumeIndex {
    /// Load an index from a JSON file.
    pub fn load(path: &Path) -> Result<Self, VolumeError> {
        if !path.exists() {
            return Err(VolumeError::IndexNotFound(path.to_path_buf()));
        }
        let data = std::fs::read_to_string(path)?;
        let index: VolumeIndex = serde_json::from_str(&data)?;
        index.validate()?;

        info!(
            path = %path.display(),
            blocks = index.blocks.len(),
            data_type = %index.data_type,
            "Loaded volume index"
        );
        Ok(index)
    }

    /// Write the index as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), VolumeError> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Check the block list against the geometry: right count, linear order,
    /// and extents matching the regular decomposition.
    pub fn validate(&self) -> Result<(), VolumeError> {
        let geometry = VolumeGeometry::new(self.geometry.dims, self.geometry.block_count)?;
        let expected = geometry.total_blocks();
        if self.blocks.len() != expected {
            return Err(VolumeError::BlockCountMismatch {
                expected,
                found: self.blocks.len(),
            });
        }

        for (index, meta) in self.blocks.iter().enumerate() {
            let coord = geometry.coord_of(index);
            if meta.coord != coord {
                return Err(VolumeError::BlockOrder {
                    index,
                    expected: coord,
                    found: meta.coord,
                });
            }
            if meta.extent != geometry.block_extent() {
                return Err(VolumeError::InvalidGeometry(format!(
                    "block {index} has extent {:?}, expected {:?}",
                    meta.extent,
                    geometry.block_extent()
                )));
            }
        }
        Ok(())
    }

    /// Build an index by reading the whole raw file.
    ///
    /// The first pass finds the raster's value range; the second reads every
    /// block through [`BlockReader`] and records its normalized statistics.
    pub fn scan(
        path: &Path,
        geometry: VolumeGeometry,
        data_type: DataType,
    ) -> Result<Self, VolumeError> {
        let (value_min, value_max) = value_range(path, &geometry, data_type)?;
        if value_min == value_max {
            warn!(value = value_min, "Volume is constant, every block normalizes to zero");
        }

        let mut reader = BlockReader::open(path, data_type, geometry, value_min, value_max)?;
        let mut pixels = vec![0.0f32; geometry.block_voxels()];
        let mut blocks = Vec::with_capacity(geometry.total_blocks());

        for index in 0..geometry.total_blocks() {
            let coord = geometry.coord_of(index);
            let mut meta = BlockMeta {
                coord,
                data_offset: geometry.block_byte_offset(coord, data_type),
                extent: geometry.block_extent(),
                range_of_values: 0.0,
                average: 0.0,
            };

            reader.read_block(&meta, &mut pixels)?;

            let (mut lo, mut hi, mut sum) = (f64::INFINITY, f64::NEG_INFINITY, 0.0f64);
            for &p in &pixels {
                let p = p as f64;
                lo = lo.min(p);
                hi = hi.max(p);
                sum += p;
            }
            meta.range_of_values = hi - lo;
            meta.average = sum / pixels.len() as f64;
            blocks.push(meta);
        }

        info!(
            path = %path.display(),
            blocks = blocks.len(),
            value_min,
            value_max,
            "Scanned volume"
        );

        Ok(Self {
            geometry,
            data_type,
            value_min,
            value_max,
            blocks,
        })
    }
}

/// Global min/max of the raster, streaming the file in chunks.
fn value_range(
    path: &Path,
    geometry: &VolumeGeometry,
    data_type: DataType,
) -> Result<(f64, f64), VolumeError> {
    let size = data_type.size_bytes();
    let required = geometry.total_voxels() * size as u64;
    let actual = std::fs::metadata(path)?.len();
    if actual < required {
        return Err(VolumeError::RawFileTooShort { required, actual });
    }

    let mut reader = BufReader::new(File::open(path)?);
    let mut chunk = vec![0u8; size * 16 * 1024];
    let mut remaining = required;
    let (mut lo, mut hi) = (f64::INFINITY, f64::NEG_INFINITY);

    while remaining > 0 {
        let take = chunk.len().min(remaining as usize);
        reader.read_exact(&mut chunk[..take])?;
        for voxel in chunk[..take].chunks_exact(size) {
            let v = data_type.decode(voxel);
            lo = lo.min(v);
            hi = hi.max(v);
        }
        remaining -= take as u64;
    }

    Ok((lo, hi))
}
