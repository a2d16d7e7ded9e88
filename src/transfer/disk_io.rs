//! Synchronous block reads from the raw volume file.
//!
//! A block is a sub-box of a larger raster, so its voxels are not contiguous
//! on disk: every row of every slab is a separate seek + read. Reads run on
//! the loader thread and block it; the render thread never touches the file.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::volume::{BlockMeta, DataType, VolumeGeometry};

#[derive(Error, Debug)]
pub enum DiskIoError {
    #[error("Cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Seek to byte {offset} failed: {source}")]
    Seek {
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("Read of {len} bytes at {offset} failed: {source}")]
    Read {
        offset: u64,
        len: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Pixel buffer too small: need {needed} voxels, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct DiskIoStats {
    pub blocks_read: u64,
    pub rows_read: u64,
    pub bytes_read: u64,
    pub failures: u64,
}

/// Anything the loader can pull block pixels from.
pub trait BlockSource: Send {
    /// Fill `out` with the block's normalized pixels, x-fastest.
    fn read_block(&mut self, meta: &BlockMeta, out: &mut [f32]) -> Result<(), DiskIoError>;

    /// Voxel type this source decodes.
    fn data_type(&self) -> DataType;

    fn stats(&self) -> DiskIoStats;
}

/// Reads blocks out of one raw file and normalizes them to `f32` pixels.
pub struct BlockReader {
    path: PathBuf,
    file: File,
    data_type: DataType,
    geometry: VolumeGeometry,
    value_min: f64,
    value_diff: f64,
    row: Vec<u8>,
    stats: DiskIoStats,
}

impl BlockReader {
    /// Open `path`. `value_min`/`value_max` are the raster's global value
    /// range used for normalization.
    pub fn open(
        path: &Path,
        data_type: DataType,
        geometry: VolumeGeometry,
        value_min: f64,
        value_max: f64,
    ) -> Result<Self, DiskIoError> {
        let file = File::open(path).map_err(|source| DiskIoError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            data_type,
            geometry,
            value_min,
            value_diff: value_max - value_min,
            row: Vec::new(),
            stats: DiskIoStats::default(),
        })
    }

    /// Read the block described by `meta` into `out` as normalized floats.
    ///
    /// `out` is filled x-fastest, then y, then z.
    pub fn read_block(&mut self, meta: &BlockMeta, out: &mut [f32]) -> Result<(), DiskIoError> {
        let result = self.read_rows(meta, out);
        if result.is_err() {
            self.stats.failures += 1;
        }
        result
    }

    fn read_rows(&mut self, meta: &BlockMeta, out: &mut [f32]) -> Result<(), DiskIoError> {
        let [ex, ey, ez] = meta.extent;
        let needed = (ex * ey * ez) as usize;
        if out.len() < needed {
            return Err(DiskIoError::BufferTooSmall {
                needed,
                available: out.len(),
            });
        }

        let size = self.data_type.size_bytes();
        let [vx, vy] = self.geometry.slab_dims();
        let len = ex as usize * size;
        self.row.resize(len, 0);

        let mut dst = 0;
        for slab in 0..ez {
            for row in 0..ey {
                let offset = meta.data_offset + (slab * vx * vy + row * vx) * size as u64;

                self.file
                    .seek(SeekFrom::Start(offset))
                    .map_err(|source| DiskIoError::Seek { offset, source })?;
                self.file
                    .read_exact(&mut self.row)
                    .map_err(|source| DiskIoError::Read { offset, len, source })?;

                for voxel in self.row.chunks_exact(size) {
                    out[dst] = normalize(self.data_type.decode(voxel), self.value_min, self.value_diff);
                    dst += 1;
                }
                self.stats.rows_read += 1;
            }
        }

        self.stats.blocks_read += 1;
        self.stats.bytes_read += (needed * size) as u64;

        debug!(
            path = %self.path.display(),
            coord = ?meta.coord,
            offset = meta.data_offset,
            voxels = needed,
            "Read block from disk"
        );

        Ok(())
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn stats(&self) -> DiskIoStats {
        self.stats
    }
}

impl BlockSource for BlockReader {
    fn read_block(&mut self, meta: &BlockMeta, out: &mut [f32]) -> Result<(), DiskIoError> {
        BlockReader::read_block(self, meta, out)
    }

    fn data_type(&self) -> DataType {
        self.data_type
    }

    fn stats(&self) -> DiskIoStats {
        self.stats
    }
}

fn normalize(value: f64, min: f64, diff: f64) -> f32 {
    if diff <= 0.0 {
        return 0.0;
    }
    ((value - min) / diff) as f32
}
