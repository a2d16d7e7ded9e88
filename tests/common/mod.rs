//! Shared fixtures: small raw volumes on disk and loaders over them.

#![allow(dead_code)]

use std::io::Write;
use std::sync::Arc;

use tempfile::NamedTempFile;

use block_streamer::cache::block::{BlockId, BlockSet};
use block_streamer::gpu::HeadlessBackend;
use block_streamer::streaming::{BlockCollection, BlockLoader, StepOutcome, StreamingLimits};
use block_streamer::transfer::disk_io::{BlockReader, BlockSource};
use block_streamer::volume::{DataType, VolumeGeometry, VolumeIndex};

/// A raw u8 volume of `blocks` 2x2x2 blocks laid out along x, with its index.
pub struct TestVolume {
    pub file: NamedTempFile,
    pub index: VolumeIndex,
}

impl TestVolume {
    pub fn new(blocks: u64) -> Self {
        let geometry = VolumeGeometry::new([2 * blocks, 2, 2], [blocks, 1, 1]).unwrap();
        let voxels = geometry.total_voxels() as usize;
        let bytes: Vec<u8> = (0..voxels).map(|i| (i * 7 % 251) as u8).collect();

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();
        file.flush().unwrap();

        let index = VolumeIndex::scan(file.path(), geometry, DataType::UChar).unwrap();
        Self { file, index }
    }

    /// Same volume with the range-of-values statistic replaced per block.
    pub fn with_range_of_values(blocks: u64, rov: &[f64]) -> Self {
        let mut volume = Self::new(blocks);
        for (meta, &value) in volume.index.blocks.iter_mut().zip(rov) {
            meta.range_of_values = value;
        }
        volume
    }

    pub fn block_set(&self) -> Arc<BlockSet> {
        Arc::new(BlockSet::from_index(&self.index))
    }

    pub fn reader(&self) -> BlockReader {
        BlockReader::open(
            self.file.path(),
            self.index.data_type,
            self.index.geometry,
            self.index.value_min,
            self.index.value_max,
        )
        .unwrap()
    }

    pub fn loader(&self, cpu: usize, gpu: usize, backend: &mut HeadlessBackend) -> BlockLoader {
        self.loader_with(self.reader(), cpu, gpu, backend)
    }

    pub fn loader_with<R: BlockSource + 'static>(
        &self,
        reader: R,
        cpu: usize,
        gpu: usize,
        backend: &mut HeadlessBackend,
    ) -> BlockLoader {
        let limits = StreamingLimits {
            max_cpu_blocks: cpu,
            max_gpu_blocks: gpu,
        };
        BlockLoader::new(self.block_set(), reader, limits, backend).unwrap()
    }

    pub fn collection(&self, cpu: usize, gpu: usize, backend: &mut HeadlessBackend) -> BlockCollection {
        BlockCollection::new(self.loader(cpu, gpu, backend))
    }

    /// Normalized pixels of block `id`, read straight from the file.
    pub fn pixels_of(&self, id: BlockId) -> Vec<f32> {
        let mut reader = self.reader();
        let mut out = vec![0.0; self.index.geometry.block_voxels()];
        reader.read_block(&self.index.blocks[id], &mut out).unwrap();
        out
    }
}

/// Step the loader on the calling thread until it has nothing runnable.
pub fn run_until_idle(loader: &BlockLoader) -> Vec<(StepOutcome, usize)> {
    let mut outcomes = Vec::new();
    while let Some(outcome) = loader.try_background_step() {
        outcomes.push((outcome, loader.stats().queue_depth));
        assert!(outcomes.len() < 10_000, "loader did not settle");
    }
    outcomes
}

/// Just the outcomes of `run_until_idle`.
pub fn drive(loader: &BlockLoader) -> Vec<StepOutcome> {
    run_until_idle(loader).into_iter().map(|(o, _)| o).collect()
}

/// Resource ownership matches status for every block, and pool accounting adds up.
pub fn assert_invariants(loader: &BlockLoader) {
    for block in loader.blocks().iter() {
        let r = loader.residency(block.id()).unwrap();
        assert_eq!(
            r.buffer.is_some(),
            r.status.holds_cpu_buffer(),
            "block {} is {} with buffer {:?}",
            block.id(),
            r.status,
            r.buffer
        );
        assert_eq!(
            r.texture.is_some(),
            r.status.holds_texture(),
            "block {} is {} with texture {:?}",
            block.id(),
            r.status,
            r.texture
        );
    }

    let stats = loader.stats();
    for tier in [&stats.main, &stats.gpu] {
        assert!(tier.occupants <= tier.capacity);
        assert_eq!(tier.occupants + tier.free, tier.capacity);
    }
}
