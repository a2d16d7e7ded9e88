//! BlockCollection: the façade the render loop and control surface use.
//!
//! It ties a classification (statistic + range) to the loader: every change
//! repartitions the blocks, publishes the visible flags and replaces the
//! loader's work queue.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::block::{BlockId, BlockSet, BlockStatus};
use crate::cache::classifier::{classify, ClassificationError, ClassificationType, ValueRange};
use crate::gpu::TextureBackend;
use crate::streaming::loader::{lock, BlockLoader, DrawItem, LoaderStats, Residency};
use crate::streaming::upload::UploadReport;
use crate::streaming::StreamError;

/// The active classification and how many blocks it shows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassificationState {
    pub kind: ClassificationType,
    pub low: f64,
    pub high: f64,
    pub shown: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub unloaded: usize,
    pub loading: usize,
    pub cpu_resident: usize,
    pub gpu_ready: usize,
    pub gpu_resident: usize,
}

impl StatusCounts {
    pub fn of(blocks: &BlockSet) -> Self {
        let mut counts = Self::default();
        for block in blocks.iter() {
            match block.status() {
                BlockStatus::Unloaded => counts.unloaded += 1,
                BlockStatus::Loading => counts.loading += 1,
                BlockStatus::CpuResident => counts.cpu_resident += 1,
                BlockStatus::GpuReady => counts.gpu_ready += 1,
                BlockStatus::GpuResident => counts.gpu_resident += 1,
            }
        }
        counts
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionStats {
    pub total_blocks: usize,
    pub classification: ClassificationState,
    pub status: StatusCounts,
    pub loader: LoaderStats,
}

pub struct BlockCollection {
    loader: BlockLoader,
    classification: Mutex<ClassificationState>,
}

impl BlockCollection {
    /// Wrap `loader`. Nothing is visible until a classification is applied.
    pub fn new(loader: BlockLoader) -> Self {
        Self {
            loader,
            classification: Mutex::new(ClassificationState {
                kind: ClassificationType::default(),
                low: 0.0,
                high: 0.0,
                shown: 0,
            }),
        }
    }

    pub fn loader(&self) -> &BlockLoader {
        &self.loader
    }

    pub fn blocks(&self) -> &Arc<BlockSet> {
        self.loader.blocks()
    }

    /// Start the background loader thread.
    pub fn start(&self) -> Result<(), StreamError> {
        self.loader.start()
    }

    /// Set both the statistic and the range in one pass.
    pub fn set_classification(
        &self,
        kind: ClassificationType,
        low: f64,
        high: f64,
    ) -> Result<usize, ClassificationError> {
        let range = ValueRange::new(low, high)?;
        let mut state = lock(&self.classification);
        state.kind = kind;
        state.low = range.low();
        state.high = range.high();
        Ok(self.reclassify(&mut state))
    }

    /// Change the visible range. An invalid range is rejected and the
    /// previous classification stays in effect. Returns the shown count.
    pub fn set_classification_range(&self, low: f64, high: f64) -> Result<usize, ClassificationError> {
        let range = ValueRange::new(low, high)?;
        let mut state = lock(&self.classification);
        state.low = range.low();
        state.high = range.high();
        Ok(self.reclassify(&mut state))
    }

    /// Change the statistic, keeping the current range. Returns the shown count.
    pub fn set_classification_type(&self, kind: ClassificationType) -> usize {
        let mut state = lock(&self.classification);
        state.kind = kind;
        self.reclassify(&mut state)
    }

    pub fn classification(&self) -> ClassificationState {
        *lock(&self.classification)
    }

    fn reclassify(&self, state: &mut ClassificationState) -> usize {
        let blocks = self.loader.blocks();
        let classification = classify(blocks, state.kind, state.low, state.high);
        classification.publish(blocks);
        let epoch = self
            .loader
            .enqueue_visible(&classification.visible, &classification.not_visible);
        state.shown = classification.shown();

        info!(
            kind = %state.kind,
            low = state.low,
            high = state.high,
            shown = state.shown,
            total = blocks.len(),
            epoch,
            "Applied classification"
        );
        state.shown
    }

    /// Per-frame upload pump, see [`BlockLoader::drain_ready_for_upload`].
    pub fn load_some_blocks<B>(&self, backend: &mut B, budget: Duration) -> UploadReport
    where
        B: TextureBackend + ?Sized,
    {
        self.loader.drain_ready_for_upload(backend, budget)
    }

    pub fn visible_gpu_resident_blocks(&self) -> Vec<DrawItem<'_>> {
        self.loader.visible_gpu_resident_blocks()
    }

    pub fn residency(&self, id: BlockId) -> Option<Residency> {
        self.loader.residency(id)
    }

    pub fn stats(&self) -> CollectionStats {
        let blocks = self.loader.blocks();
        CollectionStats {
            total_blocks: blocks.len(),
            classification: self.classification(),
            status: StatusCounts::of(blocks),
            loader: self.loader.stats(),
        }
    }

    /// Stop loading and release every texture to `backend`.
    pub fn shutdown<B>(&self, backend: &mut B) -> usize
    where
        B: TextureBackend + ?Sized,
    {
        self.loader.shutdown(backend)
    }
}
