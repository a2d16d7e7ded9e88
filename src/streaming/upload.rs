//! Render-thread upload pump.
//!
//! Called once per frame. Pops `GpuReady` blocks and uploads their pixels
//! until the frame's streaming budget is spent; whatever is left waits for the
//! next frame. At least one ready block is handled per call so streaming
//! always makes progress.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::block::BlockStatus;
use crate::gpu::TextureBackend;
use crate::streaming::loader::{lock, BlockLoader};

/// What one call to [`BlockLoader::drain_ready_for_upload`] did.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UploadReport {
    pub uploaded: usize,
    pub failed: usize,
    /// Entries skipped because the block lost its texture before upload.
    pub stale: usize,
    /// Ready blocks left for later frames.
    pub remaining: usize,
    pub elapsed: Duration,
}

impl BlockLoader {
    /// Upload ready blocks until `budget` is exceeded or none are left.
    ///
    /// The cache lock is released during the upload itself; only the block's
    /// pixel buffer stays locked. A failed upload returns the texture to the
    /// pool and leaves the block `CpuResident`.
    pub fn drain_ready_for_upload<B>(&self, backend: &mut B, budget: Duration) -> UploadReport
    where
        B: TextureBackend + ?Sized,
    {
        let start = Instant::now();
        let shared = &self.shared;
        let extent = shared.blocks.geometry().block_extent();
        let mut report = UploadReport::default();
        let mut freed_texture = false;

        loop {
            let Some(id) = lock(&shared.ready).pop_front() else {
                break;
            };
            let Some(block) = shared.blocks.get(id) else {
                continue;
            };

            let mut cache = lock(&shared.cache);
            let (buffer, texture) =
                match (block.status(), cache.main.handle(id), cache.gpu.handle(id)) {
                    (BlockStatus::GpuReady, Some(buffer), Some(texture)) => (buffer, texture),
                    _ => {
                        cache.counters.stale_uploads += 1;
                        report.stale += 1;
                        continue;
                    }
                };
            let Some(pixels) = shared.buffers.lock(buffer) else {
                cache.counters.stale_uploads += 1;
                report.stale += 1;
                continue;
            };
            drop(cache);

            let result = backend.upload_pixels(texture, &pixels, extent);
            drop(pixels);

            let mut cache = lock(&shared.cache);
            let current =
                block.status() == BlockStatus::GpuReady && cache.gpu.handle(id) == Some(texture);

            match result {
                Ok(()) if current => {
                    block.set_status(BlockStatus::GpuResident);
                    cache.gpu.touch(id);
                    cache.counters.uploads += 1;
                    report.uploaded += 1;
                    debug!(block_id = id, texture = %texture, "Uploaded block");
                }
                Ok(()) => {
                    cache.counters.stale_uploads += 1;
                    report.stale += 1;
                }
                Err(e) => {
                    warn!(block_id = id, texture = %texture, error = %e, "Texture upload failed");
                    cache.counters.upload_failures += 1;
                    report.failed += 1;
                    if current {
                        cache.gpu.remove(id);
                        block.set_status(BlockStatus::CpuResident);
                        freed_texture = true;
                    }
                }
            }
            drop(cache);

            if start.elapsed() >= budget {
                break;
            }
        }

        report.remaining = lock(&shared.ready).len();
        report.elapsed = start.elapsed();

        if freed_texture {
            self.wake();
        }
        if report.uploaded > 0 || report.failed > 0 {
            debug!(
                uploaded = report.uploaded,
                failed = report.failed,
                remaining = report.remaining,
                elapsed_us = report.elapsed.as_micros() as u64,
                "Drained upload queue"
            );
        }
        report
    }
}
