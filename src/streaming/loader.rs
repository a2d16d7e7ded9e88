//! Background block loader.
//!
//! The loader owns both cache tiers and advances queued blocks one step at a
//! time on a dedicated thread:
//!
//! ```text
//! Unloaded --read--> CpuResident --GPU admit--> GpuReady --upload--> GpuResident
//! ```
//!
//! Locks, always taken in this order when nested: `io` -> `cache` -> pixel
//! slot / `ready`. The work queue lock is never held together with another.
//! Block status only changes while the cache lock is held.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::block::{Block, BlockId, BlockSet, BlockStatus, Tier};
use crate::cache::pool::{BufferId, PixelBuffers, ResourcePool};
use crate::cache::tier::{Admission, CacheTier, TierStats};
use crate::gpu::{EvictionHook, TextureBackend, TextureHandle};
use crate::streaming::queue::{QueueStats, WorkQueue};
use crate::streaming::StreamError;
use crate::transfer::disk_io::{BlockSource, DiskIoStats};

/// Tier capacities, in blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingLimits {
    pub max_cpu_blocks: usize,
    pub max_gpu_blocks: usize,
}

/// What one loader step did with the block it popped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepOutcome {
    /// Block is not visible; nothing to do.
    Skipped,
    /// Block already holds a texture.
    AlreadyResident,
    /// Read from disk into main memory and re-queued for GPU admission.
    Loaded,
    /// Admitted to the GPU tier and handed to the upload queue.
    Promoted,
    /// A tier was full of visible blocks; retried later.
    Deferred,
    /// The disk read failed; block left unloaded.
    ReadFailed,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct LoaderCounters {
    pub disk_reads: u64,
    pub read_failures: u64,
    pub loads: u64,
    pub promotions: u64,
    pub deferrals: u64,
    pub skipped: u64,
    pub already_resident: u64,
    pub uploads: u64,
    pub upload_failures: u64,
    /// Ready entries dropped because the block was evicted before upload.
    pub stale_uploads: u64,
}

/// Snapshot of one block's residency, taken under the cache lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Residency {
    pub status: BlockStatus,
    pub visible: bool,
    pub buffer: Option<BufferId>,
    pub texture: Option<TextureHandle>,
}

/// A block ready to draw and the texture holding it.
#[derive(Debug, Clone, Copy)]
pub struct DrawItem<'a> {
    pub block: &'a Block,
    pub texture: TextureHandle,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoaderStats {
    pub main: TierStats,
    pub gpu: TierStats,
    pub queue_depth: usize,
    pub ready_depth: usize,
    pub epoch: u64,
    pub parked: bool,
    pub running: bool,
    pub counters: LoaderCounters,
    pub queue: QueueStats,
    pub disk: DiskIoStats,
}

pub(crate) struct CacheState {
    pub(crate) main: CacheTier<BufferId>,
    pub(crate) gpu: CacheTier<TextureHandle>,
    pub(crate) counters: LoaderCounters,
    disk: DiskIoStats,
}

struct LoaderIo {
    reader: Box<dyn BlockSource>,
    /// One block of pixels; reads land here before a buffer is claimed.
    scratch: Vec<f32>,
}

pub(crate) struct Shared {
    pub(crate) blocks: Arc<BlockSet>,
    pub(crate) cache: Mutex<CacheState>,
    pub(crate) buffers: PixelBuffers,
    pub(crate) ready: Mutex<VecDeque<BlockId>>,
    queue: Mutex<WorkQueue>,
    work_ready: Condvar,
    idle: Condvar,
    io: Mutex<LoaderIo>,
    stop: AtomicBool,
    hook: Mutex<Option<EvictionHook>>,
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Streams blocks through the main-memory and GPU tiers.
pub struct BlockLoader {
    pub(crate) shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BlockLoader {
    /// Build a loader over `blocks`, allocating `max_gpu_blocks` textures from
    /// `backend` and `max_cpu_blocks` pixel buffers up front.
    pub fn new<R, B>(
        blocks: Arc<BlockSet>,
        reader: R,
        limits: StreamingLimits,
        backend: &mut B,
    ) -> Result<Self, StreamError>
    where
        R: BlockSource + 'static,
        B: TextureBackend + ?Sized,
    {
        if limits.max_cpu_blocks == 0 || limits.max_gpu_blocks == 0 {
            return Err(StreamError::InvalidCapacity(format!(
                "tier capacities must be non-zero (cpu {}, gpu {})",
                limits.max_cpu_blocks, limits.max_gpu_blocks
            )));
        }
        if limits.max_gpu_blocks > limits.max_cpu_blocks {
            return Err(StreamError::InvalidCapacity(format!(
                "max_gpu_blocks {} exceeds max_cpu_blocks {}",
                limits.max_gpu_blocks, limits.max_cpu_blocks
            )));
        }
        if reader.data_type() != blocks.data_type() {
            return Err(StreamError::DataTypeMismatch {
                reader: reader.data_type(),
                index: blocks.data_type(),
            });
        }

        let extent = blocks.geometry().block_extent();
        let voxels = blocks.geometry().block_voxels();

        let mut textures = Vec::with_capacity(limits.max_gpu_blocks);
        for _ in 0..limits.max_gpu_blocks {
            match backend.allocate_texture_handle(extent) {
                Ok(handle) => textures.push(handle),
                Err(e) => {
                    for handle in textures {
                        backend.release_texture_handle(handle);
                    }
                    return Err(e.into());
                }
            }
        }

        let buffers = PixelBuffers::new(limits.max_cpu_blocks, voxels);
        let main = CacheTier::new(Tier::Main, ResourcePool::new(buffers.ids()));
        let gpu = CacheTier::new(Tier::Gpu, ResourcePool::new(textures));

        info!(
            blocks = blocks.len(),
            max_cpu_blocks = limits.max_cpu_blocks,
            max_gpu_blocks = limits.max_gpu_blocks,
            extent = ?extent,
            "Created block loader"
        );

        let shared = Shared {
            blocks,
            cache: Mutex::new(CacheState {
                main,
                gpu,
                counters: LoaderCounters::default(),
                disk: DiskIoStats::default(),
            }),
            buffers,
            ready: Mutex::new(VecDeque::new()),
            queue: Mutex::new(WorkQueue::new()),
            work_ready: Condvar::new(),
            idle: Condvar::new(),
            io: Mutex::new(LoaderIo {
                reader: Box::new(reader),
                scratch: vec![0.0; voxels],
            }),
            stop: AtomicBool::new(false),
            hook: Mutex::new(None),
        };

        Ok(Self {
            shared: Arc::new(shared),
            worker: Mutex::new(None),
        })
    }

    /// Install the callback told about every texture the GPU tier evicts.
    pub fn set_eviction_hook(&self, hook: EvictionHook) {
        *lock(&self.shared.hook) = Some(hook);
    }

    pub fn blocks(&self) -> &Arc<BlockSet> {
        &self.shared.blocks
    }

    /// Spawn the loader thread.
    pub fn start(&self) -> Result<(), StreamError> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Err(StreamError::AlreadyRunning);
        }
        self.shared.stop.store(false, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("block-loader".to_string())
            .spawn(move || {
                debug!("Loader thread running");
                while shared.background_step().is_some() {}
                debug!("Loader thread exiting");
            })
            .map_err(StreamError::ThreadSpawn)?;

        *worker = Some(handle);
        info!("Started block loader");
        Ok(())
    }

    /// Ask the loader thread to exit and wait for it. An in-flight read
    /// completes first.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        {
            let _queue = lock(&self.shared.queue);
            self.shared.work_ready.notify_all();
        }

        let worker = lock(&self.worker).take();
        if let Some(handle) = worker {
            if handle.join().is_err() {
                warn!("Loader thread panicked");
            }
            info!("Stopped block loader");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.worker).is_some()
    }

    /// Replace the work queue with `visible` then `not_visible` and wake the
    /// loader. Work from any earlier call is dropped. Returns the new epoch.
    pub fn enqueue_visible(&self, visible: &[BlockId], not_visible: &[BlockId]) -> u64 {
        let mut queue = lock(&self.shared.queue);
        let epoch = queue.replace(visible, not_visible);
        self.shared.work_ready.notify_all();
        epoch
    }

    /// Drop all queued work. Returns the number of entries removed.
    pub fn clear_queue(&self) -> usize {
        let cleared = lock(&self.shared.queue).clear();
        self.shared.idle.notify_all();
        cleared
    }

    /// Run one step, blocking until work is available. Returns `None` once
    /// stop has been requested.
    pub fn background_step(&self) -> Option<StepOutcome> {
        self.shared.background_step()
    }

    /// Run one step if work is available right now.
    pub fn try_background_step(&self) -> Option<StepOutcome> {
        self.shared.try_background_step()
    }

    /// Wait until the queue is drained or parked and no step is in flight.
    /// Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let queue = lock(&self.shared.queue);
        let (queue, _) = self
            .shared
            .idle
            .wait_timeout_while(queue, timeout, |q| !q.is_idle())
            .unwrap_or_else(PoisonError::into_inner);
        queue.is_idle()
    }

    /// Visible blocks whose texture holds their pixels, ordered by block id.
    pub fn visible_gpu_resident_blocks(&self) -> Vec<DrawItem<'_>> {
        let blocks = &self.shared.blocks;
        let cache = lock(&self.shared.cache);

        let mut items: Vec<DrawItem<'_>> = cache
            .gpu
            .occupants()
            .filter_map(|(id, texture)| {
                let block = blocks.get(id)?;
                (block.is_visible() && block.status() == BlockStatus::GpuResident)
                    .then_some(DrawItem { block, texture })
            })
            .collect();
        items.sort_by_key(|item| item.block.id());
        items
    }

    /// Residency of block `id`, or `None` for an unknown id.
    pub fn residency(&self, id: BlockId) -> Option<Residency> {
        let block = self.shared.blocks.get(id)?;
        let cache = lock(&self.shared.cache);
        Some(Residency {
            status: block.status(),
            visible: block.is_visible(),
            buffer: cache.main.handle(id),
            texture: cache.gpu.handle(id),
        })
    }

    pub fn stats(&self) -> LoaderStats {
        let (main, gpu, counters, disk) = {
            let cache = lock(&self.shared.cache);
            (cache.main.stats(), cache.gpu.stats(), cache.counters, cache.disk)
        };
        let (queue_depth, epoch, parked, queue) = {
            let q = lock(&self.shared.queue);
            (q.len(), q.epoch(), q.is_parked(), q.stats())
        };
        let ready_depth = lock(&self.shared.ready).len();

        LoaderStats {
            main,
            gpu,
            queue_depth,
            ready_depth,
            epoch,
            parked,
            running: self.is_running(),
            counters,
            queue,
            disk,
        }
    }

    /// Stop the thread and hand every texture back to `backend`.
    /// Returns the number of textures released.
    pub fn shutdown<B>(&self, backend: &mut B) -> usize
    where
        B: TextureBackend + ?Sized,
    {
        self.stop();
        self.clear_queue();
        lock(&self.shared.ready).clear();

        let handles = {
            let mut cache = lock(&self.shared.cache);
            for block in self.shared.blocks.iter() {
                if block.status().holds_texture() {
                    block.set_status(BlockStatus::CpuResident);
                }
            }
            cache.gpu.drain_handles()
        };

        for &handle in &handles {
            backend.release_texture_handle(handle);
        }
        info!(released = handles.len(), "Released texture handles");
        handles.len()
    }

    /// Let parked deferred work run again.
    pub(crate) fn wake(&self) {
        let mut queue = lock(&self.shared.queue);
        queue.progress();
        self.shared.work_ready.notify_all();
    }
}

impl Drop for BlockLoader {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn background_step(&self) -> Option<StepOutcome> {
        let (id, epoch) = {
            let mut queue = lock(&self.queue);
            loop {
                if self.stop.load(Ordering::Acquire) {
                    return None;
                }
                if let Some(entry) = queue.pop() {
                    break entry;
                }
                self.idle.notify_all();
                queue = self
                    .work_ready
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        Some(self.run(id, epoch))
    }

    fn try_background_step(&self) -> Option<StepOutcome> {
        let (id, epoch) = lock(&self.queue).pop()?;
        Some(self.run(id, epoch))
    }

    fn run(&self, id: BlockId, epoch: u64) -> StepOutcome {
        let outcome = self.process(id);

        let mut queue = lock(&self.queue);
        match outcome {
            StepOutcome::Loaded => {
                queue.requeue_front(id, epoch);
                queue.progress();
            }
            StepOutcome::Promoted => queue.progress(),
            StepOutcome::Deferred => {
                queue.defer(id, epoch);
            }
            StepOutcome::Skipped | StepOutcome::AlreadyResident | StepOutcome::ReadFailed => {}
        }
        queue.finish();
        if queue.is_idle() {
            self.idle.notify_all();
        }

        debug!(block_id = id, epoch, outcome = ?outcome, "Loader step");
        outcome
    }

    fn process(&self, id: BlockId) -> StepOutcome {
        let Some(block) = self.blocks.get(id) else {
            warn!(block_id = id, "Queued id is not a block");
            return StepOutcome::Skipped;
        };

        let mut evicted = Vec::new();
        let outcome = match self.advance_resident(block, &mut evicted) {
            Some(outcome) => outcome,
            None => self.load_from_disk(block, &mut evicted),
        };
        self.notify_evicted(&evicted);
        outcome
    }

    fn is_evictable(&self, id: BlockId) -> bool {
        self.blocks.get(id).map_or(true, |b| !b.is_visible())
    }

    /// Handle every case that needs no disk read. Returns `None` after
    /// marking the block `Loading` when a read is required.
    fn advance_resident(
        &self,
        block: &Block,
        evicted: &mut Vec<(BlockId, TextureHandle)>,
    ) -> Option<StepOutcome> {
        let id = block.id();
        let mut guard = lock(&self.cache);
        let cache = &mut *guard;

        if !block.is_visible() {
            cache.counters.skipped += 1;
            return Some(StepOutcome::Skipped);
        }

        if cache.gpu.contains(id) {
            cache.gpu.touch(id);
            cache.main.touch(id);
            cache.counters.already_resident += 1;
            return Some(StepOutcome::AlreadyResident);
        }

        if cache.main.contains(id) {
            cache.main.touch(id);
            return Some(match cache.gpu.admit(id, |other| self.is_evictable(other)) {
                Ok(admission) => {
                    if let Admission::Evicted { handle, victim } = admission {
                        self.blocks[victim].set_status(BlockStatus::CpuResident);
                        evicted.push((victim, handle));
                    }
                    block.set_status(BlockStatus::GpuReady);
                    lock(&self.ready).push_back(id);
                    cache.counters.promotions += 1;
                    debug!(block_id = id, texture = %admission.handle(), "Block ready for upload");
                    StepOutcome::Promoted
                }
                Err(e) => {
                    cache.counters.deferrals += 1;
                    debug!(block_id = id, error = %e, "Deferred GPU admission");
                    StepOutcome::Deferred
                }
            });
        }

        if !cache.main.can_admit(id, |other| self.is_evictable(other)) {
            cache.counters.deferrals += 1;
            debug!(block_id = id, "Deferred load, main memory full of visible blocks");
            return Some(StepOutcome::Deferred);
        }

        block.set_status(BlockStatus::Loading);
        None
    }

    fn load_from_disk(
        &self,
        block: &Block,
        evicted: &mut Vec<(BlockId, TextureHandle)>,
    ) -> StepOutcome {
        let id = block.id();
        let mut io = lock(&self.io);
        let LoaderIo { reader, scratch } = &mut *io;
        let read = reader.read_block(block.meta(), scratch);

        let mut guard = lock(&self.cache);
        let cache = &mut *guard;
        cache.disk = reader.stats();

        if let Err(e) = read {
            warn!(block_id = id, coord = ?block.coord(), error = %e, "Block read failed");
            block.set_status(BlockStatus::Unloaded);
            cache.counters.read_failures += 1;
            return StepOutcome::ReadFailed;
        }
        cache.counters.disk_reads += 1;

        // Classification may have changed during the read.
        let admission = match cache.main.admit(id, |other| self.is_evictable(other)) {
            Ok(admission) => admission,
            Err(e) => {
                block.set_status(BlockStatus::Unloaded);
                debug!(block_id = id, error = %e, "Main memory filled during read");
                if block.is_visible() {
                    cache.counters.deferrals += 1;
                    return StepOutcome::Deferred;
                }
                cache.counters.skipped += 1;
                return StepOutcome::Skipped;
            }
        };

        if let Admission::Evicted { victim, .. } = admission {
            if let Some(texture) = cache.gpu.remove(victim) {
                evicted.push((victim, texture));
            }
            self.blocks[victim].set_status(BlockStatus::Unloaded);
        }

        let buffer = admission.handle();
        let Some(mut slot) = self.buffers.lock(buffer) else {
            cache.main.remove(id);
            block.set_status(BlockStatus::Unloaded);
            warn!(block_id = id, buffer = %buffer, "Buffer missing from pixel store");
            return StepOutcome::ReadFailed;
        };
        slot.copy_from_slice(scratch);
        drop(slot);

        block.set_status(BlockStatus::CpuResident);
        cache.counters.loads += 1;
        debug!(block_id = id, buffer = %buffer, "Loaded block into main memory");
        StepOutcome::Loaded
    }

    fn notify_evicted(&self, evicted: &[(BlockId, TextureHandle)]) {
        if evicted.is_empty() {
            return;
        }
        let hook = lock(&self.hook);
        for &(block_id, texture) in evicted {
            debug!(block_id, texture = %texture, from = %Tier::Gpu, "Evicted texture");
            if let Some(hook) = hook.as_ref() {
                hook(block_id, texture);
            }
        }
    }
}
