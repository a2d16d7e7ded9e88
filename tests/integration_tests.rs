//! Integration tests for the streaming pipeline: disk → main memory → GPU.

mod common;

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use block_streamer::cache::block::{BlockId, BlockStatus};
use block_streamer::cache::classifier::ClassificationType;
use block_streamer::gpu::texture::pixel_checksum;
use block_streamer::gpu::{HeadlessBackend, TextureHandle};
use block_streamer::streaming::StepOutcome;
use block_streamer::transfer::disk_io::{BlockReader, BlockSource, DiskIoError, DiskIoStats};
use block_streamer::volume::{BlockMeta, DataType};

use common::{assert_invariants, drive, TestVolume};

const FRAME: Duration = Duration::from_millis(50);

#[test]
fn test_two_cpu_one_gpu_scenario() {
    let volume = TestVolume::with_range_of_values(4, &[0.9, 0.8, 0.05, 0.02]);
    let mut backend = HeadlessBackend::new();
    let collection = volume.collection(2, 1, &mut backend);

    let shown = collection.set_classification_range(0.5, 1.0).unwrap();
    assert_eq!(shown, 2);

    let outcomes = drive(collection.loader());
    assert_eq!(
        outcomes,
        vec![
            StepOutcome::Loaded,
            StepOutcome::Promoted,
            StepOutcome::Loaded,
            StepOutcome::Deferred,
            StepOutcome::Skipped,
            StepOutcome::Skipped,
        ]
    );
    assert!(collection.stats().loader.parked);
    assert_invariants(collection.loader());

    let report = collection.load_some_blocks(&mut backend, FRAME);
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.remaining, 0);

    let loader = collection.loader();
    assert_eq!(loader.residency(0).unwrap().status, BlockStatus::GpuResident);
    assert_eq!(loader.residency(1).unwrap().status, BlockStatus::CpuResident);
    assert_eq!(loader.residency(2).unwrap().status, BlockStatus::Unloaded);
    assert_eq!(loader.residency(3).unwrap().status, BlockStatus::Unloaded);

    let drawn: Vec<BlockId> = collection
        .visible_gpu_resident_blocks()
        .iter()
        .map(|item| item.block.id())
        .collect();
    assert_eq!(drawn, vec![0]);
    assert_invariants(loader);
}

#[test]
fn test_uploaded_pixels_match_disk() {
    let volume = TestVolume::with_range_of_values(2, &[0.7, 0.6]);
    let mut backend = HeadlessBackend::new();
    let collection = volume.collection(2, 2, &mut backend);

    collection.set_classification_range(0.5, 1.0).unwrap();
    drive(collection.loader());
    let report = collection.load_some_blocks(&mut backend, FRAME);
    assert_eq!(report.uploaded, 2);

    for item in collection.visible_gpu_resident_blocks() {
        let record = backend.record(item.texture).unwrap();
        assert_eq!(record.uploads, 1);
        assert_eq!(record.checksum, pixel_checksum(&volume.pixels_of(item.block.id())));
    }
}

#[test]
fn test_reclassify_without_eviction_is_a_cache_hit() {
    let volume = TestVolume::with_range_of_values(4, &[0.9, 0.8, 0.1, 0.1]);
    let mut backend = HeadlessBackend::new();
    let collection = volume.collection(4, 4, &mut backend);
    let loader = collection.loader();

    collection.set_classification_range(0.5, 1.0).unwrap();
    drive(loader);
    collection.load_some_blocks(&mut backend, FRAME);
    assert_eq!(loader.stats().counters.disk_reads, 2);

    // Hide B0 and B1, then show them again before anything displaces them.
    collection.set_classification_range(0.0, 0.2).unwrap();
    collection.set_classification_range(0.5, 1.0).unwrap();

    let outcomes = drive(loader);
    assert_eq!(
        &outcomes[..2],
        &[StepOutcome::AlreadyResident, StepOutcome::AlreadyResident]
    );
    assert_eq!(loader.stats().counters.disk_reads, 2);
    assert_eq!(loader.residency(0).unwrap().status, BlockStatus::GpuResident);
    assert_eq!(loader.residency(1).unwrap().status, BlockStatus::GpuResident);
}

#[test]
fn test_reclassify_after_eviction_rereads() {
    let volume = TestVolume::with_range_of_values(4, &[0.9, 0.1, 0.1, 0.1]);
    let mut backend = HeadlessBackend::new();
    let collection = volume.collection(2, 1, &mut backend);
    let loader = collection.loader();

    let evicted: Arc<Mutex<Vec<(BlockId, TextureHandle)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&evicted);
    loader.set_eviction_hook(Box::new(move |block, texture| {
        sink.lock().unwrap().push((block, texture));
    }));

    collection.set_classification_range(0.5, 1.0).unwrap();
    drive(loader);
    collection.load_some_blocks(&mut backend, FRAME);
    let b0_texture = loader.residency(0).unwrap().texture.unwrap();
    assert_eq!(loader.stats().counters.disk_reads, 1);

    // B1..B3 take over; B0 loses its texture, then its buffer.
    collection.set_classification_range(0.0, 0.2).unwrap();
    let outcomes = drive(loader);
    assert_eq!(
        outcomes,
        vec![
            StepOutcome::Loaded,
            StepOutcome::Promoted,
            StepOutcome::Loaded,
            StepOutcome::Deferred,
            StepOutcome::Deferred,
            StepOutcome::Skipped,
        ]
    );
    assert_eq!(loader.residency(0).unwrap().status, BlockStatus::Unloaded);
    assert_eq!(evicted.lock().unwrap().as_slice(), &[(0, b0_texture)]);
    assert_eq!(loader.stats().counters.disk_reads, 3);
    assert_invariants(loader);

    // Back to B0: it must come from disk again.
    collection.set_classification_range(0.5, 1.0).unwrap();
    let outcomes = drive(loader);
    assert_eq!(&outcomes[..2], &[StepOutcome::Loaded, StepOutcome::Promoted]);
    assert_eq!(loader.stats().counters.disk_reads, 4);

    // B0's read displaced B1, the least recently used buffer, before B1 was uploaded.
    let report = collection.load_some_blocks(&mut backend, FRAME);
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.stale, 1);
    assert_eq!(loader.residency(0).unwrap().status, BlockStatus::GpuResident);
    assert_eq!(loader.residency(1).unwrap().status, BlockStatus::Unloaded);
    assert_eq!(loader.residency(2).unwrap().status, BlockStatus::CpuResident);
    assert_eq!(evicted.lock().unwrap().len(), 2);
    assert_invariants(loader);
}

#[test]
fn test_second_enqueue_supersedes_first() {
    let volume = TestVolume::with_range_of_values(4, &[0.9, 0.8, 0.1, 0.1]);
    let mut backend = HeadlessBackend::new();
    let collection = volume.collection(4, 4, &mut backend);
    let loader = collection.loader();

    collection.set_classification_range(0.5, 1.0).unwrap();
    collection.set_classification_range(0.0, 0.2).unwrap();
    drive(loader);

    assert_eq!(loader.residency(0).unwrap().status, BlockStatus::Unloaded);
    assert_eq!(loader.residency(1).unwrap().status, BlockStatus::Unloaded);
    assert_eq!(loader.residency(2).unwrap().status, BlockStatus::GpuReady);
    assert_eq!(loader.residency(3).unwrap().status, BlockStatus::GpuReady);
    assert_eq!(loader.stats().counters.disk_reads, 2);
}

#[test]
fn test_partially_processed_queue_is_replaced() {
    let volume = TestVolume::with_range_of_values(4, &[0.9, 0.8, 0.1, 0.1]);
    let mut backend = HeadlessBackend::new();
    let collection = volume.collection(4, 4, &mut backend);
    let loader = collection.loader();

    collection.set_classification_range(0.5, 1.0).unwrap();
    assert_eq!(loader.try_background_step(), Some(StepOutcome::Loaded));

    collection.set_classification_range(0.0, 0.2).unwrap();
    let outcomes = drive(loader);
    assert_eq!(
        outcomes,
        vec![
            StepOutcome::Loaded,
            StepOutcome::Promoted,
            StepOutcome::Loaded,
            StepOutcome::Promoted,
            StepOutcome::Skipped,
            StepOutcome::Skipped,
        ]
    );
    assert_eq!(loader.residency(0).unwrap().status, BlockStatus::CpuResident);
    assert_eq!(loader.residency(1).unwrap().status, BlockStatus::Unloaded);
    assert_eq!(loader.stats().counters.promotions, 2);
}

#[test]
fn test_read_failure_leaves_block_unloaded() {
    let volume = TestVolume::with_range_of_values(2, &[0.1, 0.9]);
    let mut backend = HeadlessBackend::new();

    // Reader over a file that stops inside block 1.
    let truncated = tempfile::NamedTempFile::new().unwrap();
    let bytes = std::fs::read(volume.file.path()).unwrap();
    std::fs::write(truncated.path(), &bytes[..6]).unwrap();
    let reader = BlockReader::open(
        truncated.path(),
        DataType::UChar,
        volume.index.geometry,
        volume.index.value_min,
        volume.index.value_max,
    )
    .unwrap();

    let loader = volume.loader_with(reader, 2, 2, &mut backend);
    let set = loader.blocks().clone();
    let c = block_streamer::cache::classifier::classify(&set, ClassificationType::RangeOfValues, 0.5, 1.0);
    c.publish(&set);
    loader.enqueue_visible(&c.visible, &c.not_visible);

    let outcomes = drive(&loader);
    assert!(outcomes.contains(&StepOutcome::ReadFailed));
    assert_eq!(loader.residency(1).unwrap().status, BlockStatus::Unloaded);
    let stats = loader.stats();
    assert_eq!(stats.counters.read_failures, 1);
    assert_eq!(stats.queue_depth, 0);
    assert_eq!(stats.disk.failures, 1);
    assert_invariants(&loader);
}

#[test]
fn test_upload_failure_falls_back_to_cpu_resident() {
    let volume = TestVolume::with_range_of_values(1, &[0.9]);
    let mut backend = HeadlessBackend::new();
    let collection = volume.collection(1, 1, &mut backend);
    let loader = collection.loader();

    collection.set_classification_range(0.5, 1.0).unwrap();
    drive(loader);

    backend.fail_next_uploads(1);
    let report = collection.load_some_blocks(&mut backend, FRAME);
    assert_eq!(report.failed, 1);
    let r = loader.residency(0).unwrap();
    assert_eq!(r.status, BlockStatus::CpuResident);
    assert!(r.texture.is_none());
    assert_eq!(loader.stats().gpu.free, 1);
    assert_invariants(loader);

    // The next classification pass promotes it again without a disk read.
    collection.set_classification_range(0.5, 1.0).unwrap();
    assert_eq!(drive(loader), vec![StepOutcome::Promoted]);
    collection.load_some_blocks(&mut backend, FRAME);
    assert_eq!(loader.residency(0).unwrap().status, BlockStatus::GpuResident);
    assert_eq!(loader.stats().counters.disk_reads, 1);
}

#[test]
fn test_zero_budget_still_uploads_one_block() {
    let volume = TestVolume::with_range_of_values(3, &[0.9, 0.9, 0.9]);
    let mut backend = HeadlessBackend::new();
    let collection = volume.collection(3, 3, &mut backend);

    collection.set_classification_range(0.5, 1.0).unwrap();
    drive(collection.loader());

    let report = collection.load_some_blocks(&mut backend, Duration::ZERO);
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.remaining, 2);
    assert_eq!(collection.visible_gpu_resident_blocks().len(), 1);
}

#[test]
fn test_classification_type_switch() {
    let mut volume = TestVolume::with_range_of_values(2, &[0.9, 0.1]);
    volume.index.blocks[0].average = 0.1;
    volume.index.blocks[1].average = 0.9;
    let mut backend = HeadlessBackend::new();
    let collection = volume.collection(2, 2, &mut backend);

    collection.set_classification_range(0.5, 1.0).unwrap();
    assert!(collection.blocks()[0].is_visible());

    let shown = collection.set_classification_type(ClassificationType::Average);
    assert_eq!(shown, 1);
    assert!(!collection.blocks()[0].is_visible());
    assert!(collection.blocks()[1].is_visible());
    assert_eq!(collection.classification().kind, ClassificationType::Average);
}

#[test]
fn test_invalid_range_keeps_previous_classification() {
    let volume = TestVolume::with_range_of_values(2, &[0.9, 0.1]);
    let mut backend = HeadlessBackend::new();
    let collection = volume.collection(2, 2, &mut backend);

    collection.set_classification_range(0.5, 1.0).unwrap();
    let epoch = collection.stats().loader.epoch;

    assert!(collection.set_classification_range(0.8, 0.2).is_err());
    let state = collection.classification();
    assert_eq!((state.low, state.high, state.shown), (0.5, 1.0, 1));
    assert_eq!(collection.stats().loader.epoch, epoch);
}

#[test]
fn test_background_thread_streams_visible_set() {
    let volume = TestVolume::with_range_of_values(8, &[0.9, 0.1, 0.8, 0.1, 0.7, 0.1, 0.6, 0.1]);
    let mut backend = HeadlessBackend::new();
    let collection = volume.collection(4, 2, &mut backend);
    collection.start().unwrap();
    assert!(collection.start().is_err());

    collection.set_classification_range(0.5, 1.0).unwrap();
    assert!(collection.loader().wait_idle(Duration::from_secs(5)));

    let report = collection.load_some_blocks(&mut backend, FRAME);
    assert_eq!(report.uploaded, 2);
    // Blocks are streamed highest statistic first.
    let drawn: Vec<BlockId> = collection
        .visible_gpu_resident_blocks()
        .iter()
        .map(|item| item.block.id())
        .collect();
    assert_eq!(drawn, vec![0, 2]);

    let stats = collection.stats();
    assert_eq!(stats.status.cpu_resident, 2);
    assert_eq!(stats.status.gpu_resident, 2);
    assert!(stats.loader.running);

    assert_eq!(collection.shutdown(&mut backend), 2);
    assert!(!collection.loader().is_running());
    assert_eq!(backend.live_textures(), 0);
}

#[test]
fn test_render_pump_and_loader_under_reclassification() {
    let rov: Vec<f64> = (0..16).map(|i| (i * 37 % 100) as f64 / 100.0).collect();
    let volume = TestVolume::with_range_of_values(16, &rov);
    let mut backend = HeadlessBackend::new();
    let collection = Arc::new(volume.collection(8, 4, &mut backend));
    collection.start().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let render = {
        let collection = Arc::clone(&collection);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut frames = 0u64;
            let mut failed = 0;
            while !stop.load(Ordering::Acquire) {
                if frames % 5 == 0 {
                    backend.fail_next_uploads(1);
                }
                failed += collection.load_some_blocks(&mut backend, Duration::from_millis(1)).failed;
                frames += 1;
                thread::yield_now();
            }
            (backend, failed)
        })
    };

    for i in 0..300 {
        let low = (i % 10) as f64 / 10.0;
        collection.set_classification_range(low, low + 0.35).unwrap();
        assert_invariants(collection.loader());
        if i % 50 == 0 {
            thread::sleep(Duration::from_millis(2));
        }
    }

    stop.store(true, Ordering::Release);
    let (mut backend, failed) = render.join().unwrap();
    let loader = collection.loader();
    assert!(loader.wait_idle(Duration::from_secs(5)));
    collection.load_some_blocks(&mut backend, Duration::from_secs(1));
    assert_invariants(loader);
    assert!(loader.stats().counters.upload_failures as usize >= failed);

    assert_eq!(collection.shutdown(&mut backend), 4);
    assert!(!loader.is_running());
    assert_eq!(backend.live_textures(), 0);
}

/// A source whose first read blocks until the test lets it continue.
struct GatedSource {
    inner: BlockReader,
    gated: bool,
    started: Sender<BlockId>,
    proceed: Receiver<()>,
    block_index: [u64; 3],
}

impl BlockSource for GatedSource {
    fn read_block(&mut self, meta: &BlockMeta, out: &mut [f32]) -> Result<(), DiskIoError> {
        if self.gated {
            self.gated = false;
            let id = (meta.coord[0] + meta.coord[1] * self.block_index[0]) as BlockId;
            self.started.send(id).unwrap();
            self.proceed.recv().unwrap();
        }
        self.inner.read_block(meta, out)
    }

    fn data_type(&self) -> DataType {
        BlockSource::data_type(&self.inner)
    }

    fn stats(&self) -> DiskIoStats {
        BlockSource::stats(&self.inner)
    }
}

#[test]
fn test_loading_block_hidden_mid_read_completes_then_evicts() {
    let volume = TestVolume::with_range_of_values(2, &[0.9, 0.1]);
    let mut backend = HeadlessBackend::new();

    let (started_tx, started_rx) = mpsc::channel();
    let (proceed_tx, proceed_rx) = mpsc::channel();
    let source = GatedSource {
        inner: volume.reader(),
        gated: true,
        started: started_tx,
        proceed: proceed_rx,
        block_index: volume.index.geometry.block_count,
    };

    let loader = volume.loader_with(source, 1, 1, &mut backend);
    let collection = block_streamer::streaming::BlockCollection::new(loader);
    collection.start().unwrap();

    collection.set_classification_range(0.5, 1.0).unwrap();
    let reading = started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(reading, 0);
    assert_eq!(collection.residency(0).unwrap().status, BlockStatus::Loading);

    // B0 turns invisible while its read is in flight.
    collection.set_classification_range(0.0, 0.2).unwrap();
    proceed_tx.send(()).unwrap();
    assert!(collection.loader().wait_idle(Duration::from_secs(5)));

    let loader = collection.loader();
    let stats = loader.stats();
    assert_eq!(stats.counters.read_failures, 0);
    assert_eq!(stats.counters.disk_reads, 2);
    assert_eq!(stats.queue.stale_dropped, 1);
    assert_eq!(stats.main.evictions, 1);
    assert_eq!(loader.residency(0).unwrap().status, BlockStatus::Unloaded);
    assert_eq!(loader.residency(1).unwrap().status, BlockStatus::GpuReady);
    assert_invariants(loader);

    collection.shutdown(&mut backend);
}
