//! Integration tests for the eviction policy.

mod common;

use std::time::Duration;

use block_streamer::cache::block::{BlockId, BlockStatus, Tier};
use block_streamer::cache::evictor::Evictor;
use block_streamer::cache::pool::{BufferId, ResourcePool};
use block_streamer::cache::tier::{Admission, CacheTier};
use block_streamer::gpu::HeadlessBackend;
use block_streamer::streaming::StepOutcome;

use common::{assert_invariants, drive, TestVolume};

fn victim_of(admission: Admission<BufferId>) -> Option<BlockId> {
    match admission {
        Admission::Evicted { victim, .. } => Some(victim),
        _ => None,
    }
}

#[test]
fn test_eviction_order_is_least_recently_used() {
    let mut tier = CacheTier::new(Tier::Main, ResourcePool::new((0..3).map(BufferId)));
    for id in [10, 11, 12] {
        tier.admit(id, |_| true).unwrap();
    }

    // Touching 10 makes 11 the oldest.
    assert!(tier.touch(10));
    assert_eq!(victim_of(tier.admit(13, |_| true).unwrap()), Some(11));
    assert_eq!(victim_of(tier.admit(14, |_| true).unwrap()), Some(12));
    assert_eq!(victim_of(tier.admit(15, |_| true).unwrap()), Some(10));
}

#[test]
fn test_touch_of_absent_block_is_ignored() {
    let mut tier: CacheTier<BufferId> =
        CacheTier::new(Tier::Gpu, ResourcePool::new((0..1).map(BufferId)));
    assert!(!tier.touch(3));
    assert!(tier.is_empty());
}

#[test]
fn test_eviction_respects_visibility() {
    let evictor = Evictor::new();
    let occupants = vec![(0, 1), (1, 2), (2, 3), (3, 4)];

    // Even ids are visible; block 0 is oldest but cannot go.
    let victim = evictor.select_victim(occupants.clone(), |id| id % 2 == 1).unwrap();
    assert_eq!(victim.block_id, 1);

    assert!(evictor.select_victim(occupants, |_| false).is_none());
}

#[test]
fn test_gpu_eviction_keeps_cpu_buffer() {
    let volume = TestVolume::with_range_of_values(2, &[0.9, 0.1]);
    let mut backend = HeadlessBackend::new();
    let collection = volume.collection(2, 1, &mut backend);
    let loader = collection.loader();

    collection.set_classification_range(0.5, 1.0).unwrap();
    drive(loader);
    collection.load_some_blocks(&mut backend, Duration::from_millis(50));

    // B1 takes B0's texture; B0 keeps its host buffer.
    collection.set_classification_range(0.0, 0.2).unwrap();
    let outcomes = drive(loader);
    assert_eq!(
        outcomes,
        vec![StepOutcome::Loaded, StepOutcome::Promoted, StepOutcome::Skipped]
    );

    assert_eq!(loader.residency(0).unwrap().status, BlockStatus::CpuResident);
    assert_eq!(loader.residency(1).unwrap().status, BlockStatus::GpuReady);
    let stats = loader.stats();
    assert_eq!(stats.gpu.evictions, 1);
    assert_eq!(stats.main.evictions, 0);
    assert_invariants(loader);
}

#[test]
fn test_visible_blocks_are_never_evicted() {
    let volume = TestVolume::with_range_of_values(3, &[0.9, 0.8, 0.7]);
    let mut backend = HeadlessBackend::new();
    let collection = volume.collection(2, 2, &mut backend);
    let loader = collection.loader();

    collection.set_classification_range(0.5, 1.0).unwrap();
    let outcomes = drive(loader);
    assert_eq!(
        outcomes,
        vec![
            StepOutcome::Loaded,
            StepOutcome::Promoted,
            StepOutcome::Loaded,
            StepOutcome::Promoted,
            StepOutcome::Deferred,
        ]
    );

    // The third block waits rather than displacing a visible one.
    assert_eq!(loader.residency(2).unwrap().status, BlockStatus::Unloaded);
    let stats = loader.stats();
    assert_eq!(stats.main.evictions, 0);
    assert_eq!(stats.gpu.evictions, 0);
    assert!(stats.parked);
    assert_invariants(loader);
}
