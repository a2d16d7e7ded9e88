//! Fixed-capacity resource pools.
//!
//! Every handle a tier can lend out is created once at startup and recycled
//! through a free list for the lifetime of the loader. Nothing is allocated
//! or freed per block.

use std::collections::{HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("Handle {0} released twice")]
    DoubleRelease(String),

    #[error("Handle {0} does not belong to this pool")]
    UnknownHandle(String),
}

/// Handle to one main-memory pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BufferId(pub usize);

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// Free list of interchangeable handles with a fixed total count.
#[derive(Debug)]
pub struct ResourcePool<H> {
    /// Every handle the pool was created with.
    known: HashSet<H>,

    /// Handles available to lend, in release order.
    free_list: VecDeque<H>,

    /// Mirror of `free_list` for O(1) double-release checks.
    free_set: HashSet<H>,
}

impl<H> ResourcePool<H>
where
    H: Copy + Eq + Hash + Debug,
{
    pub fn new(handles: impl IntoIterator<Item = H>) -> Self {
        let free_list: VecDeque<H> = handles.into_iter().collect();
        let free_set: HashSet<H> = free_list.iter().copied().collect();

        Self {
            known: free_set.clone(),
            free_list,
            free_set,
        }
    }

    /// Take a handle from the free list, if any remain.
    pub fn acquire(&mut self) -> Option<H> {
        let handle = self.free_list.pop_front()?;
        self.free_set.remove(&handle);
        Some(handle)
    }

    /// Return a handle to the free list.
    pub fn release(&mut self, handle: H) -> Result<(), PoolError> {
        if !self.known.contains(&handle) {
            return Err(PoolError::UnknownHandle(format!("{handle:?}")));
        }
        if !self.free_set.insert(handle) {
            return Err(PoolError::DoubleRelease(format!("{handle:?}")));
        }
        self.free_list.push_back(handle);
        Ok(())
    }

    /// Handles currently available.
    pub fn free(&self) -> usize {
        self.free_list.len()
    }

    /// Handles the pool was created with.
    pub fn total(&self) -> usize {
        self.known.len()
    }

    /// Handles currently lent out.
    pub fn in_use(&self) -> usize {
        self.total() - self.free()
    }

    /// Remove every handle from the pool, returning them for teardown.
    pub fn drain_all(&mut self) -> Vec<H> {
        self.free_list.clear();
        self.free_set.clear();
        self.known.drain().collect()
    }
}

/// The main-memory pixel buffers, one per `BufferId`, each sized for one block.
///
/// Each slot has its own lock so the render thread can upload from one buffer
/// while the loader fills another.
pub struct PixelBuffers {
    slots: Vec<Mutex<Box<[f32]>>>,
    voxels: usize,
}

impl PixelBuffers {
    pub fn new(count: usize, voxels: usize) -> Self {
        let slots = (0..count)
            .map(|_| Mutex::new(vec![0.0f32; voxels].into_boxed_slice()))
            .collect();

        debug!(count, voxels, "Allocated pixel buffers");
        Self { slots, voxels }
    }

    /// All buffer ids, for seeding a `ResourcePool`.
    pub fn ids(&self) -> impl Iterator<Item = BufferId> {
        (0..self.slots.len()).map(BufferId)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Voxels held by each buffer.
    pub fn voxels(&self) -> usize {
        self.voxels
    }

    /// Lock one buffer. A poisoned slot is recovered, its contents are
    /// rewritten on the next load anyway.
    pub fn lock(&self, id: BufferId) -> Option<MutexGuard<'_, Box<[f32]>>> {
        let slot = self.slots.get(id.0)?;
        Some(slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

impl std::fmt::Debug for PixelBuffers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelBuffers")
            .field("count", &self.slots.len())
            .field("voxels", &self.voxels)
            .finish()
    }
}
