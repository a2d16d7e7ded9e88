//! Cache tier: bounded admission and LRU eviction over one resource pool.
//!
//! The same structure backs both the main-memory tier (lending pixel buffers)
//! and the GPU tier (lending texture handles). A tier never decides what is
//! visible; callers pass the current visibility as an `is_evictable` predicate.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::block::{BlockId, Tier};
use crate::cache::evictor::Evictor;
use crate::cache::pool::{PoolError, ResourcePool};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TierError {
    #[error("{tier} tier exhausted: all {capacity} occupants are visible")]
    PoolExhausted { tier: Tier, capacity: usize },

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Result of a successful admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission<H> {
    /// The block already occupied the tier.
    Hit(H),
    /// A free handle was taken from the pool.
    Fresh(H),
    /// `victim` was evicted and its handle now belongs to the admitted block.
    Evicted { handle: H, victim: BlockId },
}

impl<H: Copy> Admission<H> {
    pub fn handle(&self) -> H {
        match *self {
            Admission::Hit(h) | Admission::Fresh(h) => h,
            Admission::Evicted { handle, .. } => handle,
        }
    }
}

/// Per-tier usage statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TierStats {
    pub capacity: usize,
    pub occupants: usize,
    pub free: usize,
    pub hits: u64,
    pub admissions: u64,
    pub evictions: u64,
    pub failures: u64,
}

impl TierStats {
    /// Occupancy as a fraction of capacity (0.0 - 1.0).
    pub fn usage_fraction(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.occupants as f64 / self.capacity as f64
    }
}

#[derive(Debug, Clone, Copy)]
struct Occupant<H> {
    handle: H,
    last_access: u64,
}

/// One residency tier.
#[derive(Debug)]
pub struct CacheTier<H> {
    tier: Tier,
    pool: ResourcePool<H>,
    occupants: HashMap<BlockId, Occupant<H>>,

    /// Logical clock, bumped on every admission or touch.
    clock: u64,

    evictor: Evictor,
    stats: TierStats,
}

impl<H> CacheTier<H>
where
    H: Copy + Eq + Hash + Debug,
{
    /// Build a tier whose capacity is the pool's size.
    pub fn new(tier: Tier, pool: ResourcePool<H>) -> Self {
        let capacity = pool.total();
        Self {
            tier,
            pool,
            occupants: HashMap::with_capacity(capacity),
            clock: 0,
            evictor: Evictor::new(),
            stats: TierStats {
                capacity,
                ..Default::default()
            },
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn capacity(&self) -> usize {
        self.stats.capacity
    }

    pub fn len(&self) -> usize {
        self.occupants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.occupants.is_empty()
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.occupants.contains_key(&id)
    }

    /// Handle lent to `id`, if it occupies the tier.
    pub fn handle(&self, id: BlockId) -> Option<H> {
        self.occupants.get(&id).map(|o| o.handle)
    }

    /// Current occupants with their handles, in no particular order.
    pub fn occupants(&self) -> impl Iterator<Item = (BlockId, H)> + '_ {
        self.occupants.iter().map(|(&id, o)| (id, o.handle))
    }

    /// Mark `id` as just used. Returns false if it is not an occupant.
    pub fn touch(&mut self, id: BlockId) -> bool {
        self.clock += 1;
        match self.occupants.get_mut(&id) {
            Some(occupant) => {
                occupant.last_access = self.clock;
                true
            }
            None => false,
        }
    }

    /// Whether `admit(id, is_evictable)` would succeed right now.
    pub fn can_admit<F>(&self, id: BlockId, is_evictable: F) -> bool
    where
        F: Fn(BlockId) -> bool,
    {
        self.contains(id)
            || self.occupants.len() < self.capacity()
            || self.occupants.keys().any(|&occupant| is_evictable(occupant))
    }

    /// Admit `id`, evicting the least recently used evictable occupant when
    /// the tier is full. Admitting an occupant again returns its existing
    /// handle.
    pub fn admit<F>(&mut self, id: BlockId, is_evictable: F) -> Result<Admission<H>, TierError>
    where
        F: Fn(BlockId) -> bool,
    {
        if let Some(handle) = self.handle(id) {
            self.touch(id);
            self.stats.hits += 1;
            return Ok(Admission::Hit(handle));
        }

        if self.occupants.len() < self.capacity() {
            if let Some(handle) = self.pool.acquire() {
                self.insert(id, handle);
                debug!(block_id = id, tier = %self.tier, handle = ?handle, "Admitted block");
                return Ok(Admission::Fresh(handle));
            }
        }

        let candidates = self.occupants.iter().map(|(&bid, o)| (bid, o.last_access));
        let Some(victim) = self.evictor.select_victim(candidates, &is_evictable) else {
            self.stats.failures += 1;
            return Err(TierError::PoolExhausted {
                tier: self.tier,
                capacity: self.capacity(),
            });
        };

        // The victim's handle moves straight to the new occupant.
        let Some(evicted) = self.occupants.remove(&victim.block_id) else {
            self.stats.failures += 1;
            return Err(TierError::PoolExhausted {
                tier: self.tier,
                capacity: self.capacity(),
            });
        };
        self.stats.evictions += 1;
        self.insert(id, evicted.handle);

        debug!(
            block_id = id,
            victim = victim.block_id,
            tier = %self.tier,
            "Evicted block to admit"
        );

        Ok(Admission::Evicted {
            handle: evicted.handle,
            victim: victim.block_id,
        })
    }

    /// Drop `id` from the tier and return its handle to the pool.
    pub fn remove(&mut self, id: BlockId) -> Option<H> {
        let occupant = self.occupants.remove(&id)?;
        if let Err(e) = self.pool.release(occupant.handle) {
            warn!(block_id = id, tier = %self.tier, error = %e, "Pool rejected released handle");
        }
        debug!(block_id = id, tier = %self.tier, "Removed block");
        Some(occupant.handle)
    }

    /// Empty the tier and the pool, returning every handle for teardown.
    pub fn drain_handles(&mut self) -> Vec<H> {
        self.occupants.clear();
        self.pool.drain_all()
    }

    /// Handles free in the pool.
    pub fn free(&self) -> usize {
        self.pool.free()
    }

    pub fn stats(&self) -> TierStats {
        TierStats {
            occupants: self.occupants.len(),
            free: self.pool.free(),
            ..self.stats.clone()
        }
    }

    fn insert(&mut self, id: BlockId, handle: H) {
        self.clock += 1;
        self.occupants.insert(
            id,
            Occupant {
                handle,
                last_access: self.clock,
            },
        );
        self.stats.admissions += 1;
    }
}
