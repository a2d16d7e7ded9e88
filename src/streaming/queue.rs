//! Loader work queue.
//!
//! A FIFO of block ids tagged with an epoch. Every classification change
//! replaces the whole queue and bumps the epoch, so work queued under an old
//! classification can never be re-inserted into the new one.
//!
//! Deferred blocks (tier full, every occupant visible) go to the back. Once a
//! full cycle over the queue has deferred everything without any progress the
//! queue reports itself parked and the worker sleeps until the next
//! replacement or an explicit wake.

use std::collections::VecDeque;

use serde::Serialize;
use tracing::debug;

use crate::cache::block::BlockId;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    pub total_enqueued: u64,
    pub total_deferred: u64,
    pub total_requeued: u64,
    /// Re-queues rejected because a newer epoch started meanwhile.
    pub stale_dropped: u64,
    pub replacements: u64,
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    entries: VecDeque<BlockId>,

    epoch: u64,

    /// Consecutive deferrals with no progress in between.
    stalled: usize,

    /// A popped entry is being processed.
    busy: bool,

    stats: QueueStats,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the queue with `visible` followed by `not_visible`.
    /// Returns the new epoch.
    pub fn replace(&mut self, visible: &[BlockId], not_visible: &[BlockId]) -> u64 {
        self.entries.clear();
        self.entries.extend(visible.iter().chain(not_visible.iter()).copied());
        self.epoch += 1;
        self.stalled = 0;
        self.stats.replacements += 1;
        self.stats.total_enqueued += self.entries.len() as u64;

        debug!(
            epoch = self.epoch,
            visible = visible.len(),
            not_visible = not_visible.len(),
            "Replaced work queue"
        );
        self.epoch
    }

    /// Drop all pending work. Returns the number of entries removed.
    pub fn clear(&mut self) -> usize {
        let cleared = self.entries.len();
        self.entries.clear();
        self.epoch += 1;
        self.stalled = 0;
        cleared
    }

    /// Next entry with the epoch it belongs to, unless empty or parked.
    pub fn pop(&mut self) -> Option<(BlockId, u64)> {
        if self.is_parked() {
            return None;
        }
        let id = self.entries.pop_front()?;
        self.busy = true;
        Some((id, self.epoch))
    }

    /// The popped entry has been handled.
    pub fn finish(&mut self) {
        self.busy = false;
    }

    /// Put a block back at the front for another pass.
    pub fn requeue_front(&mut self, id: BlockId, epoch: u64) -> bool {
        if epoch != self.epoch {
            self.stats.stale_dropped += 1;
            return false;
        }
        self.entries.push_front(id);
        self.stats.total_requeued += 1;
        true
    }

    /// Put a block at the back to retry after everything else.
    pub fn defer(&mut self, id: BlockId, epoch: u64) -> bool {
        if epoch != self.epoch {
            self.stats.stale_dropped += 1;
            return false;
        }
        self.entries.push_back(id);
        self.stalled += 1;
        self.stats.total_deferred += 1;
        true
    }

    /// Something changed that may let deferred blocks through.
    pub fn progress(&mut self) {
        self.stalled = 0;
    }

    /// Only deferred entries remain and none has succeeded since.
    pub fn is_parked(&self) -> bool {
        !self.entries.is_empty() && self.stalled >= self.entries.len()
    }

    /// Nothing runnable and nothing in flight.
    pub fn is_idle(&self) -> bool {
        !self.busy && (self.entries.is_empty() || self.is_parked())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }
}
