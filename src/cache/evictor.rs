//! Eviction policy: decides which occupant of a full tier gives up its slot.
//!
//! Plain LRU over a logical access clock:
//! - Only occupants whose block is currently not visible are candidates
//! - The least recently touched candidate goes first
//! - Ties are broken by lowest linear block index, so runs are reproducible

use std::cmp::Ordering;

use crate::cache::block::BlockId;

/// An eviction candidate and the recency it was last touched at.
#[derive(Debug, Clone, Copy)]
pub struct EvictionCandidate {
    pub block_id: BlockId,
    pub last_access: u64,
}

// Greater = evicted first: older access, then lower block id.
impl PartialEq for EvictionCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for EvictionCandidate {}

impl PartialOrd for EvictionCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EvictionCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .last_access
            .cmp(&self.last_access)
            .then_with(|| other.block_id.cmp(&self.block_id))
    }
}

/// The eviction policy engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct Evictor;

impl Evictor {
    pub fn new() -> Self {
        Self
    }

    /// The single best victim, if any occupant is evictable.
    pub fn select_victim<I, F>(&self, occupants: I, is_evictable: F) -> Option<EvictionCandidate>
    where
        I: IntoIterator<Item = (BlockId, u64)>,
        F: Fn(BlockId) -> bool,
    {
        occupants
            .into_iter()
            .filter(|&(id, _)| is_evictable(id))
            .map(|(block_id, last_access)| EvictionCandidate {
                block_id,
                last_access,
            })
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_least_recent_goes_first() {
        let evictor = Evictor::new();
        let occupants = vec![(0, 5), (1, 2), (2, 9)];
        let victim = evictor.select_victim(occupants, |_| true).unwrap();
        assert_eq!(victim.block_id, 1);
    }

    #[test]
    fn test_visible_occupants_excluded() {
        let evictor = Evictor::new();
        let occupants = vec![(0, 1), (1, 2), (2, 3)];
        let victim = evictor.select_victim(occupants.clone(), |id| id != 0).unwrap();
        assert_eq!(victim.block_id, 1);
        assert!(evictor.select_victim(occupants, |_| false).is_none());
    }

    #[test]
    fn test_ties_break_on_lowest_index() {
        let evictor = Evictor::new();
        let occupants = vec![(7, 4), (3, 4), (5, 4)];
        let victim = evictor.select_victim(occupants, |_| true).unwrap();
        assert_eq!(victim.block_id, 3);
    }

    #[test]
    fn test_empty_tier_has_no_victim() {
        let evictor = Evictor::new();
        assert!(evictor.select_victim(Vec::<(BlockId, u64)>::new(), |_| true).is_none());
    }
}
