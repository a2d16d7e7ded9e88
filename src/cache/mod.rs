//! Block residency bookkeeping.
//!
//! This module contains the core cache data structures and algorithms:
//! - [`block`]: Block, BlockSet, BlockStatus, Tier definitions
//! - [`pool`]: Fixed free lists of buffer and texture handles, pixel buffers
//! - [`tier`]: Bounded admission with eviction of non-visible occupants
//! - [`evictor`]: LRU victim selection
//! - [`classifier`]: Visible / not-visible partition by a scalar range

pub mod block;
pub mod classifier;
pub mod evictor;
pub mod pool;
pub mod tier;
