//! block-streamer: out-of-core streaming of volumetric blocks.
//!
//! Moves blocks of a large raw volume through a residency pipeline:
//!   Disk → main-memory buffer pool → GPU texture pool
//!
//! Which blocks are worth keeping resident is decided by classification: a
//! block is visible when its per-block statistic falls inside a user range.
//! A background loader thread reads and promotes visible blocks while the
//! render thread uploads a budgeted number of them each frame.

pub mod cache;
pub mod config;
pub mod gpu;
pub mod server;
pub mod streaming;
pub mod transfer;
pub mod volume;
