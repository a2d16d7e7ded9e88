//! Graphics boundary.
//!
//! - [`texture`]: TextureHandle, the TextureBackend trait, HeadlessBackend, EvictionHook

pub mod texture;

pub use texture::{EvictionHook, GpuError, HeadlessBackend, TextureBackend, TextureHandle};
