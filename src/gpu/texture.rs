//! Texture handles and the boundary to the graphics layer.
//!
//! The streaming engine never talks to a graphics API directly. It asks a
//! [`TextureBackend`] for handles at startup, hands it pixels to upload from
//! the render thread, and reports evicted textures through an [`EvictionHook`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::cache::block::BlockId;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GpuError {
    #[error("Texture allocation failed: {0}")]
    AllocationFailed(String),

    #[error("Unknown texture handle {0}")]
    UnknownHandle(TextureHandle),

    #[error("Upload to {handle} failed: {reason}")]
    UploadFailed { handle: TextureHandle, reason: String },

    #[error("Pixel count {actual} does not match extent ({expected} voxels)")]
    ExtentMismatch { expected: usize, actual: usize },
}

/// Opaque handle to one 3D texture object owned by the graphics layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TextureHandle(pub u32);

impl std::fmt::Display for TextureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tex#{}", self.0)
    }
}

/// Called from the loader thread, outside any lock, whenever the GPU tier
/// takes a texture away from a block.
///
/// The hook is a notification only. The texture stays in the GPU pool and is
/// handed to another block, so the hook must not release or destroy it.
pub type EvictionHook = Box<dyn Fn(BlockId, TextureHandle) + Send + Sync>;

/// Graphics operations the engine needs. Only ever called from the render
/// thread, which owns the backend.
pub trait TextureBackend {
    /// Create a texture able to hold one block of `extent` voxels.
    fn allocate_texture_handle(&mut self, extent: [u64; 3]) -> Result<TextureHandle, GpuError>;

    /// Destroy a texture at shutdown.
    fn release_texture_handle(&mut self, handle: TextureHandle);

    /// Copy one block's float pixels into `handle`.
    fn upload_pixels(
        &mut self,
        handle: TextureHandle,
        pixels: &[f32],
        extent: [u64; 3],
    ) -> Result<(), GpuError>;
}

/// What the headless backend remembers about one texture.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadRecord {
    pub uploads: u64,
    pub bytes: u64,
    /// Checksum of the most recent upload, see [`pixel_checksum`].
    pub checksum: u64,
}

/// FNV-1a over the raw bytes of a pixel buffer.
pub fn pixel_checksum(pixels: &[f32]) -> u64 {
    let bytes: &[u8] = bytemuck::cast_slice(pixels);
    bytes.iter().fold(0xcbf2_9ce4_8422_2325u64, |hash, &b| {
        (hash ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

/// Backend with no graphics API behind it. Used by the CLI render loop and by
/// tests; keeps a record of every upload.
#[derive(Debug, Default)]
pub struct HeadlessBackend {
    next_handle: u32,

    /// Stop handing out textures after this many, if set.
    texture_limit: Option<usize>,

    textures: HashMap<TextureHandle, UploadRecord>,

    /// Number of upcoming uploads that should fail.
    failing_uploads: usize,

    total_uploads: u64,
    total_bytes: u64,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend that refuses to allocate more than `limit` textures.
    pub fn with_texture_limit(limit: usize) -> Self {
        let mut backend = Self::default();
        backend.texture_limit = Some(limit);
        backend
    }

    /// Make the next `count` uploads fail.
    pub fn fail_next_uploads(&mut self, count: usize) {
        self.failing_uploads = count;
    }

    pub fn record(&self, handle: TextureHandle) -> Option<&UploadRecord> {
        self.textures.get(&handle)
    }

    /// Textures allocated and not yet released.
    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn total_uploads(&self) -> u64 {
        self.total_uploads
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

impl TextureBackend for HeadlessBackend {
    fn allocate_texture_handle(&mut self, extent: [u64; 3]) -> Result<TextureHandle, GpuError> {
        if let Some(limit) = self.texture_limit {
            if self.textures.len() >= limit {
                return Err(GpuError::AllocationFailed(format!(
                    "texture limit of {limit} reached"
                )));
            }
        }

        let handle = TextureHandle(self.next_handle);
        self.next_handle += 1;
        self.textures.insert(handle, UploadRecord::default());
        debug!(handle = %handle, extent = ?extent, "Allocated texture");
        Ok(handle)
    }

    fn release_texture_handle(&mut self, handle: TextureHandle) {
        if self.textures.remove(&handle).is_some() {
            debug!(handle = %handle, "Released texture");
        }
    }

    fn upload_pixels(
        &mut self,
        handle: TextureHandle,
        pixels: &[f32],
        extent: [u64; 3],
    ) -> Result<(), GpuError> {
        let expected = (extent[0] * extent[1] * extent[2]) as usize;
        if pixels.len() != expected {
            return Err(GpuError::ExtentMismatch {
                expected,
                actual: pixels.len(),
            });
        }

        if self.failing_uploads > 0 {
            self.failing_uploads -= 1;
            return Err(GpuError::UploadFailed {
                handle,
                reason: "injected failure".to_string(),
            });
        }

        let record = self
            .textures
            .get_mut(&handle)
            .ok_or(GpuError::UnknownHandle(handle))?;

        let bytes = std::mem::size_of_val(pixels) as u64;
        record.uploads += 1;
        record.bytes += bytes;
        record.checksum = pixel_checksum(pixels);
        self.total_uploads += 1;
        self.total_bytes += bytes;
        Ok(())
    }
}

impl Drop for HeadlessBackend {
    fn drop(&mut self) {
        if !self.textures.is_empty() {
            info!(live = self.textures.len(), "Headless backend dropped with live textures");
        }
    }
}
