//! Block streaming: disk to main memory to GPU.
//!
//! - [`queue`]: Epoch-tagged loader work queue with deferral parking
//! - [`loader`]: Background loader thread owning both cache tiers
//! - [`upload`]: Render-thread upload pump with a per-frame time budget
//! - [`collection`]: BlockCollection, the façade used by the render loop and control surface

pub mod collection;
pub mod loader;
pub mod queue;
pub mod upload;

use thiserror::Error;

use crate::cache::classifier::ClassificationError;
use crate::gpu::GpuError;
use crate::transfer::disk_io::DiskIoError;
use crate::volume::DataType;

pub use collection::{BlockCollection, ClassificationState, CollectionStats, StatusCounts};
pub use loader::{BlockLoader, DrawItem, LoaderStats, Residency, StepOutcome, StreamingLimits};
pub use upload::UploadReport;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Disk error: {0}")]
    Disk(#[from] DiskIoError),

    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),

    #[error("Classification error: {0}")]
    Classification(#[from] ClassificationError),

    #[error("Invalid capacity: {0}")]
    InvalidCapacity(String),

    #[error("Reader decodes {reader} voxels but the index was built for {index}")]
    DataTypeMismatch { reader: DataType, index: DataType },

    #[error("Loader thread is already running")]
    AlreadyRunning,

    #[error("Failed to spawn loader thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
}
