//! Virtual texture error handling
//!
//! Resource exhaustion is reported as a typed error the caller retries later;
//! nothing in the paging engine panics on an expected condition.

use std::path::PathBuf;

/// Virtual texture result type
pub type VtResult<T> = Result<T, VtError>;

/// Virtual texture errors
#[derive(Debug, thiserror::Error)]
pub enum VtError {
    #[error("No free virtual image slot (capacity {capacity})")]
    NoFreeImageSlot { capacity: usize },

    #[error("Atlas exhausted: no free {size}x{size} region")]
    AtlasExhausted { size: u32 },

    #[error("Invalid virtual image size {size}: must be a power of two in 1..={max}")]
    InvalidImageSize { size: u32, max: u32 },

    #[error("Virtual image {id} is out of range (capacity {capacity})")]
    InvalidImageId { id: usize, capacity: usize },

    #[error("Virtual image {id} is not allocated")]
    ImageNotAllocated { id: usize },

    #[error("Page {hash:#09x} is already mapped to cache slot {slot}")]
    PageAlreadyMapped { hash: u32, slot: usize },

    #[error("Cache slot {slot} at the top of the eviction heap is still mapped")]
    SlotOccupied { slot: usize },

    #[error("No cache slot is available for eviction")]
    NoEvictableSlot,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to read configuration {path:?}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Feedback analysis task disconnected before delivering results")]
    AnalysisDisconnected,

    #[error("Failed to build feedback analysis thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl VtError {
    /// Legacy integer sentinel for image allocation failures.
    ///
    /// `-1` means the image table is full, `-2` means the atlas is full.
    pub fn alloc_sentinel(&self) -> Option<i32> {
        match self {
            VtError::NoFreeImageSlot { .. } => Some(-1),
            VtError::AtlasExhausted { .. } => Some(-2),
            _ => None,
        }
    }

    /// True for exhaustion errors that clear up once other images are freed
    pub fn is_retryable(&self) -> bool {
        self.alloc_sentinel().is_some()
    }
}

/// Create an invalid configuration error
pub fn config_error(reason: impl std::fmt::Display) -> VtError {
    VtError::InvalidConfig(reason.to_string())
}
