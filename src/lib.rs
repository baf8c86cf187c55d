pub mod config;
pub mod constants;
pub mod error;
pub mod virtual_texture;

pub use config::{CacheCompression, CacheTextureDescriptor, VirtualTextureConfig};
pub use error::{VtError, VtResult};
pub use virtual_texture::{
    AdaptiveVirtualTexture, AnalysisTask, CacheCopy, FeedbackReadback, FeedbackSample, FlushRegion, FrameStats,
    FrameUpdate, ImageId, IndirectionTextureUpdate, IndirectionUpload, ReadbackCompletion, RenderRequest,
    VirtualImage, VtCommonUniforms, VtPage, VtStats,
};
