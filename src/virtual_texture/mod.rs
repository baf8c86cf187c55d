// Adaptive virtual texture paging
// Feedback-driven page residency over a fixed physical cache

pub mod atlas;
pub mod feedback;
pub mod heap;
pub mod indirection_delta;
pub mod page;
pub mod page_cache;
pub mod readback;
pub mod registry;
pub mod request_list;
pub mod texture;
pub mod update;

pub use atlas::{AllocId, AtlasAllocator};
pub use feedback::{analyze_parallel, analyze_range, AnalysisTask, FeedbackAnalyzer, FeedbackSample, UNWRITTEN_SAMPLE};
pub use heap::IndexingBinaryMinHeap;
pub use indirection_delta::{FillPass, IndirectionMapDelta, IndirectionUpload, UpdateDispatch};
pub use page::{page_hash, unpack_page_hash, ImageId, IndirectionTextureContent, IndirectionTextureUpdate, PageRequest, RemapRequest, VtPage};
pub use page_cache::{priority_key, PageCache};
pub use readback::{FeedbackReadback, FeedbackUniforms, ReadbackCompletion};
pub use registry::{VirtualImage, VirtualImageRegistry};
pub use request_list::RequestList;
pub use texture::{AdaptiveVirtualTexture, CacheCopy, VtCommonUniforms};
pub use update::{request_priority, FlushRegion, FrameStats, FrameUpdate, FrameUpdater, RenderRequest, VtStats};
