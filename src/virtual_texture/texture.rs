use std::sync::Arc;
use bytemuck::{Pod, Zeroable};
use glam::{IVec2, UVec2};
use crate::config::VirtualTextureConfig;
use crate::constants::cache;
use crate::error::VtResult;
use super::feedback::{AnalysisTask, FeedbackAnalyzer};
use super::page::ImageId;
use super::page_cache::PageCache;
use super::readback::FeedbackReadback;
use super::registry::{VirtualImage, VirtualImageRegistry};
use super::update::{FlushRegion, FrameUpdate, FrameUpdater, RenderRequest, VtStats};

/// Constant block shared by every shader sampling the virtual texture
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct VtCommonUniforms {
    pub indirection_texture_size: [f32; 2],
    pub indirection_texture_size_int: u32,
    pub physical_texture_rcp_size: f32,
    pub cache_tile_size: f32,
    pub cache_border_size: f32,
    pub cache_tile_count_wide: f32,
    /// Content share of a tile in physical texture UV units
    pub cache_scale: f32,
}

/// One scratch-to-cache copy for one cache texture layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheCopy {
    pub scratch_index: usize,
    pub layer: usize,
    /// Destination offset in physical cache texels
    pub dest: UVec2,
    /// Copy extent in compressed blocks
    pub blocks: UVec2,
}

/// Virtual images sharing one page cache, driven by GPU feedback.
///
/// Per frame: [`poll_readback`](Self::poll_readback), then
/// [`schedule_feedback_analysis`](Self::schedule_feedback_analysis), then
/// [`update_queued_requests`](Self::update_queued_requests) with the task it
/// returned. The returned upload goes to the indirection texture and the
/// render requests are rasterized and handed back to
/// [`copy_to_cache`](Self::copy_to_cache).
#[derive(Debug)]
pub struct AdaptiveVirtualTexture {
    config: VirtualTextureConfig,
    registry: VirtualImageRegistry,
    updater: FrameUpdater,
    analyzer: FeedbackAnalyzer,
    readback: FeedbackReadback,
    frame: u32,
    stats: VtStats,
}

impl AdaptiveVirtualTexture {
    pub fn new(config: VirtualTextureConfig) -> VtResult<Self> {
        config.validate()?;

        let analyzer = FeedbackAnalyzer::new(config.worker_count())?;
        log::info!("[AdaptiveVirtualTexture::new] {}x{} indirection ({} mips), {} cache pages of {} texels, {} layers",
                   config.indirection_texture_size, config.indirection_texture_size,
                   config.indirection_mip_count(), config.page_count(),
                   config.tile_size_with_border(), config.cache_textures.len());

        Ok(Self {
            registry: VirtualImageRegistry::new(&config),
            updater: FrameUpdater::new(&config),
            readback: FeedbackReadback::new(config.feedback_downscale_shift),
            analyzer,
            frame: cache::FIRST_FRAME,
            stats: VtStats::default(),
            config,
        })
    }

    pub fn config(&self) -> &VirtualTextureConfig {
        &self.config
    }

    /// Frame the next update runs as
    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn stats(&self) -> &VtStats {
        &self.stats
    }

    pub fn cache(&self) -> &PageCache {
        self.updater.cache()
    }

    pub fn images(&self) -> &[VirtualImage] {
        self.registry.images()
    }

    pub fn allocate(&mut self, size: u32) -> VtResult<ImageId> {
        self.registry.allocate(size)
    }

    pub fn resize(&mut self, id: ImageId, size: u32) -> VtResult<()> {
        self.registry.resize(id, size, self.frame)
    }

    pub fn free(&mut self, id: ImageId) -> VtResult<()> {
        self.registry.free(id, self.frame)
    }

    pub fn get(&self, id: ImageId) -> VtResult<VirtualImage> {
        self.registry.get(id).copied()
    }

    /// Drop every resident page of `id`, or of all live images
    pub fn flush(&mut self, id: Option<ImageId>) -> VtResult<()> {
        self.registry.flush(id)
    }

    /// Drop every resident page inside a half-open level-0 texel rectangle
    pub fn flush_region(&mut self, x0: u32, y0: u32, x1: u32, y1: u32) {
        self.updater.queue_flush(FlushRegion::new(x0, y0, x1, y1));
    }

    pub fn to_local_coords(&self, coords: IVec2, mip: u32, owner: ImageId) -> VtResult<IVec2> {
        self.registry.to_local_coords(coords, mip, owner)
    }

    pub fn last_region_resize_frame(&self) -> u32 {
        self.registry.last_region_resize_frame()
    }

    /// Keep a resident page out of eviction
    pub fn lock_page(&mut self, slot: usize) {
        self.updater.cache_mut().lock(slot);
    }

    pub fn unlock_page(&mut self, slot: usize) {
        let frame = self.frame;
        self.updater.cache_mut().unlock(slot, frame);
    }

    pub fn readback(&self) -> &FeedbackReadback {
        &self.readback
    }

    pub fn readback_mut(&mut self) -> &mut FeedbackReadback {
        &mut self.readback
    }

    /// Pick up finished feedback readbacks; returns true when new data arrived
    pub fn poll_readback(&mut self) -> bool {
        self.readback.poll(self.frame)
    }

    /// Analyse the latest feedback against the current image table
    pub fn schedule_feedback_analysis(&self) -> AnalysisTask {
        let images: Arc<[VirtualImage]> = self.registry.images().into();
        self.analyzer.schedule(self.readback.latest(), images)
    }

    /// Run the frame update on the analysis result and advance the frame.
    ///
    /// A lost analysis task is logged and the update runs on the requests
    /// already queued.
    pub fn update_queued_requests(&mut self, task: AnalysisTask, max_render_requests: usize) -> FrameUpdate {
        match task.wait() {
            Ok(requests) => self.updater.enqueue(&requests),
            Err(e) => log::warn!("[AdaptiveVirtualTexture::update_queued_requests] {}, updating without new feedback", e),
        }

        let remaps = self.registry.take_remaps();
        let update = self.updater.update(self.frame, max_render_requests, &remaps, self.registry.images());
        self.registry.apply_delayed();

        self.stats.record(&update.stats, self.updater.cache().mapped_count());
        self.frame += 1;
        update
    }

    /// Copies that move rendered scratch content into the physical cache,
    /// one per request and cache texture layer
    pub fn copy_to_cache(&self, requests: &[RenderRequest]) -> Vec<CacheCopy> {
        let tile = self.config.tile_size_with_border();
        let blocks = UVec2::splat(tile.div_ceil(cache::BLOCK_SIZE));

        requests
            .iter()
            .flat_map(|request| {
                (0..self.config.cache_textures.len()).map(move |layer| CacheCopy {
                    scratch_index: request.scratch_index,
                    layer,
                    dest: request.page_coord * tile,
                    blocks,
                })
            })
            .collect()
    }

    pub fn common_uniforms(&self) -> VtCommonUniforms {
        let size = self.config.indirection_texture_size;
        let rcp_size = 1.0 / self.config.cache_texture_size() as f32;
        let tile = self.config.tile_size_with_border() as f32;
        let border = self.config.tile_border as f32;

        VtCommonUniforms {
            indirection_texture_size: [size as f32; 2],
            indirection_texture_size_int: size,
            physical_texture_rcp_size: rcp_size,
            cache_tile_size: tile,
            cache_border_size: border,
            cache_tile_count_wide: self.config.tile_count_wide as f32,
            cache_scale: (tile - 2.0 * border) * rcp_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheCompression, CacheTextureDescriptor};
    use crate::virtual_texture::feedback::FeedbackSample;
    use crate::virtual_texture::readback::ReadbackCompletion;

    fn texture() -> AdaptiveVirtualTexture {
        AdaptiveVirtualTexture::new(VirtualTextureConfig {
            indirection_texture_size: 256,
            tile_count_wide: 4,
            feedback_workers: 2,
            feedback_downscale_shift: 0,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_uniforms_layout() {
        let vt = texture();
        let uniforms = vt.common_uniforms();

        assert_eq!(std::mem::size_of::<VtCommonUniforms>(), 32);
        assert_eq!(uniforms.indirection_texture_size_int, 256);
        assert_eq!(uniforms.cache_tile_size, 272.0);
        assert!((uniforms.cache_scale - 256.0 / (4.0 * 272.0)).abs() < 1e-6);
    }

    #[test]
    fn test_frame_loop_maps_lowest_mip_and_feedback() {
        let mut vt = texture();
        let id = vt.allocate(16).unwrap();
        let image = vt.get(id).unwrap();

        vt.readback_mut().refresh(4, 4);
        let sample = FeedbackSample::new(image.x as u32 + 3, image.y as u32 + 3, 0).encode();
        vt.readback()
            .completion_sender()
            .send(ReadbackCompletion { frame: 1, samples: vec![sample; 16] })
            .unwrap();
        assert!(vt.poll_readback());

        let task = vt.schedule_feedback_analysis();
        let update = vt.update_queued_requests(task, 4);

        // Coarsest mip, the sampled page and the mip above it
        assert_eq!(update.stats.mapped, 3);
        assert_eq!(update.render_requests.len(), 3);
        assert!(vt.cache().page_id(0, 0, 4).is_some());
        assert!(vt.cache().page_id(3, 3, 0).is_some());
        assert_eq!(vt.frame(), 2);
        assert_eq!(vt.stats().pages_mapped, 3);
    }

    #[test]
    fn test_copy_to_cache_per_layer() {
        let mut config = VirtualTextureConfig {
            indirection_texture_size: 256,
            tile_count_wide: 4,
            feedback_workers: 1,
            ..Default::default()
        };
        config.cache_textures.push(CacheTextureDescriptor {
            name: "_Normal".to_string(),
            compression: CacheCompression::Bc5Rg,
        });
        let mut vt = AdaptiveVirtualTexture::new(config).unwrap();
        vt.allocate(1).unwrap();

        let update = vt.update_queued_requests(AnalysisTask::completed(Default::default()), 4);
        let copies = vt.copy_to_cache(&update.render_requests);

        assert_eq!(copies.len(), 2);
        assert_eq!(copies[0].layer, 0);
        assert_eq!(copies[1].layer, 1);
        assert_eq!(copies[0].dest, update.render_requests[0].page_coord * 272);
        assert_eq!(copies[0].blocks, UVec2::splat(68));
    }

    #[test]
    fn test_free_applies_after_update() {
        let mut vt = texture();
        let id = vt.allocate(8).unwrap();
        vt.update_queued_requests(AnalysisTask::completed(Default::default()), 4);
        assert_eq!(vt.cache().mapped_pages_of(id).len(), 1);

        vt.free(id).unwrap();
        assert_eq!(vt.last_region_resize_frame(), 2);
        vt.update_queued_requests(AnalysisTask::completed(Default::default()), 4);

        assert_eq!(vt.cache().mapped_count(), 0);
        assert_eq!(vt.get(id).unwrap(), VirtualImage::default());
        assert_eq!(vt.allocate(8).unwrap(), id);
    }
}
