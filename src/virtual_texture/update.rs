use glam::UVec2;
use rustc_hash::FxHashSet;
use crate::config::VirtualTextureConfig;
use crate::constants::page;
use super::heap::IndexingBinaryMinHeap;
use super::indirection_delta::{IndirectionMapDelta, IndirectionUpload};
use super::page::{ImageId, PageRequest, RemapRequest, VtPage};
use super::page_cache::PageCache;
use super::registry::VirtualImage;
use super::request_list::RequestList;

/// Rank key of a request that is already resident; never popped for mapping
const RESIDENT_KEY: u32 = u32::MAX;

/// Half-open rectangle of level-0 indirection texels whose pages must go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushRegion {
    pub min: UVec2,
    pub max: UVec2,
}

impl FlushRegion {
    pub fn new(x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
        Self {
            min: UVec2::new(x0, y0),
            max: UVec2::new(x1, y1),
        }
    }

    /// Whether the page at `coords` of `mip` lies inside the region
    pub fn covers(&self, coords: UVec2, mip: u32) -> bool {
        let min = self.min >> mip;
        let max = self.max >> mip;
        coords.cmpge(min).all() && coords.cmplt(max).all()
    }
}

/// A page that must be rasterized into its cache slot this frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderRequest {
    pub page: VtPage,
    pub slot: usize,
    /// Column and row of the slot in the physical cache
    pub page_coord: UVec2,
    /// Scratch buffer the page is rendered into before the cache copy
    pub scratch_index: usize,
}

/// What happened during one frame update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frame: u32,
    pub requests: usize,
    pub resident: usize,
    pub mapped: usize,
    pub evicted: usize,
    pub remapped: usize,
    pub unmapped_by_remap: usize,
    pub flushed: usize,
    pub deferred: usize,
    pub map_failures: usize,
    pub render_requests: usize,
}

/// Totals over the lifetime of a virtual texture
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VtStats {
    pub frames: u64,
    pub pages_mapped: u64,
    pub evictions: u64,
    pub remapped: u64,
    pub flushed: u64,
    pub deferred: u64,
    pub render_requests: u64,
    pub peak_resident: usize,
}

impl VtStats {
    pub fn record(&mut self, stats: &FrameStats, resident: usize) {
        self.frames += 1;
        self.pages_mapped += stats.mapped as u64;
        self.evictions += stats.evicted as u64;
        self.remapped += stats.remapped as u64;
        self.flushed += stats.flushed as u64;
        self.deferred += stats.deferred as u64;
        self.render_requests += stats.render_requests as u64;
        self.peak_resident = self.peak_resident.max(resident);
    }
}

/// Output of one frame update
#[derive(Debug, Clone, Default)]
pub struct FrameUpdate {
    pub upload: IndirectionUpload,
    pub render_requests: Vec<RenderRequest>,
    pub stats: FrameStats,
}

/// Rank key of a request that is not resident: lower keys are mapped first.
///
/// Finer mips and more frequently requested pages win.
pub fn request_priority(mip: u32, count: u16, mip_count: u32) -> u32 {
    let mip_priority = mip_count.saturating_sub(mip);
    let count_priority = page::COUNT_PRIORITY_MAX.saturating_sub(count as u32 * mip_priority);
    (mip_priority & page::KEY_MIP_MASK) | (count_priority << page::KEY_MIP_BITS)
}

/// Single-threaded per-frame driver of the page cache and indirection delta
#[derive(Debug)]
pub struct FrameUpdater {
    cache: PageCache,
    delta: IndirectionMapDelta,
    queued: RequestList,
    flushes: Vec<FlushRegion>,
    indirection_size: u32,
    mip_count: u32,
    min_eviction_age: u32,
    scratch_buffers_count: usize,
}

impl FrameUpdater {
    pub fn new(config: &VirtualTextureConfig) -> Self {
        Self {
            cache: PageCache::new(config.tile_count_wide, config.max_virtual_images),
            delta: IndirectionMapDelta::new(config.indirection_mip_count()),
            queued: RequestList::with_capacity(256),
            flushes: Vec::new(),
            indirection_size: config.indirection_texture_size,
            mip_count: config.indirection_mip_count(),
            min_eviction_age: config.min_eviction_age,
            scratch_buffers_count: config.scratch_buffers_count as usize,
        }
    }

    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut PageCache {
        &mut self.cache
    }

    /// Requests waiting for the next update, including deferred ones
    pub fn queued(&self) -> &RequestList {
        &self.queued
    }

    pub fn enqueue(&mut self, requests: &RequestList) {
        self.queued.merge(requests);
    }

    pub fn queue_flush(&mut self, region: FlushRegion) {
        self.flushes.push(region);
    }

    pub fn pending_flushes(&self) -> &[FlushRegion] {
        &self.flushes
    }

    /// Run one frame: flush, rank, map within budget, remap, and emit the
    /// upload and render requests.
    ///
    /// A request whose page is still held by a freed or moved image is
    /// mapped after the remaps released it. Requests left unmapped by the
    /// budget, the eviction cooldown or a failed map stay queued for the next
    /// frame unless their image was remapped or freed.
    pub fn update(
        &mut self,
        frame: u32,
        max_render_requests: usize,
        remaps: &[RemapRequest],
        images: &[VirtualImage],
    ) -> FrameUpdate {
        let mut stats = FrameStats {
            frame,
            ..Default::default()
        };

        let remapped_owners: FxHashSet<ImageId> = remaps.iter().map(|remap| remap.owner).collect();
        self.queued.include_lowest_mips(images, &remapped_owners);
        stats.requests = self.queued.len();

        stats.flushed = self.process_flushes();

        let (mut ranking, contested, pages_to_map) = self.rank_requests(frame);
        stats.resident = self.queued.len() - pages_to_map;

        let budget = max_render_requests.min(self.scratch_buffers_count).min(pages_to_map);
        let mut held = Vec::new();
        self.map_within_budget(frame, budget, &mut ranking, &mut held, &mut stats);

        self.process_remaps(frame, remaps, &mut stats);
        self.map_contested(frame, budget, &contested, &remapped_owners, &mut held, &mut stats);
        stats.deferred = self.carry_deferred(&mut ranking, &held, &remapped_owners, images);

        let upload = IndirectionUpload::build(&self.delta, self.indirection_size);
        let render_requests = self.collect_render_requests(&upload);
        stats.render_requests = render_requests.len();
        self.delta.clear();

        log::debug!(
            "[FrameUpdater::update] Frame {}: {} requests, {} resident, {} mapped, {} evicted, {} remapped, {} unmapped by remap, {} flushed, {} deferred, {} renders",
            frame, stats.requests, stats.resident, stats.mapped, stats.evicted, stats.remapped,
            stats.unmapped_by_remap, stats.flushed, stats.deferred, stats.render_requests
        );

        FrameUpdate {
            upload,
            render_requests,
            stats,
        }
    }

    /// Unmap every resident page inside a queued flush region
    fn process_flushes(&mut self) -> usize {
        if self.flushes.is_empty() {
            return 0;
        }

        let flushes = std::mem::take(&mut self.flushes);
        let victims: Vec<(usize, VtPage)> = self
            .cache
            .pages()
            .iter()
            .enumerate()
            .filter(|(_, page)| page.is_mapped())
            .filter(|(_, page)| flushes.iter().any(|region| region.covers(page.coords(), page.mip as u32)))
            .map(|(slot, page)| (slot, *page))
            .collect();

        for &(slot, page) in &victims {
            self.delta.unmap(page.x as u32, page.y as u32, page.mip as u32);
            self.cache.unmap(slot);
        }

        victims.len()
    }

    /// Touch resident requests and rank the rest. Returns the ranking heap,
    /// the requests whose hash is still held by another image's page, and
    /// the number of requests that need a slot.
    fn rank_requests(&mut self, frame: u32) -> (IndexingBinaryMinHeap, Vec<usize>, usize) {
        let mut ranking = IndexingBinaryMinHeap::with_capacity(self.queued.len());
        let mut contested = Vec::new();
        let mut pages_to_map = 0;

        for (index, (request, count)) in self.queued.iter().enumerate() {
            match self.cache.slot_of(request.hash()) {
                Some(slot) if self.cache.page(slot).and_then(|page| page.owner) == Some(request.owner) => {
                    self.cache.touch(slot, frame);
                    ranking.push(RESIDENT_KEY, index);
                }
                // A freed or moved image's page on a region that was handed
                // out again; it only frees up once the remaps ran
                Some(_) => {
                    contested.push(index);
                    pages_to_map += 1;
                }
                None => {
                    ranking.push(request_priority(request.mip as u32, count, self.mip_count), index);
                    pages_to_map += 1;
                }
            }
        }

        (ranking, contested, pages_to_map)
    }

    /// Map ranked requests until the budget or the eviction cooldown runs
    /// out. Requests that fail to map go to `held`.
    fn map_within_budget(
        &mut self,
        frame: u32,
        budget: usize,
        ranking: &mut IndexingBinaryMinHeap,
        held: &mut Vec<usize>,
        stats: &mut FrameStats,
    ) {
        while stats.mapped < budget {
            if ranking.top_key().map_or(true, |key| key == RESIDENT_KEY) {
                break;
            }

            // Backpressure: the rest waits for the next frame
            if !self.cache.has_available_pages(frame, self.min_eviction_age) {
                log::trace!("[FrameUpdater::map_within_budget] No evictable slot, deferring the rest");
                break;
            }

            let Some((_, index)) = ranking.pop() else {
                break;
            };
            let Some((request, _)) = self.queued.get(index) else {
                continue;
            };

            if !self.map_request(frame, request, stats) {
                held.push(index);
            }
        }
    }

    /// Second chance for requests whose hash was held by a stale page during
    /// ranking. Whatever still cannot map goes to `held`.
    fn map_contested(
        &mut self,
        frame: u32,
        budget: usize,
        contested: &[usize],
        remapped_owners: &FxHashSet<ImageId>,
        held: &mut Vec<usize>,
        stats: &mut FrameStats,
    ) {
        for &index in contested {
            let Some((request, _)) = self.queued.get(index) else {
                continue;
            };

            let mappable = stats.mapped < budget
                && !remapped_owners.contains(&request.owner)
                && self.cache.slot_of(request.hash()).is_none()
                && self.cache.has_available_pages(frame, self.min_eviction_age);

            if !mappable || !self.map_request(frame, request, stats) {
                held.push(index);
            }
        }
    }

    /// Evict the heap top if it is mapped and map `request` into it
    fn map_request(&mut self, frame: u32, request: PageRequest, stats: &mut FrameStats) -> bool {
        if let Some(victim) = self.cache.top() {
            if let Some(page) = self.cache.page(victim).copied().filter(VtPage::is_mapped) {
                self.cache.unmap(victim);
                self.delta.unmap(page.x as u32, page.y as u32, page.mip as u32);
                stats.evicted += 1;
            }
        }

        let (x, y, mip) = (request.x as u32, request.y as u32, request.mip as u32);
        match self.cache.map(x, y, mip, request.owner, frame) {
            Ok(slot) => {
                let offset = self.cache.page_offset(slot);
                self.delta.map(x, y, mip, offset, mip, true);
                stats.mapped += 1;
                true
            }
            Err(e) => {
                log::error!("[FrameUpdater::map_request] Failed to map {}:{} mip {}: {}", x, y, mip, e);
                stats.map_failures += 1;
                false
            }
        }
    }

    /// Move or drop the pages of resized, freed or flushed images
    fn process_remaps(&mut self, frame: u32, remaps: &[RemapRequest], stats: &mut FrameStats) {
        for remap in remaps {
            // Remapping mutates the owner list, so walk a copy
            let slots = self.cache.mapped_pages_of(remap.owner).to_vec();
            for slot in slots {
                let slot = slot as usize;
                let Some(page) = self.cache.page(slot).copied().filter(VtPage::is_mapped) else {
                    continue;
                };

                let mip = page.mip as u32;
                let render = self.delta.unmap(page.x as u32, page.y as u32, mip);

                match remap.target_mip(mip) {
                    Some(new_mip) => {
                        let coords = remap.translate(page.coords(), mip, new_mip);
                        let offset = self.cache.page_offset(slot);

                        self.delta.map(coords.x, coords.y, new_mip, offset, new_mip, render);
                        self.cache.remap(slot, coords.x, coords.y, new_mip, remap.owner, frame);
                        stats.remapped += 1;
                    }
                    None => {
                        self.cache.unmap(slot);
                        stats.unmapped_by_remap += 1;
                    }
                }
            }
        }
    }

    /// Rebuild the queue from requests that never got a slot: the ranked
    /// ones still in the heap and the `held` ones
    fn carry_deferred(
        &mut self,
        ranking: &mut IndexingBinaryMinHeap,
        held: &[usize],
        remapped_owners: &FxHashSet<ImageId>,
        images: &[VirtualImage],
    ) -> usize {
        let mut carried = RequestList::with_capacity(ranking.len() + held.len());

        let mut pending = Vec::with_capacity(ranking.len() + held.len());
        while let Some((key, index)) = ranking.pop() {
            if key != RESIDENT_KEY {
                pending.push(index);
            }
        }
        pending.extend_from_slice(held);

        for index in pending {
            let Some((request, count)) = self.queued.get(index) else {
                continue;
            };
            let live = images.get(request.owner).map_or(false, VirtualImage::is_live);
            if live && !remapped_owners.contains(&request.owner) {
                carried.add(request, count);
            }
        }

        self.queued = carried;
        self.queued.len()
    }

    fn collect_render_requests(&self, upload: &IndirectionUpload) -> Vec<RenderRequest> {
        let mut requests = Vec::new();

        for update in upload.updates.iter().filter(|u| u.content.needs_render()) {
            let (x, y, mip) = (update.x as u32, update.y as u32, update.content.mip as u32);
            let Some(slot) = self.cache.page_id(x, y, mip) else {
                log::error!("[FrameUpdater::collect_render_requests] Page {}:{} mip {} flagged for render is not resident", x, y, mip);
                continue;
            };

            if requests.len() >= self.scratch_buffers_count {
                log::error!("[FrameUpdater::collect_render_requests] More renders than {} scratch buffers", self.scratch_buffers_count);
                break;
            }

            requests.push(RenderRequest {
                page: self.cache.page(slot).copied().unwrap_or_default(),
                slot,
                page_coord: UVec2::new(update.content.page_x as u32, update.content.page_y as u32),
                scratch_index: requests.len(),
            });
        }

        requests
    }
}
