use glam::{IVec2, UVec2, Vec2};
use crate::config::VirtualTextureConfig;
use crate::error::{VtError, VtResult};
use super::atlas::{AllocId, AtlasAllocator};
use super::page::{ImageId, RemapRequest};

/// One independently addressable texture sharing the page cache
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VirtualImage {
    pub alloc_id: Option<AllocId>,

    /// Region in level-0 indirection texels
    pub x: u16,
    pub y: u16,
    pub size: u16,
    pub mip_count: u8,

    /// Shader-side transform
    pub uv_origin: Vec2,
    pub uv_size: f32,
    pub derivative_scale: f32,
}

impl VirtualImage {
    pub fn is_live(&self) -> bool {
        self.alloc_id.is_some()
    }

    pub fn coords(&self) -> UVec2 {
        UVec2::new(self.x as u32, self.y as u32)
    }

    #[inline]
    pub fn contains(&self, x: u32, y: u32) -> bool {
        let (x0, y0, size) = (self.x as u32, self.y as u32, self.size as u32);
        x >= x0 && y >= y0 && x < x0 + size && y < y0 + size
    }

    pub fn max_mip(&self) -> u32 {
        (self.mip_count as u32).saturating_sub(1)
    }
}

/// Fixed table of virtual images backed by the atlas allocator.
///
/// Resizes and frees are not applied to the table right away: the new record
/// waits in a delayed list until [`VirtualImageRegistry::apply_delayed`] runs
/// after the frame's remaps were processed, so feedback and in-flight GPU work
/// keep seeing the coordinates they were produced with.
#[derive(Debug)]
pub struct VirtualImageRegistry {
    atlas: AtlasAllocator,
    images: Vec<VirtualImage>,
    delayed: Vec<(ImageId, VirtualImage)>,
    remaps: Vec<RemapRequest>,
    indirection_size: u32,
    content_size: u32,
    last_region_resize_frame: u32,
}

impl VirtualImageRegistry {
    pub fn new(config: &VirtualTextureConfig) -> Self {
        Self {
            atlas: AtlasAllocator::new(config.indirection_texture_size),
            images: vec![VirtualImage::default(); config.max_virtual_images],
            delayed: Vec::new(),
            remaps: Vec::new(),
            indirection_size: config.indirection_texture_size,
            content_size: config.tile_size - 2 * config.tile_border,
            last_region_resize_frame: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.images.len()
    }

    pub fn images(&self) -> &[VirtualImage] {
        &self.images
    }

    pub fn get(&self, id: ImageId) -> VtResult<&VirtualImage> {
        self.images.get(id).ok_or(VtError::InvalidImageId { id, capacity: self.images.len() })
    }

    pub fn is_live(&self, id: ImageId) -> bool {
        self.images.get(id).map_or(false, VirtualImage::is_live)
    }

    pub fn live_count(&self) -> usize {
        self.images.iter().filter(|image| image.is_live()).count()
    }

    pub fn atlas(&self) -> &AtlasAllocator {
        &self.atlas
    }

    /// Frame of the latest resize or free
    pub fn last_region_resize_frame(&self) -> u32 {
        self.last_region_resize_frame
    }

    pub fn pending_remaps(&self) -> &[RemapRequest] {
        &self.remaps
    }

    /// Hand the queued remaps to the frame update
    pub fn take_remaps(&mut self) -> Vec<RemapRequest> {
        std::mem::take(&mut self.remaps)
    }

    pub fn allocate(&mut self, size: u32) -> VtResult<ImageId> {
        self.check_size(size)?;

        let Some(id) = self.find_free_slot() else {
            log::warn!("[VirtualImageRegistry::allocate] All {} image slots are in use", self.images.len());
            return Err(VtError::NoFreeImageSlot { capacity: self.images.len() });
        };

        let Some(alloc_id) = self.atlas.alloc(size) else {
            log::warn!("[VirtualImageRegistry::allocate] No free {}x{} atlas region", size, size);
            return Err(VtError::AtlasExhausted { size });
        };

        let image = self.describe(alloc_id, size);
        self.images[id] = image;

        log::debug!("[VirtualImageRegistry::allocate] Image {} at ({}, {}) size {} ({} mips)",
                    id, image.x, image.y, size, image.mip_count);
        Ok(id)
    }

    /// Move an image to a region of `new_size`, keeping its resident pages.
    ///
    /// The table entry changes on the next [`Self::apply_delayed`].
    pub fn resize(&mut self, id: ImageId, new_size: u32, frame: u32) -> VtResult<()> {
        let current = self.latest(id)?;
        if current.mip_count == 0 || current.size as u32 == new_size {
            return Ok(());
        }

        let Some(old_alloc) = current.alloc_id else {
            return Err(VtError::ImageNotAllocated { id });
        };
        self.check_size(new_size)?;

        let Some(alloc_id) = self.atlas.alloc(new_size) else {
            log::warn!("[VirtualImageRegistry::resize] No free {}x{} atlas region for image {}", new_size, new_size, id);
            return Err(VtError::AtlasExhausted { size: new_size });
        };
        self.atlas.free(old_alloc);
        self.last_region_resize_frame = frame;

        let updated = self.describe(alloc_id, new_size);
        self.remaps.push(RemapRequest {
            origin: current.coords(),
            dest: updated.coords(),
            dest_size: new_size,
            delta_mip: current.mip_count as i32 - updated.mip_count as i32,
            max_mip: updated.max_mip() as i32,
            owner: id,
        });
        self.delayed.push((id, updated));

        log::debug!("[VirtualImageRegistry::resize] Image {} {} -> {} at ({}, {})",
                    id, current.size, new_size, updated.x, updated.y);
        Ok(())
    }

    /// Release an image's region and drop all of its pages.
    ///
    /// The slot stays reserved until the delayed record lands.
    pub fn free(&mut self, id: ImageId, frame: u32) -> VtResult<()> {
        let current = self.latest(id)?;
        let Some(alloc_id) = current.alloc_id else {
            log::debug!("[VirtualImageRegistry::free] Image {} is not allocated", id);
            return Ok(());
        };

        self.atlas.free(alloc_id);
        self.images[id].alloc_id = None;
        self.last_region_resize_frame = frame;

        self.remaps.push(RemapRequest::unmap_all(id, current.coords()));
        self.delayed.push((id, VirtualImage::default()));

        log::debug!("[VirtualImageRegistry::free] Image {} released", id);
        Ok(())
    }

    /// Queue an unmap of every page of one image, or of every live image
    pub fn flush(&mut self, id: Option<ImageId>) -> VtResult<()> {
        match id {
            Some(id) => {
                let image = self.latest(id)?;
                if !image.is_live() {
                    return Err(VtError::ImageNotAllocated { id });
                }
                self.remaps.push(RemapRequest::unmap_all(id, image.coords()));
            }
            None => {
                for id in 0..self.images.len() {
                    let image = self.images[id];
                    if image.is_live() {
                        self.remaps.push(RemapRequest::unmap_all(id, image.coords()));
                    }
                }
            }
        }
        Ok(())
    }

    /// Publish records queued by resize and free
    pub fn apply_delayed(&mut self) {
        for (id, image) in self.delayed.drain(..) {
            self.images[id] = image;
        }
    }

    pub fn has_delayed(&self) -> bool {
        !self.delayed.is_empty()
    }

    /// Image-local coordinates of an indirection texel at `mip`
    pub fn to_local_coords(&self, coords: IVec2, mip: u32, owner: ImageId) -> VtResult<IVec2> {
        let image = self.get(owner)?;
        let origin = image.coords().as_ivec2();
        Ok(((coords << mip as i32) - origin) >> mip as i32)
    }

    fn check_size(&self, size: u32) -> VtResult<()> {
        if size == 0 || !size.is_power_of_two() || size > self.indirection_size {
            return Err(VtError::InvalidImageSize { size, max: self.indirection_size });
        }
        Ok(())
    }

    fn find_free_slot(&self) -> Option<ImageId> {
        self.images.iter().position(|image| !image.is_live() && image.mip_count == 0)
    }

    /// Most recent record for `id`, including one not yet applied
    fn latest(&self, id: ImageId) -> VtResult<VirtualImage> {
        let published = *self.get(id)?;
        let pending = self.delayed.iter().rev().find(|(pending_id, _)| *pending_id == id);
        Ok(pending.map_or(published, |&(_, image)| image))
    }

    fn describe(&self, alloc_id: AllocId, size: u32) -> VirtualImage {
        let coords = self.atlas.texture_coords(alloc_id).unwrap_or(UVec2::ZERO);
        let indirection_size = self.indirection_size as f32;

        VirtualImage {
            alloc_id: Some(alloc_id),
            x: coords.x as u16,
            y: coords.y as u16,
            size: size as u16,
            mip_count: (size.ilog2() + 1) as u8,
            uv_origin: coords.as_vec2() / indirection_size,
            uv_size: size as f32 / indirection_size,
            derivative_scale: (size * self.content_size) as f32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(max_images: usize) -> VirtualImageRegistry {
        VirtualImageRegistry::new(&VirtualTextureConfig {
            indirection_texture_size: 256,
            max_virtual_images: max_images,
            ..Default::default()
        })
    }

    #[test]
    fn test_allocate_describes_image() {
        let mut reg = registry(4);
        let id = reg.allocate(64).unwrap();
        let image = *reg.get(id).unwrap();

        assert!(image.is_live());
        assert_eq!(image.mip_count, 7);
        assert_eq!(image.uv_origin, Vec2::ZERO);
        assert_eq!(image.uv_size, 0.25);
        assert_eq!(image.derivative_scale, 64.0 * 240.0);
    }

    #[test]
    fn test_allocation_failures_are_distinct() {
        let mut reg = registry(2);
        reg.allocate(256).unwrap();

        let atlas_full = reg.allocate(8).unwrap_err();
        assert_eq!(atlas_full.alloc_sentinel(), Some(-2));

        let mut reg = registry(1);
        reg.allocate(8).unwrap();
        let table_full = reg.allocate(8).unwrap_err();
        assert_eq!(table_full.alloc_sentinel(), Some(-1));

        assert!(matches!(reg.allocate(12), Err(VtError::InvalidImageSize { .. })));
    }

    #[test]
    fn test_resize_is_delayed() {
        let mut reg = registry(4);
        let id = reg.allocate(8).unwrap();
        let before = *reg.get(id).unwrap();

        reg.resize(id, 4, 7).unwrap();
        assert_eq!(*reg.get(id).unwrap(), before);
        assert_eq!(reg.last_region_resize_frame(), 7);

        let remaps = reg.take_remaps();
        assert_eq!(remaps.len(), 1);
        assert_eq!(remaps[0].delta_mip, 1);
        assert_eq!(remaps[0].max_mip, 2);
        assert_eq!(remaps[0].origin, before.coords());

        reg.apply_delayed();
        let after = reg.get(id).unwrap();
        assert_eq!(after.size, 4);
        assert_eq!(after.coords(), remaps[0].dest);
    }

    #[test]
    fn test_resize_same_size_is_noop() {
        let mut reg = registry(4);
        let id = reg.allocate(16).unwrap();
        reg.resize(id, 16, 3).unwrap();
        assert!(reg.pending_remaps().is_empty());
        assert_eq!(reg.last_region_resize_frame(), 0);
    }

    #[test]
    fn test_chained_resizes_follow_pending_record() {
        let mut reg = registry(4);
        let id = reg.allocate(16).unwrap();
        reg.resize(id, 32, 1).unwrap();
        reg.resize(id, 8, 1).unwrap();

        let remaps = reg.take_remaps();
        assert_eq!(remaps[1].origin, remaps[0].dest);
        assert_eq!(remaps[1].delta_mip, 2);

        reg.apply_delayed();
        assert_eq!(reg.get(id).unwrap().size, 8);
        assert_eq!(reg.atlas().free_area(), 256 * 256 - 64);
    }

    #[test]
    fn test_freed_slot_is_reserved_until_apply() {
        let mut reg = registry(1);
        let id = reg.allocate(32).unwrap();
        reg.free(id, 2).unwrap();

        assert!(!reg.is_live(id));
        assert!(matches!(reg.allocate(32), Err(VtError::NoFreeImageSlot { .. })));

        let remaps = reg.take_remaps();
        assert!(remaps[0].target_mip(0).is_none());

        reg.apply_delayed();
        assert_eq!(reg.allocate(32).unwrap(), id);
    }

    #[test]
    fn test_flush_all_targets_live_images() {
        let mut reg = registry(4);
        let a = reg.allocate(8).unwrap();
        let b = reg.allocate(8).unwrap();
        let c = reg.allocate(8).unwrap();
        reg.free(b, 1).unwrap();
        reg.take_remaps();

        reg.flush(None).unwrap();
        let owners: Vec<ImageId> = reg.take_remaps().iter().map(|r| r.owner).collect();
        assert_eq!(owners, vec![a, c]);
    }

    #[test]
    fn test_local_coords() {
        let mut reg = registry(4);
        reg.allocate(128).unwrap();
        let id = reg.allocate(64).unwrap();
        let origin = reg.get(id).unwrap().coords().as_ivec2();

        let at_mip_2 = (origin >> 2) + IVec2::new(3, 1);
        assert_eq!(reg.to_local_coords(at_mip_2, 2, id).unwrap(), IVec2::new(3, 1));
    }
}
