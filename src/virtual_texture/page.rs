use std::fmt;
use bytemuck::{Pod, Zeroable};
use glam::UVec2;
use crate::constants::{cache, indirection, page};

/// Index into the virtual image table
pub type ImageId = usize;

/// Pack indirection coordinates and mip into the page hash.
///
/// The hash uniquely names one indirection texel, so it doubles as the key of
/// every page-level map in the engine.
#[inline]
pub fn page_hash(x: u32, y: u32, mip: u32) -> u32 {
    debug_assert!(x <= page::HASH_COORD_MASK, "x {} out of 12-bit range", x);
    debug_assert!(y <= page::HASH_COORD_MASK, "y {} out of 12-bit range", y);
    debug_assert!(mip <= page::HASH_MIP_MASK, "mip {} out of 4-bit range", mip);

    (x & page::HASH_COORD_MASK)
        | ((y & page::HASH_COORD_MASK) << page::HASH_Y_SHIFT)
        | ((mip & page::HASH_MIP_MASK) << page::HASH_MIP_SHIFT)
}

/// Inverse of [`page_hash`]: `(x, y, mip)`
#[inline]
pub fn unpack_page_hash(hash: u32) -> (u32, u32, u32) {
    (
        hash & page::HASH_COORD_MASK,
        (hash >> page::HASH_Y_SHIFT) & page::HASH_COORD_MASK,
        (hash >> page::HASH_MIP_SHIFT) & page::HASH_MIP_MASK,
    )
}

/// Current mapping of one physical cache slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VtPage {
    pub hash: u32,

    /// Mip level the slot is mapped to
    pub mip: u8,

    /// Indirection coordinates at that mip
    pub x: u16,
    pub y: u16,

    pub owner: Option<ImageId>,
}

impl VtPage {
    pub fn is_mapped(&self) -> bool {
        self.owner.is_some()
    }

    pub fn coords(&self) -> UVec2 {
        UVec2::new(self.x as u32, self.y as u32)
    }
}

impl fmt::Display for VtPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.owner {
            Some(owner) => write!(f, "VtPage({}:{}, mip: {}, owner: {})", self.x, self.y, self.mip, owner),
            None => write!(f, "VtPage(unmapped)"),
        }
    }
}

/// One requested page: indirection coordinates at `mip` and the owning image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageRequest {
    pub x: u16,
    pub y: u16,
    pub mip: u8,
    pub owner: ImageId,
}

impl PageRequest {
    pub fn new(x: u32, y: u32, mip: u32, owner: ImageId) -> Self {
        Self {
            x: x as u16,
            y: y as u16,
            mip: mip as u8,
            owner,
        }
    }

    pub fn hash(&self) -> u32 {
        page_hash(self.x as u32, self.y as u32, self.mip as u32)
    }
}

/// How an image's resident pages move after its region changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemapRequest {
    pub origin: UVec2,
    pub dest: UVec2,
    pub dest_size: u32,

    /// Old mip count minus new mip count
    pub delta_mip: i32,

    /// Highest mip valid after the remap
    pub max_mip: i32,
    pub owner: ImageId,
}

impl RemapRequest {
    /// A remap under which no page stays in range, i.e. unmap everything
    pub fn unmap_all(owner: ImageId, origin: UVec2) -> Self {
        Self {
            origin,
            dest: origin,
            dest_size: 0,
            delta_mip: cache::UNMAP_ALL_DELTA_MIP,
            max_mip: 0,
            owner,
        }
    }

    /// Destination mip of a page currently at `mip`, if it survives the remap
    pub fn target_mip(&self, mip: u32) -> Option<u32> {
        let new_mip = mip as i32 - self.delta_mip;
        (new_mip >= 0 && new_mip <= self.max_mip).then_some(new_mip as u32)
    }

    /// Destination coordinates at `new_mip` of a page at `coords`/`mip`
    pub fn translate(&self, coords: UVec2, mip: u32, new_mip: u32) -> UVec2 {
        let local = coords - (self.origin >> mip);
        (self.dest >> new_mip) + local
    }
}

/// Value written to one indirection texel
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct IndirectionTextureContent {
    pub page_x: u8,
    pub page_y: u8,
    pub mip: u8,
    pub flags: u8,
}

impl IndirectionTextureContent {
    pub fn is_used(&self) -> bool {
        self.flags & indirection::USED_FLAG != 0
    }

    pub fn needs_render(&self) -> bool {
        self.flags & indirection::RENDER_FLAG != 0
    }

    pub fn set_render(&mut self, render: bool) {
        if render {
            self.flags |= indirection::RENDER_FLAG;
        } else {
            self.flags &= !indirection::RENDER_FLAG;
        }
    }
}

/// One texel write for a single mip of the indirection texture
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct IndirectionTextureUpdate {
    pub x: u16,
    pub y: u16,
    pub content: IndirectionTextureContent,
}

impl IndirectionTextureUpdate {
    /// Point texel `(x, y)` at cache slot `(page_x, page_y)` holding `page_mip`
    pub fn map(x: u32, y: u32, page_x: u32, page_y: u32, page_mip: u32, render: bool) -> Self {
        let mut content = IndirectionTextureContent {
            page_x: page_x as u8,
            page_y: page_y as u8,
            mip: page_mip as u8,
            flags: indirection::USED_FLAG,
        };
        content.set_render(render);

        Self {
            x: x as u16,
            y: y as u16,
            content,
        }
    }

    /// Mark texel `(x, y)` as unmapped
    pub fn unmap(x: u32, y: u32) -> Self {
        Self {
            x: x as u16,
            y: y as u16,
            content: IndirectionTextureContent::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_layout() {
        assert_eq!(page_hash(0xABC, 0x123, 0x5), 0x0512_3ABC);
        assert_eq!(unpack_page_hash(0x0512_3ABC), (0xABC, 0x123, 0x5));
    }

    #[test]
    fn test_hash_distinguishes_mips() {
        assert_ne!(page_hash(1, 1, 0), page_hash(1, 1, 1));
        assert_ne!(page_hash(1, 0, 0), page_hash(0, 1, 0));
    }

    #[test]
    fn test_update_is_eight_bytes() {
        assert_eq!(std::mem::size_of::<IndirectionTextureUpdate>(), 8);
        let update = IndirectionTextureUpdate::map(3, 4, 5, 6, 2, true);
        let bytes: &[u8] = bytemuck::bytes_of(&update);
        assert_eq!(bytes, &[3, 0, 4, 0, 5, 6, 2, indirection::USED_FLAG | indirection::RENDER_FLAG]);
    }

    #[test]
    fn test_unmap_clears_flags() {
        let update = IndirectionTextureUpdate::unmap(9, 9);
        assert!(!update.content.is_used());
        assert!(!update.content.needs_render());
    }

    #[test]
    fn test_remap_targets() {
        // 8x8 image at (0, 0) shrinks to 4x4 at (8, 0): one mip fewer
        let remap = RemapRequest {
            origin: UVec2::new(0, 0),
            dest: UVec2::new(8, 0),
            dest_size: 4,
            delta_mip: 1,
            max_mip: 2,
            owner: 0,
        };

        assert_eq!(remap.target_mip(0), None);
        assert_eq!(remap.target_mip(1), Some(0));
        assert_eq!(remap.target_mip(3), Some(2));
        assert_eq!(remap.translate(UVec2::new(1, 2), 1, 0), UVec2::new(9, 2));
    }

    #[test]
    fn test_unmap_all_rejects_every_mip() {
        let remap = RemapRequest::unmap_all(3, UVec2::new(16, 16));
        assert!((0..16).all(|mip| remap.target_mip(mip).is_none()));
    }
}
