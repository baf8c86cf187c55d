use glam::UVec2;
use rustc_hash::FxHashMap;
use crate::constants::page;
use crate::error::{VtError, VtResult};
use super::heap::IndexingBinaryMinHeap;
use super::page::{page_hash, ImageId, VtPage};

/// Eviction priority of a slot: recency in the high bits, mip in the low four
#[inline]
pub fn priority_key(frame: u32, mip: u32) -> u32 {
    (frame << page::KEY_MIP_BITS) | (mip & page::KEY_MIP_MASK)
}

#[inline]
fn frame_from_key(key: u32) -> u32 {
    key >> page::KEY_MIP_BITS
}

#[inline]
fn mip_from_key(key: u32) -> u32 {
    key & page::KEY_MIP_MASK
}

/// Fixed pool of physical cache slots.
///
/// Slots are ranked in a min-heap by [`priority_key`]; the heap top is always
/// the next eviction candidate. Unmapped slots carry key 0 so they are handed
/// out before any mapped slot. Mapped hashes are unique across the cache.
#[derive(Debug)]
pub struct PageCache {
    tile_count_wide: u32,
    pages: Vec<VtPage>,
    page_map: FxHashMap<u32, usize>,
    mapped_per_owner: Vec<Vec<u16>>,
    heap: IndexingBinaryMinHeap,
}

impl PageCache {
    pub fn new(tile_count_wide: u32, max_owners: usize) -> Self {
        let page_count = (tile_count_wide * tile_count_wide) as usize;

        let mut heap = IndexingBinaryMinHeap::with_capacity(page_count);
        for slot in 0..page_count {
            heap.push(0, slot);
        }

        log::debug!("[PageCache::new] {} slots ({}x{}), {} owners",
                    page_count, tile_count_wide, tile_count_wide, max_owners);

        Self {
            tile_count_wide,
            pages: vec![VtPage::default(); page_count],
            page_map: FxHashMap::with_capacity_and_hasher(page_count, Default::default()),
            mapped_per_owner: vec![Vec::new(); max_owners],
            heap,
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn mapped_count(&self) -> usize {
        self.page_map.len()
    }

    pub fn page(&self, slot: usize) -> Option<&VtPage> {
        self.pages.get(slot)
    }

    pub fn pages(&self) -> &[VtPage] {
        &self.pages
    }

    pub fn is_mapped(&self, slot: usize) -> bool {
        self.pages.get(slot).map_or(false, VtPage::is_mapped)
    }

    /// Slots currently mapped for `owner`
    pub fn mapped_pages_of(&self, owner: ImageId) -> &[u16] {
        self.mapped_per_owner.get(owner).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Slot serving `(x, y, mip)`, if resident
    pub fn page_id(&self, x: u32, y: u32, mip: u32) -> Option<usize> {
        self.slot_of(page_hash(x, y, mip))
    }

    pub fn slot_of(&self, hash: u32) -> Option<usize> {
        self.page_map.get(&hash).copied()
    }

    /// Column and row of a slot inside the physical cache texture
    pub fn page_offset(&self, slot: usize) -> UVec2 {
        let slot = slot as u32;
        UVec2::new(slot % self.tile_count_wide, slot / self.tile_count_wide)
    }

    /// Next eviction candidate
    pub fn top(&self) -> Option<usize> {
        self.heap.top()
    }

    pub fn key(&self, slot: usize) -> Option<u32> {
        self.heap.key(slot)
    }

    /// True when the eviction candidate is free, or was last touched at least
    /// `min_age` frames before `frame`
    pub fn has_available_pages(&self, frame: u32, min_age: u32) -> bool {
        let (Some(slot), Some(key)) = (self.heap.top(), self.heap.top_key()) else {
            return false;
        };

        if !self.pages[slot].is_mapped() {
            return true;
        }

        frame.saturating_sub(frame_from_key(key)) >= min_age
    }

    /// Map `(x, y, mip)` for `owner` onto the eviction candidate.
    ///
    /// The candidate must already be unmapped; callers evict it first.
    pub fn map(&mut self, x: u32, y: u32, mip: u32, owner: ImageId, frame: u32) -> VtResult<usize> {
        let hash = page_hash(x, y, mip);
        if let Some(&slot) = self.page_map.get(&hash) {
            return Err(VtError::PageAlreadyMapped { hash, slot });
        }

        let slot = self.heap.top().ok_or(VtError::NoEvictableSlot)?;
        if self.pages[slot].is_mapped() {
            return Err(VtError::SlotOccupied { slot });
        }

        self.pages[slot] = VtPage {
            hash,
            mip: mip as u8,
            x: x as u16,
            y: y as u16,
            owner: Some(owner),
        };
        self.page_map.insert(hash, slot);
        self.owner_list_mut(owner).push(slot as u16);
        self.heap.update(priority_key(frame, mip), slot);

        log::trace!("[PageCache::map] Slot {} <- {}", slot, self.pages[slot]);
        Ok(slot)
    }

    /// Release a slot and make it the cheapest eviction candidate
    pub fn unmap(&mut self, slot: usize) {
        let Some(page) = self.pages.get(slot).copied() else {
            return;
        };

        if let Some(owner) = page.owner {
            self.page_map.remove(&page.hash);
            self.detach_from_owner(owner, slot);
            log::trace!("[PageCache::unmap] Slot {} -> {}", slot, page);
        }

        self.pages[slot] = VtPage::default();
        if self.heap.contains(slot) {
            self.heap.update(0, slot);
        }
    }

    /// Refresh recency of a slot, keeping the mip component of its key
    pub fn touch(&mut self, slot: usize, frame: u32) {
        if let Some(key) = self.heap.key(slot) {
            self.heap.update(priority_key(frame, mip_from_key(key)), slot);
        }
    }

    /// Re-key a mapped slot in place without dropping its content.
    ///
    /// A different slot already serving the new hash is unmapped first.
    pub fn remap(&mut self, slot: usize, x: u32, y: u32, mip: u32, owner: ImageId, frame: u32) {
        let hash = page_hash(x, y, mip);
        if let Some(other) = self.slot_of(hash).filter(|&other| other != slot) {
            log::warn!("[PageCache::remap] Slot {} already serves {:#09x}, unmapping it", other, hash);
            self.unmap(other);
        }

        let previous = self.pages[slot];
        if let Some(previous_owner) = previous.owner {
            self.page_map.remove(&previous.hash);
            if previous_owner != owner {
                self.detach_from_owner(previous_owner, slot);
            }
        }
        if previous.owner != Some(owner) {
            self.owner_list_mut(owner).push(slot as u16);
        }

        self.pages[slot] = VtPage {
            hash,
            mip: mip as u8,
            x: x as u16,
            y: y as u16,
            owner: Some(owner),
        };
        self.page_map.insert(hash, slot);
        if self.heap.contains(slot) {
            self.heap.update(priority_key(frame, mip), slot);
        }
    }

    /// Take a slot out of eviction ranking
    pub fn lock(&mut self, slot: usize) {
        self.heap.remove(slot);
    }

    /// Return a locked slot to eviction ranking as touched on `frame`
    pub fn unlock(&mut self, slot: usize, frame: u32) {
        if slot >= self.pages.len() {
            return;
        }

        let mip = self.pages[slot].mip as u32;
        self.heap.push(priority_key(frame, mip), slot);
    }

    /// Unmap every slot and reset all keys to 0
    pub fn clear(&mut self) {
        self.heap.clear();
        for slot in 0..self.pages.len() {
            self.pages[slot] = VtPage::default();
            self.heap.push(0, slot);
        }

        self.mapped_per_owner.iter_mut().for_each(Vec::clear);
        self.page_map.clear();
    }

    fn owner_list_mut(&mut self, owner: ImageId) -> &mut Vec<u16> {
        if owner >= self.mapped_per_owner.len() {
            self.mapped_per_owner.resize(owner + 1, Vec::new());
        }
        &mut self.mapped_per_owner[owner]
    }

    fn detach_from_owner(&mut self, owner: ImageId, slot: usize) {
        if let Some(list) = self.mapped_per_owner.get_mut(owner) {
            if let Some(pos) = list.iter().position(|&s| s as usize == slot) {
                list.swap_remove(pos);
            }
        }
    }
}
