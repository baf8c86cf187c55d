use glam::UVec2;
use rustc_hash::FxHashMap;
use crate::constants::indirection;
use super::page::{page_hash, IndirectionTextureUpdate};

/// Per-frame set of indirection texel writes, at most one per texel.
///
/// A second write to the same texel overwrites the first in place. Unmap
/// writes hand back the render flag of the entry they replace so a remap can
/// carry it onto the new coordinates.
#[derive(Debug, Clone)]
pub struct IndirectionMapDelta {
    updates: Vec<Vec<IndirectionTextureUpdate>>,
    index_by_hash: FxHashMap<u32, usize>,
    len: usize,
}

impl IndirectionMapDelta {
    pub fn new(mip_count: u32) -> Self {
        Self {
            updates: vec![Vec::new(); mip_count as usize],
            index_by_hash: FxHashMap::default(),
            len: 0,
        }
    }

    /// Total writes over all mips
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn mip_count(&self) -> usize {
        self.updates.len()
    }

    pub fn mip_len(&self, mip: usize) -> usize {
        self.updates.get(mip).map_or(0, Vec::len)
    }

    pub fn mip_updates(&self, mip: usize) -> &[IndirectionTextureUpdate] {
        self.updates.get(mip).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Point texel `(x, y)` of `mip` at cache slot `cache` holding `cache_mip`
    pub fn map(&mut self, x: u32, y: u32, mip: u32, cache: UVec2, cache_mip: u32, render: bool) {
        let update = IndirectionTextureUpdate::map(x, y, cache.x, cache.y, cache_mip, render);
        self.write(mip, page_hash(x, y, mip), update);
    }

    /// Clear texel `(x, y)` of `mip`. Returns the render flag of the write it
    /// replaced, false when the texel was untouched this frame.
    pub fn unmap(&mut self, x: u32, y: u32, mip: u32) -> bool {
        let update = IndirectionTextureUpdate::unmap(x, y);
        self.write(mip, page_hash(x, y, mip), update)
    }

    fn write(&mut self, mip: u32, hash: u32, update: IndirectionTextureUpdate) -> bool {
        let Some(list) = self.updates.get_mut(mip as usize) else {
            log::error!("[IndirectionMapDelta::write] Mip {} out of range (mip count {})", mip, self.updates.len());
            return false;
        };

        if let Some(&index) = self.index_by_hash.get(&hash) {
            let previous = std::mem::replace(&mut list[index], update);
            return previous.content.needs_render();
        }

        self.index_by_hash.insert(hash, list.len());
        list.push(update);
        self.len += 1;
        false
    }

    /// Flatten all mips into `out`. `offsets[i]` receives the start of mip
    /// `i`; `offsets[mip_count]` the total.
    pub fn combine_into(&self, offsets: &mut [usize], out: &mut Vec<IndirectionTextureUpdate>) {
        debug_assert!(offsets.len() > self.updates.len());

        out.clear();
        out.reserve(self.len);
        offsets[0] = 0;
        for (mip, list) in self.updates.iter().enumerate() {
            out.extend_from_slice(list);
            offsets[mip + 1] = out.len();
        }
    }

    pub fn clear(&mut self) {
        self.updates.iter_mut().for_each(Vec::clear);
        self.index_by_hash.clear();
        self.len = 0;
    }
}

/// One write pass over the updates of a single mip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateDispatch {
    pub mip: u32,
    pub base: usize,
    pub count: usize,
    pub groups: u32,
}

/// One pass copying coarser mapped texels into unmapped texels of `mip`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillPass {
    pub mip: u32,
    pub mip_size: u32,
    pub groups: u32,
}

/// Everything the renderer needs to apply one frame's indirection delta
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndirectionUpload {
    pub updates: Vec<IndirectionTextureUpdate>,
    pub offsets: Vec<usize>,
    pub dispatches: Vec<UpdateDispatch>,
    pub fill_passes: Vec<FillPass>,
}

impl IndirectionUpload {
    pub fn build(delta: &IndirectionMapDelta, indirection_size: u32) -> Self {
        if delta.is_empty() {
            return Self::default();
        }

        let mip_count = delta.mip_count();
        let mut offsets = vec![0; mip_count + 1];
        let mut updates = Vec::new();
        delta.combine_into(&mut offsets, &mut updates);

        let dispatches: Vec<UpdateDispatch> = (0..mip_count)
            .filter(|&mip| delta.mip_len(mip) > 0)
            .map(|mip| {
                let count = delta.mip_len(mip);
                UpdateDispatch {
                    mip: mip as u32,
                    base: offsets[mip],
                    count,
                    groups: (count as u32).div_ceil(indirection::WRITE_GROUP_SIZE),
                }
            })
            .collect();

        let max_touched_mip = dispatches.last().map_or(0, |d| d.mip);
        let fill_passes = if max_touched_mip > 0 {
            (0..mip_count.saturating_sub(1) as u32)
                .rev()
                .map(|mip| {
                    let mip_size = indirection_size >> mip;
                    FillPass {
                        mip,
                        mip_size,
                        groups: mip_size.div_ceil(indirection::FILL_GROUP_SIZE).max(1),
                    }
                })
                .collect()
        } else {
            Vec::new()
        };

        Self {
            updates,
            offsets,
            dispatches,
            fill_passes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Updates written to `mip`
    pub fn mip_range(&self, mip: usize) -> &[IndirectionTextureUpdate] {
        match (self.offsets.get(mip), self.offsets.get(mip + 1)) {
            (Some(&start), Some(&end)) => &self.updates[start..end],
            _ => &[],
        }
    }

    /// Raw bytes of the combined update array
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_write_overwrites() {
        let mut delta = IndirectionMapDelta::new(4);
        delta.map(1, 2, 0, UVec2::new(3, 3), 0, false);
        delta.map(1, 2, 0, UVec2::new(5, 6), 0, true);

        assert_eq!(delta.len(), 1);
        let update = delta.mip_updates(0)[0];
        assert_eq!((update.content.page_x, update.content.page_y), (5, 6));
        assert!(update.content.needs_render());
    }

    #[test]
    fn test_unmap_returns_previous_render_flag() {
        let mut delta = IndirectionMapDelta::new(4);
        assert!(!delta.unmap(7, 7, 1));

        delta.map(2, 2, 1, UVec2::ZERO, 1, true);
        assert!(delta.unmap(2, 2, 1));
        assert_eq!(delta.mip_len(1), 1);
        assert!(!delta.mip_updates(1)[0].content.is_used());

        delta.map(3, 3, 1, UVec2::ZERO, 1, false);
        assert!(!delta.unmap(3, 3, 1));
    }

    #[test]
    fn test_same_texel_on_other_mip_is_distinct() {
        let mut delta = IndirectionMapDelta::new(3);
        delta.map(1, 1, 0, UVec2::ZERO, 0, false);
        delta.map(1, 1, 2, UVec2::ZERO, 2, false);
        assert_eq!(delta.len(), 2);
        assert_eq!(delta.mip_len(0), 1);
        assert_eq!(delta.mip_len(2), 1);
    }

    #[test]
    fn test_combine_offsets() {
        let mut delta = IndirectionMapDelta::new(3);
        delta.map(0, 0, 2, UVec2::ZERO, 2, false);
        delta.map(0, 0, 0, UVec2::ZERO, 0, false);
        delta.map(1, 0, 0, UVec2::ZERO, 0, false);

        let mut offsets = [0usize; 4];
        let mut out = Vec::new();
        delta.combine_into(&mut offsets, &mut out);

        assert_eq!(offsets, [0, 2, 2, 3]);
        assert_eq!(out.len(), 3);
        assert_eq!(out[2].content.mip, 2);
    }

    #[test]
    fn test_upload_plan() {
        let mut delta = IndirectionMapDelta::new(10);
        for x in 0..70 {
            delta.map(x, 0, 0, UVec2::ZERO, 0, false);
        }
        delta.map(0, 0, 3, UVec2::ZERO, 3, true);

        let upload = IndirectionUpload::build(&delta, 512);
        assert_eq!(upload.updates.len(), 71);
        assert_eq!(upload.dispatches, vec![
            UpdateDispatch { mip: 0, base: 0, count: 70, groups: 2 },
            UpdateDispatch { mip: 3, base: 70, count: 1, groups: 1 },
        ]);

        assert_eq!(upload.fill_passes.len(), 9);
        assert_eq!(upload.fill_passes[0], FillPass { mip: 8, mip_size: 2, groups: 1 });
        assert_eq!(upload.fill_passes[8], FillPass { mip: 0, mip_size: 512, groups: 64 });
        assert_eq!(upload.mip_range(3).len(), 1);
        assert_eq!(upload.as_bytes().len(), 71 * 8);
    }

    #[test]
    fn test_mip_zero_only_skips_fill() {
        let mut delta = IndirectionMapDelta::new(10);
        delta.unmap(4, 4, 0);

        let upload = IndirectionUpload::build(&delta, 512);
        assert_eq!(upload.dispatches.len(), 1);
        assert!(upload.fill_passes.is_empty());
    }

    #[test]
    fn test_empty_delta_uploads_nothing() {
        let delta = IndirectionMapDelta::new(10);
        let upload = IndirectionUpload::build(&delta, 512);
        assert!(upload.is_empty());
        assert!(upload.dispatches.is_empty());
        assert!(upload.fill_passes.is_empty());
    }
}
