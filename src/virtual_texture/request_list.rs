use rustc_hash::{FxHashMap, FxHashSet};
use super::page::{ImageId, PageRequest};
use super::registry::VirtualImage;

/// Page requests deduplicated by page hash, each with a saturating
/// importance counter.
///
/// The first request recorded for a hash keeps its owner; repeats only add
/// weight.
#[derive(Debug, Clone, Default)]
pub struct RequestList {
    requests: Vec<PageRequest>,
    counts: Vec<u16>,
    index_by_hash: FxHashMap<u32, usize>,
}

impl RequestList {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            requests: Vec::with_capacity(capacity),
            counts: Vec::with_capacity(capacity),
            index_by_hash: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Record `request` with `worth`. Returns true when the hash was new.
    pub fn add(&mut self, request: PageRequest, worth: u16) -> bool {
        let hash = request.hash();
        if let Some(&index) = self.index_by_hash.get(&hash) {
            self.counts[index] = self.counts[index].saturating_add(worth);
            return false;
        }

        self.index_by_hash.insert(hash, self.requests.len());
        self.requests.push(request);
        self.counts.push(worth);
        true
    }

    /// Fold every entry of `other` into this list, summing counters
    pub fn merge(&mut self, other: &RequestList) {
        for (request, count) in other.iter() {
            self.add(request, count);
        }
    }

    /// Request the coarsest mip of every live image at maximum weight.
    ///
    /// Images in `moved` are skipped: their pages are remapped this frame.
    /// An entry owned by one of them that lands on another image's coarsest
    /// page is handed over to that image.
    pub fn include_lowest_mips(&mut self, images: &[VirtualImage], moved: &FxHashSet<ImageId>) {
        for (id, image) in images.iter().enumerate() {
            if !image.is_live() || moved.contains(&id) {
                continue;
            }

            let top_mip = image.max_mip();
            let request = PageRequest::new(image.x as u32 >> top_mip, image.y as u32 >> top_mip, top_mip, id);

            if let Some(&index) = self.index_by_hash.get(&request.hash()) {
                if moved.contains(&self.requests[index].owner) {
                    self.requests[index].owner = id;
                }
            }
            self.add(request, u16::MAX);
        }
    }

    pub fn get(&self, index: usize) -> Option<(PageRequest, u16)> {
        Some((*self.requests.get(index)?, self.counts[index]))
    }

    pub fn count_of(&self, request: &PageRequest) -> Option<u16> {
        self.index_by_hash.get(&request.hash()).map(|&index| self.counts[index])
    }

    pub fn iter(&self) -> impl Iterator<Item = (PageRequest, u16)> + '_ {
        self.requests.iter().copied().zip(self.counts.iter().copied())
    }

    /// Keep only entries for which `keep` returns true
    pub fn retain(&mut self, mut keep: impl FnMut(&PageRequest, u16) -> bool) {
        let requests = std::mem::take(&mut self.requests);
        let counts = std::mem::take(&mut self.counts);
        self.index_by_hash.clear();

        for (request, count) in requests.into_iter().zip(counts) {
            if keep(&request, count) {
                self.add(request, count);
            }
        }
    }

    pub fn clear(&mut self) {
        self.requests.clear();
        self.counts.clear();
        self.index_by_hash.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_requests_collapse() {
        let mut list = RequestList::default();
        let request = PageRequest::new(3, 4, 1, 0);

        assert!(list.add(request, 1));
        for _ in 0..9 {
            assert!(!list.add(request, 1));
        }

        assert_eq!(list.len(), 1);
        assert_eq!(list.count_of(&request), Some(10));
    }

    #[test]
    fn test_counter_saturates() {
        let mut list = RequestList::default();
        let request = PageRequest::new(0, 0, 0, 0);
        list.add(request, 65_000);
        list.add(request, 1_000);
        assert_eq!(list.count_of(&request), Some(u16::MAX));
    }

    #[test]
    fn test_merge_sums_counts() {
        let mut a = RequestList::default();
        let mut b = RequestList::default();
        let shared = PageRequest::new(1, 1, 0, 2);
        let only_b = PageRequest::new(2, 1, 0, 2);

        a.add(shared, 3);
        b.add(shared, 4);
        b.add(only_b, 1);

        a.merge(&b);
        assert_eq!(a.len(), 2);
        assert_eq!(a.count_of(&shared), Some(7));
        assert_eq!(a.count_of(&only_b), Some(1));
    }

    #[test]
    fn test_retain_rebuilds_index() {
        let mut list = RequestList::default();
        for x in 0..4 {
            list.add(PageRequest::new(x, 0, 0, x as usize), 1);
        }

        list.retain(|request, _| request.owner % 2 == 1);
        assert_eq!(list.len(), 2);
        assert!(!list.add(PageRequest::new(3, 0, 0, 3), 1));
        assert!(list.add(PageRequest::new(0, 0, 0, 0), 1));
    }

    #[test]
    fn test_lowest_mip_takes_over_moved_owner_entry() {
        let mut list = RequestList::default();
        let stale = PageRequest::new(0, 0, 3, 0);
        list.add(stale, 2);

        let image = VirtualImage {
            alloc_id: Some(0),
            size: 8,
            mip_count: 4,
            ..Default::default()
        };
        let images = [image, image];

        let moved: FxHashSet<ImageId> = [0].into_iter().collect();
        list.include_lowest_mips(&images, &moved);

        assert_eq!(list.len(), 1);
        let (request, count) = list.get(0).unwrap();
        assert_eq!(request.owner, 1);
        assert_eq!(count, u16::MAX);
    }

    #[test]
    fn test_lowest_mip_keeps_first_live_owner() {
        let mut list = RequestList::default();
        list.add(PageRequest::new(0, 0, 3, 0), 1);

        let image = VirtualImage {
            alloc_id: Some(0),
            size: 8,
            mip_count: 4,
            ..Default::default()
        };
        list.include_lowest_mips(&[image, image], &FxHashSet::default());

        assert_eq!(list.len(), 1);
        assert_eq!(list.get(0).unwrap().0.owner, 0);
    }
}
