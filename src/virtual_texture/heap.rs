/// Binary min-heap over dense element indices.
///
/// Each element index appears at most once and its key can be changed in
/// O(log n) through a position table, so callers address entries by index
/// rather than by heap slot. Ties are broken by the lower element index.
#[derive(Debug, Clone, Default)]
pub struct IndexingBinaryMinHeap {
    heap: Vec<HeapEntry>,
    positions: Vec<Option<usize>>,
}

#[derive(Debug, Clone, Copy)]
struct HeapEntry {
    key: u32,
    index: usize,
}

impl HeapEntry {
    fn less_than(&self, other: &HeapEntry) -> bool {
        (self.key, self.index) < (other.key, other.index)
    }
}

impl IndexingBinaryMinHeap {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
            positions: vec![None; capacity],
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.positions.get(index).copied().flatten().is_some()
    }

    /// Insert `index` with `key`, or re-key it if already present
    pub fn push(&mut self, key: u32, index: usize) {
        if self.contains(index) {
            self.update(key, index);
            return;
        }

        if index >= self.positions.len() {
            self.positions.resize(index + 1, None);
        }

        let pos = self.heap.len();
        self.heap.push(HeapEntry { key, index });
        self.positions[index] = Some(pos);
        self.sift_up(pos);
    }

    /// Element index with the smallest key
    pub fn top(&self) -> Option<usize> {
        self.heap.first().map(|entry| entry.index)
    }

    pub fn top_key(&self) -> Option<u32> {
        self.heap.first().map(|entry| entry.key)
    }

    /// Remove and return the smallest `(key, index)`
    pub fn pop(&mut self) -> Option<(u32, usize)> {
        let top = *self.heap.first()?;
        self.remove(top.index);
        Some((top.key, top.index))
    }

    pub fn key(&self, index: usize) -> Option<u32> {
        let pos = self.positions.get(index).copied().flatten()?;
        Some(self.heap[pos].key)
    }

    /// Change the key of `index`, inserting it when absent
    pub fn update(&mut self, key: u32, index: usize) {
        let Some(pos) = self.positions.get(index).copied().flatten() else {
            self.push(key, index);
            return;
        };

        let old = self.heap[pos].key;
        self.heap[pos].key = key;

        if key < old {
            self.sift_up(pos);
        } else {
            self.sift_down(pos);
        }
    }

    /// Remove `index`, returning its key
    pub fn remove(&mut self, index: usize) -> Option<u32> {
        let pos = self.positions.get(index).copied().flatten()?;
        let last = self.heap.len() - 1;

        self.swap(pos, last);
        let removed = self.heap.pop()?;
        self.positions[removed.index] = None;

        if pos < self.heap.len() {
            self.sift_down(pos);
            self.sift_up(pos);
        }

        Some(removed.key)
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.positions.iter_mut().for_each(|p| *p = None);
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }

        self.heap.swap(a, b);
        self.positions[self.heap[a].index] = Some(a);
        self.positions[self.heap[b].index] = Some(b);
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.heap[pos].less_than(&self.heap[parent]) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let left = pos * 2 + 1;
            let right = left + 1;
            let mut smallest = pos;

            if left < len && self.heap[left].less_than(&self.heap[smallest]) {
                smallest = left;
            }
            if right < len && self.heap[right].less_than(&self.heap[smallest]) {
                smallest = right;
            }
            if smallest == pos {
                break;
            }

            self.swap(pos, smallest);
            pos = smallest;
        }
    }
}
