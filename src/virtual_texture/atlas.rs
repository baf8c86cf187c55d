use glam::UVec2;

/// Handle of one atlas allocation
pub type AllocId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Free,
    Allocated,
    Split,
    /// Arena slot not part of the tree
    Recycled,
}

#[derive(Debug, Clone, Copy)]
struct AtlasNode {
    x: u32,
    y: u32,
    level: u32,
    parent: Option<u32>,
    children: [u32; 4],
    state: NodeState,
}

/// Quad-tree slab allocator over the indirection coordinate space.
///
/// Hands out square, power-of-two regions aligned to their own size. Nodes
/// live in an arena addressed by index; a node's index is its [`AllocId`]
/// while allocated. Freeing merges four free siblings back into their parent.
#[derive(Debug, Clone)]
pub struct AtlasAllocator {
    root_size: u32,
    nodes: Vec<AtlasNode>,
    recycled: Vec<u32>,
    /// Free leaves per level; level 0 is the whole atlas
    free_by_level: Vec<Vec<u32>>,
}

impl AtlasAllocator {
    pub fn new(root_size: u32) -> Self {
        assert!(root_size.is_power_of_two(), "atlas size {} must be a power of two", root_size);

        let levels = root_size.ilog2() as usize + 1;
        let mut free_by_level = vec![Vec::new(); levels];
        free_by_level[0].push(0);

        Self {
            root_size,
            nodes: vec![AtlasNode {
                x: 0,
                y: 0,
                level: 0,
                parent: None,
                children: [0; 4],
                state: NodeState::Free,
            }],
            recycled: Vec::new(),
            free_by_level,
        }
    }

    pub fn root_size(&self) -> u32 {
        self.root_size
    }

    fn level_for(&self, size: u32) -> Option<u32> {
        if size == 0 || !size.is_power_of_two() || size > self.root_size {
            return None;
        }
        Some((self.root_size / size).ilog2())
    }

    fn size_at(&self, level: u32) -> u32 {
        self.root_size >> level
    }

    /// Allocate a `size` x `size` region, or `None` when no free region fits
    pub fn alloc(&mut self, size: u32) -> Option<AllocId> {
        let target = self.level_for(size)?;

        // Smallest free node that still fits: deepest non-empty level at or above target
        let level = (0..=target).rev().find(|&l| !self.free_by_level[l as usize].is_empty())?;
        let mut node = self.take_free(level)?;

        while self.nodes[node as usize].level < target {
            node = self.split(node);
        }

        self.nodes[node as usize].state = NodeState::Allocated;
        Some(node)
    }

    /// Release an allocation. Returns false for unknown or already free ids.
    pub fn free(&mut self, id: AllocId) -> bool {
        match self.nodes.get(id as usize) {
            Some(node) if node.state == NodeState::Allocated => {}
            _ => {
                log::warn!("[AtlasAllocator::free] Allocation {} is not live", id);
                return false;
            }
        }

        self.nodes[id as usize].state = NodeState::Free;
        let level = self.nodes[id as usize].level as usize;
        self.free_by_level[level].push(id);

        let mut node = id;
        while let Some(parent) = self.nodes[node as usize].parent {
            let children = self.nodes[parent as usize].children;
            if !children.iter().all(|&c| self.nodes[c as usize].state == NodeState::Free) {
                break;
            }

            let child_level = self.nodes[children[0] as usize].level as usize;
            self.free_by_level[child_level].retain(|n| !children.contains(n));
            for child in children {
                self.nodes[child as usize].state = NodeState::Recycled;
                self.recycled.push(child);
            }

            self.nodes[parent as usize].state = NodeState::Free;
            let parent_level = self.nodes[parent as usize].level as usize;
            self.free_by_level[parent_level].push(parent);
            node = parent;
        }

        true
    }

    /// Top-left corner of an allocation in indirection texels
    pub fn texture_coords(&self, id: AllocId) -> Option<UVec2> {
        let node = self.nodes.get(id as usize)?;
        (node.state == NodeState::Allocated).then(|| UVec2::new(node.x, node.y))
    }

    pub fn allocation_size(&self, id: AllocId) -> Option<u32> {
        let node = self.nodes.get(id as usize)?;
        (node.state == NodeState::Allocated).then(|| self.size_at(node.level))
    }

    /// Texels not covered by any allocation
    pub fn free_area(&self) -> u64 {
        self.free_by_level
            .iter()
            .enumerate()
            .map(|(level, nodes)| {
                let size = self.size_at(level as u32) as u64;
                nodes.len() as u64 * size * size
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes[0].state == NodeState::Free
    }

    /// Pop the free node at `level` closest to the atlas origin
    fn take_free(&mut self, level: u32) -> Option<u32> {
        let list = &mut self.free_by_level[level as usize];
        let nodes = &self.nodes;
        let (pos, _) = list
            .iter()
            .enumerate()
            .min_by_key(|&(_, &n)| (nodes[n as usize].y, nodes[n as usize].x))?;
        Some(list.swap_remove(pos))
    }

    /// Split a free node into four children, returning the first one unlisted
    fn split(&mut self, node: u32) -> u32 {
        let AtlasNode { x, y, level, .. } = self.nodes[node as usize];
        let half = self.size_at(level + 1);
        let corners = [(x, y), (x + half, y), (x, y + half), (x + half, y + half)];

        let mut children = [0u32; 4];
        for (slot, (cx, cy)) in children.iter_mut().zip(corners) {
            *slot = self.new_node(AtlasNode {
                x: cx,
                y: cy,
                level: level + 1,
                parent: Some(node),
                children: [0; 4],
                state: NodeState::Free,
            });
        }

        let parent = &mut self.nodes[node as usize];
        parent.children = children;
        parent.state = NodeState::Split;

        self.free_by_level[(level + 1) as usize].extend_from_slice(&children[1..]);
        children[0]
    }

    fn new_node(&mut self, node: AtlasNode) -> u32 {
        match self.recycled.pop() {
            Some(index) => {
                self.nodes[index as usize] = node;
                index
            }
            None => {
                self.nodes.push(node);
                (self.nodes.len() - 1) as u32
            }
        }
    }
}
