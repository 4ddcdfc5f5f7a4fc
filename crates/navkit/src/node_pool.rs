//! Node pool and open list for A* search
//!

use std::collections::HashMap;

use super::PolyRef;

bitflags::bitflags! {
    /// Search state of a node
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeFlags: u8 {
        const OPEN = 0x01;
        const CLOSED = 0x02;
    }
}

/// Index of a node inside its pool
pub type NodeIndex = usize;

/// Default search node budget of a query
pub const DEFAULT_MAX_NODES: usize = 2048;

/// Search node for one polygon
#[derive(Debug, Clone)]
pub struct Node {
    /// Position the polygon was entered at
    pub pos: [f32; 3],
    /// Cost from the start to this node
    pub cost: f32,
    /// Cost plus heuristic
    pub total: f32,
    /// Node this one was reached from
    pub parent: Option<NodeIndex>,
    pub flags: NodeFlags,
    /// Polygon the node stands for
    pub id: PolyRef,
    /// Insertion stamp; among equal totals the newest entry pops first
    pub order: u64,
}

impl Node {
    fn new(id: PolyRef) -> Self {
        Self {
            pos: [0.0; 3],
            cost: 0.0,
            total: 0.0,
            parent: None,
            flags: NodeFlags::empty(),
            id,
            order: 0,
        }
    }
}

/// Fixed-capacity store of search nodes keyed by polygon
#[derive(Debug)]
pub struct NodePool {
    nodes: Vec<Node>,
    lookup: HashMap<PolyRef, NodeIndex>,
    max_nodes: usize,
}

impl NodePool {
    pub fn new(max_nodes: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(max_nodes),
            lookup: HashMap::with_capacity(max_nodes),
            max_nodes,
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.lookup.clear();
    }

    /// Gets the node for a polygon, allocating it on first use
    ///
    /// Returns `None` when the pool is exhausted.
    pub fn get_node(&mut self, id: PolyRef) -> Option<NodeIndex> {
        if let Some(&idx) = self.lookup.get(&id) {
            return Some(idx);
        }
        if self.nodes.len() >= self.max_nodes {
            return None;
        }
        let idx = self.nodes.len();
        self.nodes.push(Node::new(id));
        self.lookup.insert(id, idx);
        Some(idx)
    }

    pub fn find_node(&self, id: PolyRef) -> Option<NodeIndex> {
        self.lookup.get(&id).copied()
    }

    pub fn node(&self, idx: NodeIndex) -> &Node {
        &self.nodes[idx]
    }

    pub fn node_mut(&mut self, idx: NodeIndex) -> &mut Node {
        &mut self.nodes[idx]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }

    pub fn is_full(&self) -> bool {
        self.nodes.len() >= self.max_nodes
    }
}

/// Indexed binary min-heap over pool nodes
///
/// Ordered by `total`, then by newest `order` first.
#[derive(Debug, Default)]
pub struct NodeQueue {
    heap: Vec<NodeIndex>,
    /// Heap slot of each node, `usize::MAX` when not queued
    slots: Vec<usize>,
}

impl NodeQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
        }
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.slots.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn contains(&self, idx: NodeIndex) -> bool {
        self.slots.get(idx).is_some_and(|&s| s != usize::MAX)
    }

    pub fn top(&self) -> Option<NodeIndex> {
        self.heap.first().copied()
    }

    pub fn push(&mut self, idx: NodeIndex, pool: &NodePool) {
        if self.contains(idx) {
            self.modify(idx, pool);
            return;
        }
        if self.slots.len() <= idx {
            self.slots.resize(idx + 1, usize::MAX);
        }
        self.heap.push(idx);
        let i = self.heap.len() - 1;
        self.slots[idx] = i;
        self.bubble_up(i, pool);
    }

    pub fn pop(&mut self, pool: &NodePool) -> Option<NodeIndex> {
        let top = *self.heap.first()?;
        let last = self.heap.len() - 1;
        self.swap(0, last);
        self.heap.pop();
        self.slots[top] = usize::MAX;
        if !self.heap.is_empty() {
            self.trickle_down(0, pool);
        }
        Some(top)
    }

    /// Restores heap order after a node's key decreased
    pub fn modify(&mut self, idx: NodeIndex, pool: &NodePool) {
        if let Some(&i) = self.slots.get(idx) {
            if i != usize::MAX {
                self.bubble_up(i, pool);
            }
        }
    }

    fn before(a: &Node, b: &Node) -> bool {
        a.total < b.total || (a.total == b.total && a.order > b.order)
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.slots[self.heap[i]] = i;
        self.slots[self.heap[j]] = j;
    }

    fn bubble_up(&mut self, mut i: usize, pool: &NodePool) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if !Self::before(pool.node(self.heap[i]), pool.node(self.heap[parent])) {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    fn trickle_down(&mut self, mut i: usize, pool: &NodePool) {
        let n = self.heap.len();
        loop {
            let left = 2 * i + 1;
            let right = left + 1;
            let mut best = i;
            if left < n && Self::before(pool.node(self.heap[left]), pool.node(self.heap[best])) {
                best = left;
            }
            if right < n && Self::before(pool.node(self.heap[right]), pool.node(self.heap[best])) {
                best = right;
            }
            if best == i {
                break;
            }
            self.swap(i, best);
            i = best;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_pool_capacity() {
        let mut pool = NodePool::new(2);
        let a = pool.get_node(PolyRef::new(10));
        let b = pool.get_node(PolyRef::new(20));
        assert!(a.is_some() && b.is_some());
        assert_eq!(pool.get_node(PolyRef::new(10)), a);
        assert!(pool.is_full());
        assert_eq!(pool.get_node(PolyRef::new(30)), None);
        assert_eq!(pool.find_node(PolyRef::new(20)), b);

        pool.clear();
        assert_eq!(pool.node_count(), 0);
        assert_eq!(pool.find_node(PolyRef::new(10)), None);
    }

    fn node_with(pool: &mut NodePool, id: u32, total: f32, order: u64) -> NodeIndex {
        let idx = pool.get_node(PolyRef::new(id)).expect("pool capacity");
        let node = pool.node_mut(idx);
        node.total = total;
        node.order = order;
        idx
    }

    #[test]
    fn test_queue_orders_by_total() {
        let mut pool = NodePool::new(8);
        let mut queue = NodeQueue::new(8);
        for (i, total) in [5.0, 1.0, 4.0, 2.0, 3.0].into_iter().enumerate() {
            let idx = node_with(&mut pool, i as u32 + 1, total, i as u64);
            queue.push(idx, &pool);
        }
        let mut totals = Vec::new();
        while let Some(idx) = queue.pop(&pool) {
            totals.push(pool.node(idx).total);
        }
        assert_eq!(totals, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_queue_prefers_newest_on_ties() {
        let mut pool = NodePool::new(4);
        let mut queue = NodeQueue::new(4);
        let first = node_with(&mut pool, 1, 2.0, 0);
        let second = node_with(&mut pool, 2, 2.0, 1);
        queue.push(first, &pool);
        queue.push(second, &pool);
        assert_eq!(queue.pop(&pool), Some(second));
        assert_eq!(queue.pop(&pool), Some(first));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_modify_rekeys() {
        let mut pool = NodePool::new(4);
        let mut queue = NodeQueue::new(4);
        let a = node_with(&mut pool, 1, 1.0, 0);
        let b = node_with(&mut pool, 2, 5.0, 1);
        queue.push(a, &pool);
        queue.push(b, &pool);
        assert!(queue.contains(b));

        pool.node_mut(b).total = 0.5;
        queue.modify(b, &pool);
        assert_eq!(queue.top(), Some(b));
        assert_eq!(queue.pop(&pool), Some(b));
        assert!(!queue.contains(b));
        assert_eq!(queue.len(), 1);
    }
}
