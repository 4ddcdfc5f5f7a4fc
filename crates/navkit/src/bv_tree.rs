//! Per-tile bounding volume tree over polygon bounds
//!
//! The tree is stored as a flat array in depth-first order. Leaf nodes carry
//! a polygon index (`i >= 0`); internal nodes carry the negated node count of
//! their subtree (the escape offset) so a query can skip a whole subtree with
//! a single jump. Bounds are quantized to `u16` relative to the tile's minimum
//! corner.

use navkit_common::overlap_quant_bounds;

/// Bounding volume node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct BVNode {
    /// Quantized minimum bounds
    pub bmin: [u16; 3],
    /// Quantized maximum bounds
    pub bmax: [u16; 3],
    /// Polygon index for leaves, negative escape offset for internal nodes
    pub i: i32,
}

impl BVNode {
    pub fn is_leaf(&self) -> bool {
        self.i >= 0
    }
}

/// Quantizes world-space bounds relative to `origin`
///
/// Minimums round down and maximums round up so the quantized box always
/// contains the original one.
pub fn quantize_bounds(
    bmin: &[f32; 3],
    bmax: &[f32; 3],
    origin: &[f32; 3],
    quant_factor: f32,
) -> ([u16; 3], [u16; 3]) {
    let mut qmin = [0u16; 3];
    let mut qmax = [0u16; 3];
    for k in 0..3 {
        let lo = ((bmin[k] - origin[k]) * quant_factor).floor();
        let hi = ((bmax[k] - origin[k]) * quant_factor).ceil();
        qmin[k] = lo.clamp(0.0, 65535.0) as u16;
        qmax[k] = hi.clamp(0.0, 65535.0) as u16;
    }
    (qmin, qmax)
}

struct BuildItem {
    bmin: [u16; 3],
    bmax: [u16; 3],
    poly: i32,
}

/// Builds a tree over the given polygon bounds
///
/// `poly_bounds[i]` are the world-space bounds of polygon `i`. Polygons with
/// an inverted box are left out of the tree.
pub fn build_bv_tree(
    poly_bounds: &[([f32; 3], [f32; 3])],
    tile_bmin: &[f32; 3],
    quant_factor: f32,
) -> Vec<BVNode> {
    let mut items: Vec<BuildItem> = poly_bounds
        .iter()
        .enumerate()
        .filter(|(_, (bmin, bmax))| (0..3).all(|k| bmin[k] <= bmax[k]))
        .map(|(i, (bmin, bmax))| {
            let (qmin, qmax) = quantize_bounds(bmin, bmax, tile_bmin, quant_factor);
            BuildItem {
                bmin: qmin,
                bmax: qmax,
                poly: i as i32,
            }
        })
        .collect();

    let mut nodes = Vec::with_capacity(items.len() * 2);
    if !items.is_empty() {
        subdivide(&mut items, &mut nodes);
    }
    nodes
}

fn subdivide(items: &mut [BuildItem], nodes: &mut Vec<BVNode>) {
    let icur = nodes.len();

    if items.len() == 1 {
        nodes.push(BVNode {
            bmin: items[0].bmin,
            bmax: items[0].bmax,
            i: items[0].poly,
        });
        return;
    }

    let mut bmin = items[0].bmin;
    let mut bmax = items[0].bmax;
    for it in items.iter().skip(1) {
        for k in 0..3 {
            bmin[k] = bmin[k].min(it.bmin[k]);
            bmax[k] = bmax[k].max(it.bmax[k]);
        }
    }
    nodes.push(BVNode { bmin, bmax, i: 0 });

    // Median split along the longest axis
    let extent = [
        bmax[0] - bmin[0],
        bmax[1] - bmin[1],
        bmax[2] - bmin[2],
    ];
    let mut axis = 0;
    if extent[1] > extent[axis] {
        axis = 1;
    }
    if extent[2] > extent[axis] {
        axis = 2;
    }
    items.sort_by_key(|it| (it.bmin[axis], it.poly));

    let split = items.len() / 2;
    let (left, right) = items.split_at_mut(split);
    subdivide(left, nodes);
    subdivide(right, nodes);

    let escape = (nodes.len() - icur) as i32;
    nodes[icur].i = -escape;
}

/// Lazy iterator over the polygons whose tree leaves overlap a box
pub struct BVQueryIter<'a> {
    nodes: &'a [BVNode],
    cur: usize,
    qmin: [u16; 3],
    qmax: [u16; 3],
}

impl<'a> BVQueryIter<'a> {
    /// Starts a query for world-space bounds against a tile's tree
    pub fn new(
        nodes: &'a [BVNode],
        tile_bmin: &[f32; 3],
        tile_bmax: &[f32; 3],
        quant_factor: f32,
        qmin: &[f32; 3],
        qmax: &[f32; 3],
    ) -> Self {
        let mut bmin = [0u16; 3];
        let mut bmax = [0u16; 3];
        for k in 0..3 {
            let lo = qmin[k].clamp(tile_bmin[k], tile_bmax[k]) - tile_bmin[k];
            let hi = qmax[k].clamp(tile_bmin[k], tile_bmax[k]) - tile_bmin[k];
            bmin[k] = ((quant_factor * lo) as u16) & 0xfffe;
            bmax[k] = ((quant_factor * hi + 1.0) as u16) | 1;
        }
        Self {
            nodes,
            cur: 0,
            qmin: bmin,
            qmax: bmax,
        }
    }
}

impl Iterator for BVQueryIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while let Some(node) = self.nodes.get(self.cur) {
            let overlap = overlap_quant_bounds(&self.qmin, &self.qmax, &node.bmin, &node.bmax);
            let leaf = node.is_leaf();

            if overlap || leaf {
                self.cur += 1;
            } else {
                self.cur += (-node.i) as usize;
            }

            if leaf && overlap {
                return Some(node.i as usize);
            }
        }
        None
    }
}
