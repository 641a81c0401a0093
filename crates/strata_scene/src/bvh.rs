//! Bounding-volume hierarchy over fragment boxes
//!
//! Flattened node array plus a permuted primitive list, median-split on
//! the widest centroid axis. The index is a derived artifact: any
//! placement change after a build requires a full rebuild, never a
//! patch, since every primitive box may shift non-uniformly.

use serde::{Deserialize, Serialize};

use crate::bounds::Aabb;
use crate::fragment::FragmentId;
use crate::transfer::{IndexTransfer, NodeTransfer};

/// Build options for the spatial index
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct IndexOptions {
    /// Maximum primitives per leaf
    pub max_leaf_size: u32,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self { max_leaf_size: 8 }
    }
}

/// One flattened node. Internal nodes store child indices in
/// `left`/`right`; leaves store the first primitive index and count.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BvhNode {
    pub min: [f32; 3],
    pub max: [f32; 3],
    pub left: u32,
    pub right: u32,
    pub flags: u32,
}

impl BvhNode {
    pub const LEAF: u32 = 1 << 0;
    /// Set when the subtree holds transparent primitives, so the
    /// renderer can draw-order them separately
    pub const TRANSPARENT: u32 = 1 << 1;

    pub fn is_leaf(&self) -> bool {
        self.flags & Self::LEAF != 0
    }

    pub fn has_transparency(&self) -> bool {
        self.flags & Self::TRANSPARENT != 0
    }

    pub fn bounds(&self) -> Aabb {
        Aabb::new(self.min.into(), self.max.into())
    }
}

/// Input primitive: one fragment's world-space box plus its material's
/// transparency classification (supplied by the materials block, never
/// recomputed here)
#[derive(Clone, Debug)]
pub struct BvhPrimitive {
    pub fragment: FragmentId,
    pub bounds: Aabb,
    pub transparent: bool,
}

/// A built spatial index
#[derive(Clone, Debug)]
pub struct Bvh {
    pub nodes: Vec<BvhNode>,
    pub primitives: Vec<FragmentId>,
}

impl Bvh {
    /// Build from primitive boxes by recursive median split
    pub fn build(primitives: &[BvhPrimitive], options: &IndexOptions) -> Self {
        let max_leaf = options.max_leaf_size.max(1) as usize;
        let mut nodes = Vec::new();
        let mut order: Vec<u32> = (0..primitives.len() as u32).collect();

        if primitives.is_empty() {
            nodes.push(BvhNode {
                min: [0.0; 3],
                max: [0.0; 3],
                left: 0,
                right: 0,
                flags: BvhNode::LEAF,
            });
        } else {
            build_range(primitives, &mut order, 0, &mut nodes, max_leaf);
        }

        let primitives = order
            .into_iter()
            .map(|i| primitives[i as usize].fragment)
            .collect();
        Self { nodes, primitives }
    }

    /// Accept an index the decode worker already built
    pub fn from_transfer(transfer: &IndexTransfer) -> Self {
        Self {
            nodes: transfer
                .nodes
                .iter()
                .map(|n| BvhNode {
                    min: n.min,
                    max: n.max,
                    left: n.left,
                    right: n.right,
                    flags: n.flags,
                })
                .collect(),
            primitives: transfer
                .primitives
                .iter()
                .map(|&id| FragmentId::new(id))
                .collect(),
        }
    }

    pub fn to_transfer(&self) -> IndexTransfer {
        IndexTransfer {
            nodes: self
                .nodes
                .iter()
                .map(|n| NodeTransfer {
                    min: n.min,
                    max: n.max,
                    left: n.left,
                    right: n.right,
                    flags: n.flags,
                })
                .collect(),
            primitives: self.primitives.iter().map(|id| id.raw()).collect(),
        }
    }

    pub fn root_bounds(&self) -> Aabb {
        self.nodes
            .first()
            .map(|n| n.bounds())
            .unwrap_or(Aabb::EMPTY)
    }

    /// Fragments stored in a leaf, opaque entries first
    pub fn leaf_fragments(&self, node: &BvhNode) -> &[FragmentId] {
        debug_assert!(node.is_leaf());
        let first = node.left as usize;
        &self.primitives[first..first + node.right as usize]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn primitive_count(&self) -> usize {
        self.primitives.len()
    }
}

fn range_bounds(primitives: &[BvhPrimitive], order: &[u32]) -> Aabb {
    let mut bounds = Aabb::EMPTY;
    for &i in order {
        bounds = bounds.union(&primitives[i as usize].bounds);
    }
    bounds
}

fn build_range(
    primitives: &[BvhPrimitive],
    order: &mut [u32],
    base: u32,
    nodes: &mut Vec<BvhNode>,
    max_leaf: usize,
) -> u32 {
    let bounds = range_bounds(primitives, order);

    if order.len() <= max_leaf {
        // Opaque primitives first so the renderer can split the range.
        order.sort_by_key(|&i| primitives[i as usize].transparent);
        let transparent = order
            .iter()
            .any(|&i| primitives[i as usize].transparent);
        let mut flags = BvhNode::LEAF;
        if transparent {
            flags |= BvhNode::TRANSPARENT;
        }
        let index = nodes.len() as u32;
        nodes.push(BvhNode {
            min: bounds.min.to_array(),
            max: bounds.max.to_array(),
            left: base,
            right: order.len() as u32,
            flags,
        });
        return index;
    }

    let axis = {
        let mut centroid_bounds = Aabb::EMPTY;
        for &i in order.iter() {
            centroid_bounds = centroid_bounds.expand(primitives[i as usize].bounds.center());
        }
        centroid_bounds.longest_axis()
    };
    order.sort_unstable_by(|&a, &b| {
        let ca = primitives[a as usize].bounds.center()[axis];
        let cb = primitives[b as usize].bounds.center()[axis];
        ca.partial_cmp(&cb).unwrap_or(std::cmp::Ordering::Equal)
    });

    let mid = order.len() / 2;
    let index = nodes.len() as u32;
    nodes.push(BvhNode {
        min: bounds.min.to_array(),
        max: bounds.max.to_array(),
        left: 0,
        right: 0,
        flags: 0,
    });

    let (lo, hi) = order.split_at_mut(mid);
    let left = build_range(primitives, lo, base, nodes, max_leaf);
    let right = build_range(primitives, hi, base + mid as u32, nodes, max_leaf);

    let child_flags =
        (nodes[left as usize].flags | nodes[right as usize].flags) & BvhNode::TRANSPARENT;
    let node = &mut nodes[index as usize];
    node.left = left;
    node.right = right;
    node.flags |= child_flags;
    index
}
