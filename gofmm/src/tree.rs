use std::collections::{BTreeSet, HashMap};

use hartree_linalg::{Matrix, Scalar};
use parking_lot::Mutex;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use tracing::debug;

use crate::SpdMatrix;

// NODE ID
// ================================================================================================

/// Arena index of a tree node.
///
/// Nodes reference parents, children, and interaction partners by id; the
/// arena owns every node, so the parent/child cycles of the tree never turn
/// into ownership cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl NodeId {
    fn new(idx: usize) -> Self {
        Self(idx as u32)
    }

    pub fn from_usize(idx: usize) -> Self {
        Self::new(idx)
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

// MORTON CODES
// ================================================================================================

/// Bits reserved for the level in the low end of a Morton code.
const MORTON_LEVEL_BITS: u32 = 6;
const MORTON_LEVEL_MASK: u64 = (1 << MORTON_LEVEL_BITS) - 1;
/// Bits available for the root-to-node path, MSB-aligned.
const MORTON_PATH_BITS: u32 = 64 - MORTON_LEVEL_BITS;

/// Morton code of a child: the parent's root-to-node path extended by one
/// branch bit, with the level kept in the low bits.
///
/// Path bits are MSB-aligned (the depth-1 branch is the highest bit), so a
/// plain integer comparison of two codes whose nodes do not contain each
/// other orders them left-to-right across levels. The symmetric far-list
/// tie-break depends on that property: all targets below one sibling must
/// agree on keep-vs-skip for the far-list merge to lift shared members.
fn morton_child(parent: u64, branch: u64) -> u64 {
    let level = parent & MORTON_LEVEL_MASK;
    let path = parent >> MORTON_LEVEL_BITS;
    let child_path = path | branch << (MORTON_PATH_BITS as u64 - 1 - level);
    (child_path << MORTON_LEVEL_BITS) | (level + 1)
}

/// Whether the node coded `a` is an ancestor of (or equal to) the node coded
/// `b`: `a`'s path must be a prefix of `b`'s.
pub(crate) fn morton_is_ancestor(a: u64, b: u64) -> bool {
    let la = a & MORTON_LEVEL_MASK;
    let lb = b & MORTON_LEVEL_MASK;
    let shift = MORTON_PATH_BITS as u64 - la;
    la <= lb && (b >> MORTON_LEVEL_BITS) >> shift == (a >> MORTON_LEVEL_BITS) >> shift
}

// NODE DATA
// ================================================================================================

/// Per-node compression state.
///
/// `skels`/`proj` are written once by the node's skeletonization task;
/// `w_skel`/`u_skel` are rebuilt per right-hand-side batch. The interaction
/// sets sit behind per-node locks so the symbolic traversals can insert from
/// concurrent tasks.
#[derive(Debug)]
pub struct NodeData<T> {
    pub isskel: bool,
    pub skels: Vec<usize>,
    pub proj: Matrix<T>,
    pub w_skel: Matrix<T>,
    pub u_skel: Matrix<T>,

    pub near: Mutex<BTreeSet<NodeId>>,
    pub far: Mutex<BTreeSet<NodeId>>,
    pub nn_near: Mutex<BTreeSet<NodeId>>,
    pub nn_far: Mutex<BTreeSet<NodeId>>,

    pub near_ids: Mutex<BTreeSet<usize>>,
    pub far_ids: Mutex<BTreeSet<usize>>,
    pub nn_near_ids: Mutex<BTreeSet<usize>>,
    pub nn_far_ids: Mutex<BTreeSet<usize>>,
}

impl<T: Scalar> NodeData<T> {
    fn new() -> Self {
        Self {
            isskel: false,
            skels: Vec::new(),
            proj: Matrix::zeros(0, 0),
            w_skel: Matrix::zeros(0, 0),
            u_skel: Matrix::zeros(0, 0),
            near: Mutex::new(BTreeSet::new()),
            far: Mutex::new(BTreeSet::new()),
            nn_near: Mutex::new(BTreeSet::new()),
            nn_far: Mutex::new(BTreeSet::new()),
            near_ids: Mutex::new(BTreeSet::new()),
            far_ids: Mutex::new(BTreeSet::new()),
            nn_near_ids: Mutex::new(BTreeSet::new()),
            nn_far_ids: Mutex::new(BTreeSet::new()),
        }
    }
}

// TREE NODE
// ================================================================================================

#[derive(Debug)]
pub struct TreeNode<T> {
    pub id: NodeId,
    pub level: usize,
    /// Breadth-first position, stable across runs with the same seed.
    pub treelist_id: usize,
    pub morton: u64,
    pub parent: Option<NodeId>,
    pub kids: Option<[NodeId; 2]>,
    /// Indices owned by this subtree, in permuted order.
    pub lids: Vec<usize>,
    /// Start of this subtree's range in the permuted ordering.
    pub offset: usize,
    pub data: NodeData<T>,
}

impl<T> TreeNode<T> {
    pub fn is_leaf(&self) -> bool {
        self.kids.is_none()
    }

    pub fn num_points(&self) -> usize {
        self.lids.len()
    }
}

// SPLITTERS
// ================================================================================================

/// The seam the tree construction is generic over: a rule that partitions a
/// node's index set in two.
pub trait Splitter<T: Scalar, K: SpdMatrix<T>> {
    fn split(&self, kmat: &K, lids: &[usize], rng: &mut SmallRng) -> [Vec<usize>; 2];
}

/// The SPD-geometry-oblivious center split: project every index onto the
/// axis between an approximate farthest-from-centroid point and the point
/// farthest from it, and cut at the median projection.
#[derive(Debug, Clone, Copy, Default)]
pub struct CenterSplit;

impl<T: Scalar, K: SpdMatrix<T>> Splitter<T, K> for CenterSplit {
    fn split(&self, kmat: &K, lids: &[usize], rng: &mut SmallRng) -> [Vec<usize>; 2] {
        let n = lids.len();
        let two = T::from_f64(2.0).unwrap();
        let n_samples = ((n as f64).ln().ceil() as usize).max(1);

        // Approximate squared distance to the centroid by subsampling.
        let mut temp: Vec<T> = Vec::with_capacity(n);
        for &i in lids {
            let mut d = kmat.entry(i, i);
            for _ in 0..n_samples {
                let j = lids[rng.random_range(0..n)];
                d = d - two * kmat.entry(i, j);
            }
            temp.push(d);
        }
        let idf2c = lids[argmax(&temp)];

        // Farthest from the farthest-from-centroid point.
        for (slot, &i) in temp.iter_mut().zip(lids.iter()) {
            *slot = kmat.entry(i, i) - two * kmat.entry(i, idf2c);
        }
        let idf2f = lids[argmax(&temp)];

        let projection: Vec<T> =
            lids.iter().map(|&i| kmat.entry(i, idf2f) - kmat.entry(i, idf2c)).collect();
        partition_by_median(lids, &projection)
    }
}

/// The randomized-tree splitter: the same median cut along the axis between
/// two distinct uniformly drawn points.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomSplit;

impl<T: Scalar, K: SpdMatrix<T>> Splitter<T, K> for RandomSplit {
    fn split(&self, kmat: &K, lids: &[usize], rng: &mut SmallRng) -> [Vec<usize>; 2] {
        let n = lids.len();
        let idf2c = lids[rng.random_range(0..n)];
        let mut idf2f = lids[rng.random_range(0..n)];
        while idf2f == idf2c {
            idf2f = lids[rng.random_range(0..n)];
        }

        let projection: Vec<T> =
            lids.iter().map(|&i| kmat.entry(i, idf2f) - kmat.entry(i, idf2c)).collect();
        partition_by_median(lids, &projection)
    }
}

fn argmax<T: Scalar>(values: &[T]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

/// Cuts `lids` at the median of `values`. Ties on the median can starve one
/// side (constant projections do); an even split by position keeps the
/// recursion terminating.
fn partition_by_median<T: Scalar>(lids: &[usize], values: &[T]) -> [Vec<usize>; 2] {
    let n = lids.len();
    let median = select_kth(values.to_vec(), n / 2);

    let mut left = Vec::with_capacity(n / 2 + 1);
    let mut right = Vec::with_capacity(n / 2 + 1);
    for (&lid, &v) in lids.iter().zip(values.iter()) {
        if v > median {
            right.push(lid);
        } else {
            left.push(lid);
        }
    }

    if left.is_empty() || right.is_empty() {
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| values[a].partial_cmp(&values[b]).unwrap());
        left = order[..n / 2].iter().map(|&i| lids[i]).collect();
        right = order[n / 2..].iter().map(|&i| lids[i]).collect();
    }

    [left, right]
}

/// Expected-linear-time selection of the `k`-th smallest value.
pub(crate) fn select_kth<T: Scalar>(mut values: Vec<T>, mut k: usize) -> T {
    loop {
        if values.len() == 1 {
            return values[0];
        }
        // Median-of-three pivot.
        let (lo, mid, hi) = (0, values.len() / 2, values.len() - 1);
        let mut trio = [values[lo], values[mid], values[hi]];
        trio.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let pivot = trio[1];

        let less: Vec<T> = values.iter().copied().filter(|&v| v < pivot).collect();
        let equal = values.iter().filter(|&&v| v == pivot).count();

        if k < less.len() {
            values = less;
        } else if k < less.len() + equal {
            return pivot;
        } else {
            k -= less.len() + equal;
            values.retain(|&v| v > pivot);
        }
    }
}

// TREE
// ================================================================================================

/// The binary partition tree over an SPD matrix's index set.
///
/// Nodes live in an arena indexed by [`NodeId`]; `levels` and `leaves` hold
/// ids in left-to-right order, and the Morton tables give O(1) point-to-leaf
/// and ancestry lookups.
#[derive(Debug)]
pub struct Tree<T> {
    nodes: Vec<TreeNode<T>>,
    levels: Vec<Vec<NodeId>>,
    leaves: Vec<NodeId>,
    morton_to_leaf: HashMap<u64, NodeId>,
    point_morton: Vec<u64>,
}

impl<T: Scalar> Tree<T> {
    /// Recursively partitions `0..kmat.size()` until every node holds at
    /// most `leaf_size` indices.
    pub fn build<K, S>(kmat: &K, splitter: &S, leaf_size: usize, seed: u64) -> Self
    where
        K: SpdMatrix<T>,
        S: Splitter<T, K>,
    {
        let n = kmat.size();
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut tree = Self {
            nodes: Vec::new(),
            levels: Vec::new(),
            leaves: Vec::new(),
            morton_to_leaf: HashMap::new(),
            point_morton: vec![0; n],
        };

        let all: Vec<usize> = (0..n).collect();
        tree.grow(kmat, splitter, all, leaf_size, 0, 0, None, &mut rng);
        tree.finish();
        debug!(n, depth = tree.depth(), leaves = tree.leaves.len(), "tree built");
        tree
    }

    #[allow(clippy::too_many_arguments)]
    fn grow<K, S>(
        &mut self,
        kmat: &K,
        splitter: &S,
        lids: Vec<usize>,
        leaf_size: usize,
        level: usize,
        morton: u64,
        parent: Option<NodeId>,
        rng: &mut SmallRng,
    ) -> NodeId
    where
        K: SpdMatrix<T>,
        S: Splitter<T, K>,
    {
        let id = NodeId::new(self.nodes.len());
        self.nodes.push(TreeNode {
            id,
            level,
            treelist_id: 0,
            morton,
            parent,
            kids: None,
            lids,
            offset: 0,
            data: NodeData::new(),
        });

        if self.nodes[id.as_usize()].lids.len() > leaf_size {
            let split = {
                let lids = &self.nodes[id.as_usize()].lids;
                splitter.split(kmat, lids, rng)
            };
            let [left, right] = split;
            let l = self.grow(
                kmat,
                splitter,
                left,
                leaf_size,
                level + 1,
                morton_child(morton, 0),
                Some(id),
                rng,
            );
            let r = self.grow(
                kmat,
                splitter,
                right,
                leaf_size,
                level + 1,
                morton_child(morton, 1),
                Some(id),
                rng,
            );
            self.nodes[id.as_usize()].kids = Some([l, r]);
        }
        id
    }

    /// Fills the level tables, leaf ordering, offsets, Morton lookups, and
    /// breadth-first treelist ids after the recursive build.
    fn finish(&mut self) {
        // Depth-first left-to-right walk for levels, leaves, and offsets.
        let mut stack = vec![self.root()];
        let mut offset = 0;
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = stack.pop() {
            order.push(id);
            let node = &self.nodes[id.as_usize()];
            let level = node.level;
            if self.levels.len() <= level {
                self.levels.resize(level + 1, Vec::new());
            }
            self.levels[level].push(id);

            if let Some([l, r]) = node.kids {
                stack.push(r);
                stack.push(l);
            } else {
                self.leaves.push(id);
            }
        }
        for id in order {
            let node = &mut self.nodes[id.as_usize()];
            if node.is_leaf() {
                node.offset = offset;
                offset += node.lids.len();
                let morton = node.morton;
                let lids = node.lids.clone();
                self.morton_to_leaf.insert(morton, id);
                for lid in lids {
                    self.point_morton[lid] = morton;
                }
            }
        }
        // Internal offsets are the left child's.
        for l in (0..self.levels.len()).rev() {
            for &id in &self.levels[l].clone() {
                if let Some([left, _]) = self.nodes[id.as_usize()].kids {
                    self.nodes[id.as_usize()].offset = self.nodes[left.as_usize()].offset;
                }
            }
        }
        // Breadth-first treelist numbering.
        let mut next = 0;
        for level in &self.levels {
            for &id in level {
                self.nodes[id.as_usize()].treelist_id = next;
                next += 1;
            }
        }
    }

    // ACCESSORS
    // --------------------------------------------------------------------------------------------

    pub fn root(&self) -> NodeId {
        NodeId::new(0)
    }

    pub fn node(&self, id: NodeId) -> &TreeNode<T> {
        &self.nodes[id.as_usize()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut TreeNode<T> {
        &mut self.nodes[id.as_usize()]
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_points(&self) -> usize {
        self.point_morton.len()
    }

    /// Deepest level index.
    pub fn depth(&self) -> usize {
        self.levels.len() - 1
    }

    /// Node ids at `level`, left to right.
    pub fn level(&self, level: usize) -> &[NodeId] {
        &self.levels[level]
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Leaf ids, left to right.
    pub fn leaves(&self) -> &[NodeId] {
        &self.leaves
    }

    /// The leaf owning point `gid`, via the Morton table.
    pub fn leaf_of_point(&self, gid: usize) -> NodeId {
        self.morton_to_leaf[&self.point_morton[gid]]
    }

    /// Morton code of the leaf owning point `gid`.
    pub fn point_morton(&self, gid: usize) -> u64 {
        self.point_morton[gid]
    }

    /// Whether `node` is `inner` or one of its ancestors.
    pub fn contains_node(&self, node: NodeId, inner: NodeId) -> bool {
        morton_is_ancestor(self.node(node).morton, self.node(inner).morton)
    }

    /// Whether point `gid` lies in `node`'s subtree.
    pub fn contains_point(&self, node: NodeId, gid: usize) -> bool {
        morton_is_ancestor(self.node(node).morton, self.point_morton[gid])
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::DenseSpd;

    fn sample_tree(n: usize, leaf_size: usize) -> Tree<f64> {
        let k = DenseSpd::rand(n, 42);
        Tree::build(&k, &CenterSplit, leaf_size, 7)
    }

    #[test]
    fn partition_invariant_holds_everywhere() {
        let tree = sample_tree(128, 16);
        for id in (0..tree.num_nodes()).map(|i| NodeId(i as u32)) {
            let node = tree.node(id);
            if let Some([l, r]) = node.kids {
                let mut union: Vec<usize> = tree.node(l).lids.clone();
                union.extend(&tree.node(r).lids);
                let mut expect = node.lids.clone();
                union.sort_unstable();
                expect.sort_unstable();
                assert_eq!(union, expect);

                let lset: BTreeSet<usize> = tree.node(l).lids.iter().copied().collect();
                assert!(tree.node(r).lids.iter().all(|lid| !lset.contains(lid)));
            }
        }
    }

    #[test]
    fn leaf_sizes_respect_the_bound() {
        let tree = sample_tree(200, 32);
        for &leaf in tree.leaves() {
            assert!(tree.node(leaf).num_points() <= 32);
            assert!(tree.node(leaf).num_points() > 0);
        }
    }

    #[test]
    fn whole_set_in_one_leaf_when_leaf_size_covers_n() {
        let tree = sample_tree(64, 64);
        assert_eq!(tree.num_nodes(), 1);
        assert_eq!(tree.depth(), 0);
        assert!(tree.node(tree.root()).is_leaf());
    }

    #[test]
    fn morton_lookup_finds_the_owning_leaf() {
        let tree = sample_tree(128, 16);
        for gid in 0..128 {
            let leaf = tree.leaf_of_point(gid);
            assert!(tree.node(leaf).lids.contains(&gid));
            assert!(tree.contains_point(leaf, gid));
            assert!(tree.contains_point(tree.root(), gid));
        }
    }

    #[test]
    fn morton_ancestry_follows_the_paths() {
        let tree = sample_tree(128, 16);
        for &leaf in tree.leaves() {
            let mut at = leaf;
            while let Some(parent) = tree.node(at).parent {
                assert!(tree.contains_node(parent, leaf));
                assert!(!tree.contains_node(leaf, parent));
                at = parent;
            }
        }
    }

    #[test]
    fn offsets_tile_the_permuted_ordering() {
        let tree = sample_tree(100, 8);
        let mut at = 0;
        for &leaf in tree.leaves() {
            assert_eq!(tree.node(leaf).offset, at);
            at += tree.node(leaf).num_points();
        }
        assert_eq!(at, 100);
        assert_eq!(tree.node(tree.root()).offset, 0);
    }

    #[test]
    fn select_kth_matches_sorting() {
        let values = vec![5.0, 1.0, 4.0, 4.0, 2.0, 9.0, -3.0];
        let mut sorted = values.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        for (k, &expect) in sorted.iter().enumerate() {
            assert_eq!(select_kth(values.clone(), k), expect);
        }
    }

    #[test]
    fn constant_projection_still_splits_evenly() {
        let lids: Vec<usize> = (0..10).collect();
        let values = vec![1.0f64; 10];
        let [l, r] = partition_by_median(&lids, &values);
        assert_eq!(l.len(), 5);
        assert_eq!(r.len(), 5);
    }

    #[test]
    fn treelist_ids_are_breadth_first() {
        let tree = sample_tree(64, 8);
        assert_eq!(tree.node(tree.root()).treelist_id, 0);
        let mut seen = 0;
        for l in 0..tree.num_levels() {
            for &id in tree.level(l) {
                assert_eq!(tree.node(id).treelist_id, seen);
                seen += 1;
            }
        }
    }
}
