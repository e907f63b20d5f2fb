use std::collections::HashSet;

use hartree_linalg::{heap_select, Scalar};
use tracing::{debug, instrument};

use crate::tree::{RandomSplit, Tree};
use crate::SpdMatrix;

// NEIGHBOR TABLE
// ================================================================================================

/// The `k x N` table of approximate nearest neighbors under the kernel
/// distance, one column of `(distance, gid)` pairs per point.
///
/// Columns are bounded max-heaps maintained through [`heap_select`]; unfilled
/// slots keep the `(MAX, GID_SENTINEL)` seed and must be skipped by
/// consumers.
#[derive(Debug, Clone)]
pub struct NeighborTable<T> {
    k: usize,
    data: Vec<(T, usize)>,
}

/// Marks a neighbor slot no candidate has reached yet.
pub const GID_SENTINEL: usize = usize::MAX;

impl<T: Scalar> NeighborTable<T> {
    pub fn new(k: usize, n: usize) -> Self {
        Self { k, data: vec![(T::max_value(), GID_SENTINEL); k * n] }
    }

    /// Neighbors per point.
    pub fn num_neighbors(&self) -> usize {
        self.k
    }

    pub fn num_points(&self) -> usize {
        if self.k == 0 { 0 } else { self.data.len() / self.k }
    }

    /// The neighbor heap of point `gid`.
    pub fn column(&self, gid: usize) -> &[(T, usize)] {
        &self.data[gid * self.k..(gid + 1) * self.k]
    }

    fn column_mut(&mut self, gid: usize) -> &mut [(T, usize)] {
        &mut self.data[gid * self.k..(gid + 1) * self.k]
    }

    /// Resolved neighbor gids of `gid`, sentinels skipped.
    pub fn neighbors(&self, gid: usize) -> impl Iterator<Item = usize> + '_ {
        self.column(gid).iter().filter(|&&(_, g)| g != GID_SENTINEL).map(|&(_, g)| g)
    }
}

// ALL-NEAREST-NEIGHBORS SEARCH
// ================================================================================================

/// Approximate all-nearest-neighbors under the kernel distance.
///
/// Runs `iters` randomized partition trees; within every leaf each pair of
/// points is tried as a neighbor candidate, with a per-column membership set
/// to keep duplicate gids out of the heap. More iterations tighten the
/// approximation; the result is deterministic in `seed`.
#[instrument(skip_all, fields(n = kmat.size(), k = k, iters = iters))]
pub fn find_approx_neighbors<T, K>(
    kmat: &K,
    k: usize,
    leaf_size: usize,
    iters: usize,
    seed: u64,
) -> NeighborTable<T>
where
    T: Scalar,
    K: SpdMatrix<T>,
{
    let n = kmat.size();
    let mut table = NeighborTable::new(k, n);

    for iter in 0..iters {
        let tree: Tree<T> = Tree::build(kmat, &RandomSplit, leaf_size, seed.wrapping_add(iter as u64));

        for &leaf in tree.leaves() {
            let lids = &tree.node(leaf).lids;
            for &target in lids {
                let known: HashSet<usize> =
                    table.neighbors(target).collect();
                let column = table.column_mut(target);
                for &candidate in lids {
                    if known.contains(&candidate) {
                        continue;
                    }
                    let dist = kmat.kernel_distance(target, candidate);
                    heap_select(&[(dist, candidate)], column);
                }
            }
        }
        debug!(iter, "neighbor sweep complete");
    }

    table
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use hartree_linalg::Matrix;

    use super::*;
    use crate::GaussianKernel;

    /// Exact k nearest by brute force, for comparison.
    fn exact_neighbors(kmat: &GaussianKernel<f64>, gid: usize, k: usize) -> Vec<usize> {
        let n = kmat.size();
        let mut all: Vec<(f64, usize)> = (0..n).map(|j| (kmat.kernel_distance(gid, j), j)).collect();
        all.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
        all.truncate(k);
        all.into_iter().map(|(_, g)| g).collect()
    }

    #[test]
    fn search_finds_mostly_exact_neighbors() {
        let points = Matrix::<f64>::randn(3, 256, 5);
        let kmat = GaussianKernel::new(points, 1.0);
        let table = find_approx_neighbors(&kmat, 8, 32, 10, 99);

        let mut hits = 0;
        let mut total = 0;
        for gid in (0..256).step_by(16) {
            let exact: HashSet<usize> = exact_neighbors(&kmat, gid, 8).into_iter().collect();
            let approx: HashSet<usize> = table.neighbors(gid).collect();
            hits += exact.intersection(&approx).count();
            total += 8;
        }
        // Randomized trees with 10 sweeps recover the bulk of the true
        // neighbor sets on a few hundred points.
        assert!(hits * 10 >= total * 6, "only {hits}/{total} exact neighbors found");
    }

    #[test]
    fn every_point_neighbors_itself() {
        let points = Matrix::<f64>::randn(2, 64, 1);
        let kmat = GaussianKernel::new(points, 1.0);
        let table = find_approx_neighbors(&kmat, 4, 16, 4, 3);
        for gid in 0..64 {
            assert!(table.neighbors(gid).any(|g| g == gid), "point {gid} lost itself");
        }
    }

    #[test]
    fn columns_never_hold_duplicates() {
        let points = Matrix::<f64>::randn(2, 100, 2);
        let kmat = GaussianKernel::new(points, 1.0);
        let table = find_approx_neighbors(&kmat, 6, 25, 6, 17);
        for gid in 0..100 {
            let gids: Vec<usize> = table.neighbors(gid).collect();
            let unique: HashSet<usize> = gids.iter().copied().collect();
            assert_eq!(gids.len(), unique.len());
        }
    }
}
