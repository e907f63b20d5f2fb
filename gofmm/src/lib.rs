//! Geometry-oblivious hierarchical compression of SPD matrices.
//!
//! The framework builds a binary partition tree over the index set of an SPD
//! matrix using only matrix entries (no coordinates required), compresses
//! every off-diagonal block through interpolative decomposition of sampled
//! rows, and evaluates fast approximate matrix-vector products two ways:
//!
//! - [`Hierarchy::evaluate_all`]: the FMM-style batch product (upward weight
//!   compression, skeleton-to-skeleton far field, downward distribution,
//!   near-field direct),
//! - [`Hierarchy::evaluate_point`]: the treecode potential of a single
//!   target, with or without nearest-neighbor pruning.
//!
//! All sampling is seeded; identical inputs give identical trees, skeletons,
//! and potentials.

mod evaluate;
mod interaction;
mod matrices;
mod neighbors;
mod skeletonize;
mod tree;

pub use evaluate::direct_evaluate;
pub use matrices::{DenseSpd, GaussianKernel, SpdMatrix};
pub use neighbors::{find_approx_neighbors, NeighborTable, GID_SENTINEL};
pub use tree::{CenterSplit, NodeId, RandomSplit, Splitter, Tree, TreeNode};

use hartree_linalg::{Matrix, Scalar};
use rand::{rngs::SmallRng, SeedableRng};
use tracing::instrument;

// CONFIGURATION
// ================================================================================================

/// Knobs of one compression.
///
/// `leaf_size` bounds the on-diagonal blocks (`m` in the literature),
/// `num_neighbors` the per-point neighbor count (`k`), `max_rank` the
/// skeleton size cap (`s`), and `stol` the adaptive tolerance. With
/// `adaptive` off the decomposition takes exactly `max_rank` columns per
/// node and failure propagation is disabled. `nn_prune` requires
/// `num_neighbors >= 1` so a neighbor table exists to prune against;
/// [`compress`] rejects the pairing otherwise.
#[derive(Debug, Clone, Copy)]
pub struct GofmmConfig<T> {
    pub leaf_size: usize,
    pub num_neighbors: usize,
    pub max_rank: usize,
    pub stol: T,
    pub adaptive: bool,
    pub symmetric: bool,
    pub nn_prune: bool,
    /// Randomized-tree sweeps of the neighbor search.
    pub knn_iters: usize,
    pub seed: u64,
}

impl<T: Scalar> Default for GofmmConfig<T> {
    fn default() -> Self {
        Self {
            leaf_size: 64,
            num_neighbors: 32,
            max_rank: 64,
            stol: T::from_f64(1e-3).unwrap(),
            adaptive: true,
            symmetric: true,
            nn_prune: true,
            knn_iters: 8,
            seed: 1,
        }
    }
}

// ERRORS
// ================================================================================================

#[derive(Debug, thiserror::Error)]
pub enum GofmmError {
    #[error("cannot compress an empty matrix")]
    EmptyMatrix,

    #[error("leaf size must be at least 1")]
    InvalidLeafSize,

    #[error("NN pruning requires a neighbor table (num_neighbors must be at least 1)")]
    NnPruneWithoutNeighbors,

    #[error("weights have {got} columns but the matrix dimension is {expect}")]
    WeightShape { got: usize, expect: usize },

    #[error("target id {gid} is out of range for dimension {n}")]
    TargetOutOfRange { gid: usize, n: usize },
}

// HIERARCHY
// ================================================================================================

/// A compressed SPD matrix: the partition tree, per-node skeletons, the
/// neighbor table, and the interaction lists.
///
/// The hierarchy borrows the matrix it compresses; `K` and the weights are
/// read-only during evaluation, while per-node `w_skel`/`u_skel` buffers are
/// rebuilt per right-hand-side batch.
pub struct Hierarchy<'k, T, K> {
    kmat: &'k K,
    config: GofmmConfig<T>,
    nn: Option<NeighborTable<T>>,
    tree: Tree<T>,
}

/// Compresses `kmat`: neighbor search, tree construction with the
/// geometry-oblivious center split, post-order skeletonization, and
/// interaction-list construction.
#[instrument(skip_all, fields(n = kmat.size()))]
pub fn compress<T, K>(kmat: &K, config: GofmmConfig<T>) -> Result<Hierarchy<'_, T, K>, GofmmError>
where
    T: Scalar,
    K: SpdMatrix<T>,
{
    if kmat.size() == 0 {
        return Err(GofmmError::EmptyMatrix);
    }
    if config.leaf_size == 0 {
        return Err(GofmmError::InvalidLeafSize);
    }
    if config.nn_prune && config.num_neighbors == 0 {
        return Err(GofmmError::NnPruneWithoutNeighbors);
    }

    let nn = (config.num_neighbors > 0).then(|| {
        find_approx_neighbors(
            kmat,
            config.num_neighbors,
            config.leaf_size,
            config.knn_iters,
            config.seed.wrapping_add(0x6e65),
        )
    });

    let mut tree = Tree::build(kmat, &CenterSplit, config.leaf_size, config.seed);
    let mut rng = SmallRng::seed_from_u64(config.seed.wrapping_add(0x5e1));
    skeletonize::skeletonize_tree(kmat, &mut tree, &config, &mut rng);
    interaction::build_interaction_lists(&tree, nn.as_ref(), config.symmetric, config.nn_prune);

    Ok(Hierarchy { kmat, config, nn, tree })
}

impl<T, K> Hierarchy<'_, T, K>
where
    T: Scalar,
    K: SpdMatrix<T>,
{
    // ACCESSORS
    // --------------------------------------------------------------------------------------------

    pub fn tree(&self) -> &Tree<T> {
        &self.tree
    }

    pub fn neighbors(&self) -> Option<&NeighborTable<T>> {
        self.nn.as_ref()
    }

    pub fn config(&self) -> &GofmmConfig<T> {
        &self.config
    }

    fn check_weights(&self, w: &Matrix<T>) -> Result<(), GofmmError> {
        let n = self.kmat.size();
        if w.ncols() != n {
            return Err(GofmmError::WeightShape { got: w.ncols(), expect: n });
        }
        Ok(())
    }

    // EVALUATION
    // --------------------------------------------------------------------------------------------

    /// Upward pass only: compresses the `nrhs x n` weights onto every
    /// skeleton. A prerequisite of the treecode path.
    pub fn update_weights(&mut self, w: &Matrix<T>) -> Result<(), GofmmError> {
        self.check_weights(w)?;
        evaluate::update_weights(&mut self.tree, w);
        Ok(())
    }

    /// The batch product `u ≈ K * w^T` (laid out like `w`, nrhs x n):
    /// upward compression, skeleton-to-skeleton far field, downward
    /// distribution, and near-field direct evaluation.
    #[instrument(skip_all, fields(nrhs = w.nrows()))]
    pub fn evaluate_all(&mut self, w: &Matrix<T>) -> Result<Matrix<T>, GofmmError> {
        self.check_weights(w)?;
        let nrhs = w.nrows();
        let n = self.kmat.size();

        evaluate::update_weights(&mut self.tree, w);
        evaluate::skeletons_to_skeletons(self.kmat, &mut self.tree, self.config.nn_prune, nrhs);

        let mut u = Matrix::zeros(nrhs, n);
        evaluate::skeletons_to_nodes(&mut self.tree, &mut u);
        evaluate::near_direct(self.kmat, &self.tree, w, self.config.nn_prune, &mut u);
        Ok(u)
    }

    /// Treecode potentials of one target point; requires a prior
    /// [`Self::update_weights`] (or [`Self::evaluate_all`]) with the same
    /// weights.
    ///
    /// With `nn_prune` the target's neighbor set joins the non-prunable ids,
    /// forcing direct evaluation of everything close to the target.
    pub fn evaluate_point(
        &self,
        gid: usize,
        w: &Matrix<T>,
        nn_prune: bool,
    ) -> Result<Vec<T>, GofmmError> {
        self.check_weights(w)?;
        if gid >= self.kmat.size() {
            return Err(GofmmError::TargetOutOfRange { gid, n: self.kmat.size() });
        }

        let nnandi = self.nnandi(gid, nn_prune);
        Ok(evaluate::evaluate_point(self.kmat, &self.tree, gid, w, &nnandi))
    }

    /// Symbolic twin of [`Self::evaluate_point`]: records which nodes would
    /// prune (far ids) or directly cover (near ids) the target.
    pub fn evaluate_point_symbolic(&self, gid: usize, nn_prune: bool) -> Result<(), GofmmError> {
        if gid >= self.kmat.size() {
            return Err(GofmmError::TargetOutOfRange { gid, n: self.kmat.size() });
        }
        let nnandi = self.nnandi(gid, nn_prune);
        evaluate::evaluate_point_symbolic(&self.tree, gid, &nnandi, nn_prune);
        Ok(())
    }

    /// Relative l2 error of treecode or batch potentials for one target
    /// against the exact row product.
    pub fn compute_error(&self, gid: usize, w: &Matrix<T>, potentials: &[T]) -> T {
        evaluate::compute_error(self.kmat, w, gid, potentials)
    }

    /// The target plus, under NN pruning, its approximate neighbors.
    fn nnandi(&self, gid: usize, nn_prune: bool) -> Vec<usize> {
        let mut nnandi = vec![gid];
        if nn_prune {
            if let Some(nn) = &self.nn {
                nnandi.extend(nn.neighbors(gid));
            }
        }
        nnandi
    }
}

// TESTS
// ================================================================================================
