use std::collections::BTreeSet;

use hartree_linalg::Scalar;
use parking_lot::Mutex;
use tracing::{debug, instrument};

use crate::neighbors::NeighborTable;
use crate::tree::{NodeId, Tree, TreeNode};

// LIST SELECTION
// ================================================================================================

/// The near list for the active pruning mode.
pub(crate) fn near_of<T>(node: &TreeNode<T>, nn_prune: bool) -> &Mutex<BTreeSet<NodeId>> {
    if nn_prune {
        &node.data.nn_near
    } else {
        &node.data.near
    }
}

/// The far list for the active pruning mode.
pub(crate) fn far_of<T>(node: &TreeNode<T>, nn_prune: bool) -> &Mutex<BTreeSet<NodeId>> {
    if nn_prune {
        &node.data.nn_far
    } else {
        &node.data.far
    }
}

// CONSTRUCTION DRIVER
// ================================================================================================

/// Builds the near and far interaction lists of every node.
///
/// Near lists exist on leaves: the leaf itself plus, under NN pruning, the
/// leaf of every neighbor of every owned point. Far lists are collected by a
/// symbolic root-to-leaf traversal per target leaf and then merged upward:
/// a far node shared by both children moves to the parent. In symmetric mode
/// both lists are mirrored.
#[instrument(skip_all, fields(leaves = tree.leaves().len(), symmetric = symmetric, nn_prune = nn_prune))]
pub(crate) fn build_interaction_lists<T: Scalar>(
    tree: &Tree<T>,
    nn: Option<&NeighborTable<T>>,
    symmetric: bool,
    nn_prune: bool,
) {
    // `compress` rejects nn_prune without a table before we get here.
    debug_assert!(!nn_prune || nn.is_some());
    build_near_lists(tree, nn, symmetric, nn_prune);
    build_far_lists(tree, symmetric, nn_prune);
    debug!("interaction lists complete");
}

// NEAR LISTS
// ================================================================================================

fn build_near_lists<T: Scalar>(
    tree: &Tree<T>,
    nn: Option<&NeighborTable<T>>,
    symmetric: bool,
    nn_prune: bool,
) {
    parallel_for_leaves(tree.leaves(), |alpha| {
        let node = tree.node(alpha);
        if nn_prune {
            let mut set = node.data.nn_near.lock();
            set.insert(alpha);
            if let Some(nn) = nn {
                for &p in &node.lids {
                    for q in nn.neighbors(p) {
                        set.insert(tree.leaf_of_point(q));
                    }
                }
            }
        } else {
            node.data.near.lock().insert(alpha);
        }
    });

    if symmetric && nn_prune {
        parallel_for_leaves(tree.leaves(), |alpha| {
            let members: Vec<NodeId> =
                tree.node(alpha).data.nn_near.lock().iter().copied().collect();
            for beta in members {
                if beta != alpha {
                    tree.node(beta).data.nn_near.lock().insert(alpha);
                }
            }
        });
    }
}

// FAR LISTS
// ================================================================================================

fn build_far_lists<T: Scalar>(tree: &Tree<T>, symmetric: bool, nn_prune: bool) {
    // Symbolic traversal: every leaf walks the tree from the root. A leaf
    // whose own skeleton chain is dead cannot absorb far interactions, so it
    // collects every leaf into its near list instead; the reverse direction
    // arises organically because its ancestors are never prunable from any
    // other target.
    parallel_for_leaves(tree.leaves(), |alpha| {
        if tree.node(alpha).data.isskel {
            let near: Vec<NodeId> =
                near_of(tree.node(alpha), nn_prune).lock().iter().copied().collect();
            visit(tree, tree.root(), alpha, &near, symmetric, nn_prune);
        } else {
            let mut set = near_of(tree.node(alpha), nn_prune).lock();
            set.extend(tree.leaves().iter().copied());
        }
    });

    // Far-list merging: members shared by both children belong to the
    // parent. A parent without a skeleton cannot consume far interactions,
    // so shared members stay on the children there.
    for level in (0..tree.num_levels()).rev() {
        for &id in tree.level(level) {
            let node = tree.node(id);
            let Some([l, r]) = node.kids else { continue };
            if !node.data.isskel {
                continue;
            }

            let shared: Vec<NodeId> = {
                let lfar = far_of(tree.node(l), nn_prune).lock();
                let rfar = far_of(tree.node(r), nn_prune).lock();
                lfar.intersection(&rfar).copied().collect()
            };
            if shared.is_empty() {
                continue;
            }
            far_of(node, nn_prune).lock().extend(shared.iter().copied());
            let mut lfar = far_of(tree.node(l), nn_prune).lock();
            let mut rfar = far_of(tree.node(r), nn_prune).lock();
            for id in &shared {
                lfar.remove(id);
                rfar.remove(id);
            }
        }
    }

    if symmetric {
        for level in (0..tree.num_levels()).rev() {
            for &id in tree.level(level) {
                let members: Vec<NodeId> =
                    far_of(tree.node(id), nn_prune).lock().iter().copied().collect();
                for beta in members {
                    far_of(tree.node(beta), nn_prune).lock().insert(id);
                }
            }
        }
    }
}

/// Symbolic visit of `beta` from the perspective of target leaf `alpha`.
///
/// A node is prunable when it is skeletonized and its subtree holds no
/// member of `alpha`'s near list; prunable nodes land in the far list (once,
/// under the symmetric Morton tie-break), everything else recurses. Leaves
/// that cannot be pruned are already covered by the near list.
fn visit<T: Scalar>(
    tree: &Tree<T>,
    beta: NodeId,
    alpha: NodeId,
    near: &[NodeId],
    symmetric: bool,
    nn_prune: bool,
) {
    let bnode = tree.node(beta);
    let prunable =
        bnode.data.isskel && !near.iter().any(|&nu| tree.contains_node(beta, nu));

    if !prunable {
        match bnode.kids {
            Some([l, r]) => {
                visit(tree, l, alpha, near, symmetric, nn_prune);
                visit(tree, r, alpha, near, symmetric, nn_prune);
            },
            None => {
                // A live non-prunable leaf is near by construction; a dead
                // one has to be evaluated directly as well.
                if !bnode.data.isskel {
                    near_of(tree.node(alpha), nn_prune).lock().insert(beta);
                }
            },
        }
        return;
    }

    if symmetric && bnode.morton < tree.node(alpha).morton {
        // The mirrored pair records this interaction.
        return;
    }
    far_of(tree.node(alpha), nn_prune).lock().insert(beta);
}

// LEAF-PARALLEL DRIVER
// ================================================================================================

/// Fans a symbolic task out across the leaves; per-node locks make the
/// concurrent set insertions safe.
fn parallel_for_leaves(leaves: &[NodeId], task: impl Fn(NodeId) + Sync) {
    let workers = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
        .min(leaves.len())
        .max(1);

    if workers == 1 {
        for &leaf in leaves {
            task(leaf);
        }
        return;
    }

    let chunk = leaves.len().div_ceil(workers);
    std::thread::scope(|scope| {
        let task = &task;
        for piece in leaves.chunks(chunk) {
            scope.spawn(move || {
                for &leaf in piece {
                    task(leaf);
                }
            });
        }
    });
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use hartree_linalg::Matrix;
    use rand::{rngs::SmallRng, SeedableRng};
    use rstest::rstest;

    use super::*;
    use crate::skeletonize::skeletonize_tree;
    use crate::tree::CenterSplit;
    use crate::{find_approx_neighbors, GaussianKernel, GofmmConfig, SpdMatrix};

    fn compressed_tree(
        n: usize,
        symmetric: bool,
        nn_prune: bool,
    ) -> (GaussianKernel<f64>, Tree<f64>, NeighborTable<f64>) {
        let kmat = GaussianKernel::new(Matrix::randn(4, n, 21), 1.0);
        let config = GofmmConfig {
            leaf_size: 32,
            max_rank: 32,
            symmetric,
            nn_prune,
            ..GofmmConfig::default()
        };
        let mut tree = Tree::build(&kmat, &CenterSplit, config.leaf_size, config.seed);
        let mut rng = SmallRng::seed_from_u64(config.seed);
        skeletonize_tree(&kmat, &mut tree, &config, &mut rng);
        let nn = find_approx_neighbors(&kmat, 8, 32, 6, 3);
        build_interaction_lists(&tree, Some(&nn), symmetric, nn_prune);
        (kmat, tree, nn)
    }

    #[rstest]
    #[case(true)]
    #[case(false)]
    fn every_leaf_is_its_own_near_node(#[case] nn_prune: bool) {
        let (_, tree, _) = compressed_tree(256, true, nn_prune);
        for &leaf in tree.leaves() {
            assert!(near_of(tree.node(leaf), nn_prune).lock().contains(&leaf));
        }
    }

    #[test]
    fn symmetric_near_lists_mirror() {
        let (_, tree, _) = compressed_tree(256, true, true);
        for &alpha in tree.leaves() {
            for &beta in near_of(tree.node(alpha), true).lock().iter() {
                assert!(
                    near_of(tree.node(beta), true).lock().contains(&alpha),
                    "{alpha:?} -> {beta:?} not mirrored"
                );
            }
        }
    }

    #[test]
    fn symmetric_far_lists_mirror() {
        let (_, tree, _) = compressed_tree(512, true, true);
        let mut total = 0;
        for i in 0..tree.num_nodes() {
            let id = NodeId::from_usize(i);
            for &beta in far_of(tree.node(id), true).lock().iter() {
                assert!(far_of(tree.node(beta), true).lock().contains(&id));
                total += 1;
            }
        }
        assert!(total > 0, "no far interactions at all");
    }

    #[test]
    fn far_members_are_skeletonized_and_separated() {
        let (_, tree, _) = compressed_tree(512, false, true);
        for &alpha in tree.leaves() {
            let near: Vec<NodeId> =
                near_of(tree.node(alpha), true).lock().iter().copied().collect();
            for &beta in far_of(tree.node(alpha), true).lock().iter() {
                assert!(tree.node(beta).data.isskel);
                assert!(!near.iter().any(|&nu| tree.contains_node(beta, nu)));
            }
        }
    }

    #[test]
    fn merged_far_members_leave_the_children() {
        let (_, tree, _) = compressed_tree(512, false, true);
        for i in 0..tree.num_nodes() {
            let id = NodeId::from_usize(i);
            let far: Vec<NodeId> = far_of(tree.node(id), true).lock().iter().copied().collect();
            if let Some(parent) = tree.node(id).parent {
                let pfar = far_of(tree.node(parent), true).lock();
                assert!(far.iter().all(|b| !pfar.contains(b)));
            }
        }
    }

    #[test]
    fn neighbor_leaves_land_in_the_near_list() {
        let (_, tree, nn) = compressed_tree(256, false, true);
        for &alpha in tree.leaves() {
            let set = near_of(tree.node(alpha), true).lock();
            for &p in &tree.node(alpha).lids {
                for q in nn.neighbors(p) {
                    assert!(set.contains(&tree.leaf_of_point(q)));
                }
            }
        }
    }

    #[test]
    fn without_nn_pruning_near_lists_are_singletons() {
        let (_, tree, _) = compressed_tree(256, false, false);
        for &leaf in tree.leaves() {
            assert_eq!(near_of(tree.node(leaf), false).lock().len(), 1);
        }
    }
}
