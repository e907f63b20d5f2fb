use std::collections::HashSet;

use hartree_linalg::{id_adaptive, id_fixed, Scalar};
use rand::{rngs::SmallRng, Rng};
use tracing::{debug, instrument};

use crate::tree::{NodeId, Tree};
use crate::{GofmmConfig, SpdMatrix};

// SKELETONIZATION
// ================================================================================================

/// Skeletonizes every node in post-order (levels bottom-up).
///
/// Leaves interpolate their own index sets; internal nodes interpolate the
/// concatenation of their children's skeletons. In adaptive mode a node whose
/// child failed clears its own skeleton and propagates the failure; the root
/// carries no parent interaction and is never skeletonized.
#[instrument(skip_all, fields(nodes = tree.num_nodes()))]
pub(crate) fn skeletonize_tree<T, K>(
    kmat: &K,
    tree: &mut Tree<T>,
    config: &GofmmConfig<T>,
    rng: &mut SmallRng,
) where
    T: Scalar,
    K: SpdMatrix<T>,
{
    for level in (0..tree.num_levels()).rev() {
        let ids = tree.level(level).to_vec();
        for id in ids {
            skeletonize_node(kmat, tree, id, config, rng);
        }
    }

    let skeletonized =
        (0..tree.num_nodes()).filter(|&i| tree.node(NodeId::from_usize(i)).data.isskel).count();
    debug!(skeletonized, "skeletonization complete");
}

fn skeletonize_node<T, K>(
    kmat: &K,
    tree: &mut Tree<T>,
    id: NodeId,
    config: &GofmmConfig<T>,
    rng: &mut SmallRng,
) where
    T: Scalar,
    K: SpdMatrix<T>,
{
    let node = tree.node(id);

    // The root has no off-diagonal interaction to compress.
    if node.parent.is_none() {
        return;
    }

    // Failure propagation: a dead child makes this node's skeleton basis
    // incomplete.
    if config.adaptive {
        if let Some([l, r]) = node.kids {
            if !tree.node(l).data.isskel || !tree.node(r).data.isskel {
                let data = &mut tree.node_mut(id).data;
                data.skels.clear();
                data.proj = hartree_linalg::Matrix::zeros(0, 0);
                data.isskel = false;
                return;
            }
        }
    }

    let bmap: Vec<usize> = match node.kids {
        None => node.lids.clone(),
        Some([l, r]) => {
            let mut bmap = tree.node(l).data.skels.clone();
            bmap.extend(&tree.node(r).data.skels);
            bmap
        },
    };
    let amap = sample_rows(kmat, tree, id, 2 * bmap.len(), rng);

    let kab = kmat.gather(&amap, &bmap);
    let result = if config.adaptive {
        id_adaptive(config.max_rank, config.stol, &kab)
    } else {
        id_fixed(config.max_rank, &kab)
    };

    let data = &mut tree.node_mut(id).data;
    data.skels = result.skels.iter().map(|&j| bmap[j]).collect();
    data.proj = result.proj;
    data.isskel = if config.adaptive { !data.skels.is_empty() } else { true };
}

/// Draws `nsamples` distinct row ids outside the node's own index set, or
/// every off-diagonal row when there are not enough to sample from.
fn sample_rows<T, K>(
    kmat: &K,
    tree: &Tree<T>,
    id: NodeId,
    nsamples: usize,
    rng: &mut SmallRng,
) -> Vec<usize>
where
    T: Scalar,
    K: SpdMatrix<T>,
{
    let n = kmat.size();
    let node = tree.node(id);
    let owned: HashSet<usize> = node.lids.iter().copied().collect();

    if nsamples < n - node.num_points() {
        let mut amap = Vec::with_capacity(nsamples);
        let mut drawn: HashSet<usize> = HashSet::with_capacity(nsamples);
        while amap.len() < nsamples {
            let sample = rng.random_range(0..n);
            if !owned.contains(&sample) && drawn.insert(sample) {
                amap.push(sample);
            }
        }
        amap
    } else {
        (0..n).filter(|gid| !owned.contains(gid)).collect()
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use hartree_linalg::{frobenius_norm, xgemm, Matrix, Op};
    use rand::SeedableRng;

    use super::*;
    use crate::tree::CenterSplit;
    use crate::GaussianKernel;

    fn gaussian_setup(n: usize, seed: u64) -> GaussianKernel<f64> {
        GaussianKernel::new(Matrix::randn(4, n, seed), 1.0)
    }

    fn skeletonized_tree(
        kmat: &GaussianKernel<f64>,
        config: &GofmmConfig<f64>,
    ) -> Tree<f64> {
        let mut tree = Tree::build(kmat, &CenterSplit, config.leaf_size, config.seed);
        let mut rng = SmallRng::seed_from_u64(config.seed ^ 0x5eed);
        skeletonize_tree(kmat, &mut tree, config, &mut rng);
        tree
    }

    #[test]
    fn root_is_never_skeletonized() {
        let kmat = gaussian_setup(256, 1);
        let config = GofmmConfig { leaf_size: 32, max_rank: 32, ..GofmmConfig::default() };
        let tree = skeletonized_tree(&kmat, &config);
        assert!(!tree.node(tree.root()).data.isskel);
        assert!(tree.node(tree.root()).data.skels.is_empty());
    }

    #[test]
    fn skeletons_are_subsets_of_the_interpolated_columns() {
        let kmat = gaussian_setup(256, 2);
        let config = GofmmConfig { leaf_size: 32, max_rank: 32, ..GofmmConfig::default() };
        let tree = skeletonized_tree(&kmat, &config);

        for i in 0..tree.num_nodes() {
            let node = tree.node(NodeId::from_usize(i));
            if node.parent.is_none() || !node.data.isskel {
                continue;
            }
            assert!(node.data.skels.len() <= config.max_rank);
            match node.kids {
                None => {
                    for s in &node.data.skels {
                        assert!(node.lids.contains(s));
                    }
                },
                Some([l, r]) => {
                    for s in &node.data.skels {
                        assert!(
                            tree.node(l).data.skels.contains(s)
                                || tree.node(r).data.skels.contains(s)
                        );
                    }
                },
            }
        }
    }

    #[test]
    fn skeleton_bases_reconstruct_fresh_probe_rows() {
        let kmat = gaussian_setup(512, 3);
        let config = GofmmConfig {
            leaf_size: 64,
            max_rank: 64,
            stol: 1e-4,
            ..GofmmConfig::default()
        };
        let tree = skeletonized_tree(&kmat, &config);
        let mut rng = SmallRng::seed_from_u64(777);

        for i in 0..tree.num_nodes() {
            let node = tree.node(NodeId::from_usize(i));
            if node.parent.is_none() || !node.data.isskel {
                continue;
            }
            let bmap: Vec<usize> = match node.kids {
                None => node.lids.clone(),
                Some([l, r]) => {
                    let mut b = tree.node(l).data.skels.clone();
                    b.extend(&tree.node(r).data.skels);
                    b
                },
            };
            let probe = sample_rows(&kmat, &tree, NodeId::from_usize(i), 2 * bmap.len(), &mut rng);

            let kab = kmat.gather(&probe, &bmap);
            let kas = kmat.gather(&probe, &node.data.skels);
            let mut residual = kab.clone();
            xgemm(
                Op::NoTrans,
                Op::NoTrans,
                probe.len(),
                bmap.len(),
                node.data.skels.len(),
                -1.0,
                kas.data(),
                kas.ld(),
                node.data.proj.data(),
                node.data.proj.ld(),
                1.0,
                residual.data_mut(),
                probe.len(),
            );

            let denom = frobenius_norm(probe.len(), bmap.len(), kab.data(), probe.len());
            let err = frobenius_norm(probe.len(), bmap.len(), residual.data(), probe.len());
            // The tolerance held on the sampled rows used during
            // factorization; fresh probes get generous slack.
            assert!(err <= 100.0 * config.stol * denom.max(1e-30), "node {i}: {err:e}");
        }
    }

    #[test]
    fn fixed_rank_mode_marks_every_nonroot_node() {
        let kmat = gaussian_setup(128, 4);
        let config = GofmmConfig {
            leaf_size: 16,
            max_rank: 8,
            adaptive: false,
            ..GofmmConfig::default()
        };
        let tree = skeletonized_tree(&kmat, &config);
        for i in 0..tree.num_nodes() {
            let node = tree.node(NodeId::from_usize(i));
            if node.parent.is_some() {
                assert!(node.data.isskel);
                assert_eq!(node.data.skels.len(), 8.min(node.num_points()));
            }
        }
    }

    #[test]
    fn rank_zero_disables_every_node() {
        let kmat = gaussian_setup(128, 5);
        let config = GofmmConfig {
            leaf_size: 16,
            max_rank: 0,
            ..GofmmConfig::default()
        };
        let tree = skeletonized_tree(&kmat, &config);
        for i in 0..tree.num_nodes() {
            assert!(!tree.node(NodeId::from_usize(i)).data.isskel);
        }
    }
}
