use hartree_linalg::{xgemm, Matrix, Op, Scalar};
use itertools::iproduct;
use tracing::instrument;

use crate::interaction::{far_of, near_of};
use crate::tree::{NodeId, Tree};
use crate::SpdMatrix;

// UPWARD PASS
// ================================================================================================

/// Compresses the weights onto every skeleton, post-order.
///
/// Leaves project their owned weight columns; internal nodes combine their
/// children's skeleton weights through the column blocks of `proj` aligned
/// with the left and right skeletons. Skipped at the root and wherever
/// skeletonization failed.
#[instrument(skip_all, fields(nrhs = w.nrows()))]
pub(crate) fn update_weights<T: Scalar>(tree: &mut Tree<T>, w: &Matrix<T>) {
    let nrhs = w.nrows();

    for level in (0..tree.num_levels()).rev() {
        let ids = tree.level(level).to_vec();
        for id in ids {
            let node = tree.node(id);
            if node.parent.is_none() || !node.data.isskel {
                continue;
            }

            let s = node.data.skels.len();
            let mut w_skel = Matrix::zeros(s, nrhs);

            match node.kids {
                None => {
                    let w_leaf = w.gather_columns(&node.lids);
                    xgemm(
                        Op::NoTrans,
                        Op::Trans,
                        s,
                        nrhs,
                        node.lids.len(),
                        T::one(),
                        node.data.proj.data(),
                        node.data.proj.ld(),
                        w_leaf.data(),
                        w_leaf.ld(),
                        T::zero(),
                        w_skel.data_mut(),
                        s,
                    );
                },
                Some([l, r]) => {
                    let w_lskel = &tree.node(l).data.w_skel;
                    let w_rskel = &tree.node(r).data.w_skel;
                    let nl = tree.node(l).data.skels.len();
                    let nr = tree.node(r).data.skels.len();
                    let proj = &node.data.proj;
                    xgemm(
                        Op::NoTrans,
                        Op::NoTrans,
                        s,
                        nrhs,
                        nl,
                        T::one(),
                        proj.data(),
                        proj.ld(),
                        w_lskel.data(),
                        w_lskel.ld(),
                        T::zero(),
                        w_skel.data_mut(),
                        s,
                    );
                    xgemm(
                        Op::NoTrans,
                        Op::NoTrans,
                        s,
                        nrhs,
                        nr,
                        T::one(),
                        &proj.data()[s * nl..],
                        proj.ld(),
                        w_rskel.data(),
                        w_rskel.ld(),
                        T::one(),
                        w_skel.data_mut(),
                        s,
                    );
                },
            }

            tree.node_mut(id).data.w_skel = w_skel;
        }
    }
}

// HORIZONTAL PASS
// ================================================================================================

/// Skeleton-to-skeleton far-field interaction:
/// `u_skel(a) = sum K(a.skels, b.skels) * w_skel(b)` over `a`'s far list.
#[instrument(skip_all)]
pub(crate) fn skeletons_to_skeletons<T, K>(kmat: &K, tree: &mut Tree<T>, nn_prune: bool, nrhs: usize)
where
    T: Scalar,
    K: SpdMatrix<T>,
{
    for idx in 0..tree.num_nodes() {
        let id = NodeId::from_usize(idx);
        let node = tree.node(id);
        if !node.data.isskel {
            tree.node_mut(id).data.u_skel = Matrix::zeros(0, nrhs);
            continue;
        }

        let amap = node.data.skels.clone();
        let far: Vec<NodeId> = far_of(node, nn_prune).lock().iter().copied().collect();
        let mut u_skel = Matrix::zeros(amap.len(), nrhs);

        for beta in far {
            let bnode = tree.node(beta);
            let kab = kmat.gather(&amap, &bnode.data.skels);
            let w_skel = &bnode.data.w_skel;
            debug_assert_eq!(w_skel.ncols(), nrhs);
            xgemm(
                Op::NoTrans,
                Op::NoTrans,
                amap.len(),
                nrhs,
                kab.ncols(),
                T::one(),
                kab.data(),
                kab.ld(),
                w_skel.data(),
                w_skel.ld(),
                T::one(),
                u_skel.data_mut(),
                amap.len(),
            );
        }

        tree.node_mut(id).data.u_skel = u_skel;
    }
}

// DOWNWARD PASS
// ================================================================================================

/// Distributes accumulated skeleton potentials down the tree (the transpose
/// of the upward relation) and flushes leaf potentials into `u` (nrhs x n).
#[instrument(skip_all)]
pub(crate) fn skeletons_to_nodes<T: Scalar>(tree: &mut Tree<T>, u: &mut Matrix<T>) {
    let nrhs = u.nrows();

    for level in 0..tree.num_levels() {
        let ids = tree.level(level).to_vec();
        for id in ids {
            let node = tree.node(id);
            if !node.data.isskel || node.data.u_skel.nrows() == 0 {
                continue;
            }
            let s = node.data.skels.len();

            match node.kids {
                None => {
                    let pt_rows = node.lids.len();
                    let mut pt = Matrix::zeros(pt_rows, nrhs);
                    xgemm(
                        Op::Trans,
                        Op::NoTrans,
                        pt_rows,
                        nrhs,
                        s,
                        T::one(),
                        node.data.proj.data(),
                        node.data.proj.ld(),
                        node.data.u_skel.data(),
                        node.data.u_skel.ld(),
                        T::zero(),
                        pt.data_mut(),
                        pt_rows,
                    );
                    for (ii, &lid) in node.lids.iter().enumerate() {
                        for r in 0..nrhs {
                            u[(r, lid)] = u[(r, lid)] + pt[(ii, r)];
                        }
                    }
                },
                Some([l, r]) => {
                    let nl = tree.node(l).data.skels.len();
                    let nr = tree.node(r).data.skels.len();
                    let mut add_l = Matrix::zeros(nl, nrhs);
                    let mut add_r = Matrix::zeros(nr, nrhs);
                    {
                        let proj = &node.data.proj;
                        let u_skel = &node.data.u_skel;
                        xgemm(
                            Op::Trans,
                            Op::NoTrans,
                            nl,
                            nrhs,
                            s,
                            T::one(),
                            proj.data(),
                            proj.ld(),
                            u_skel.data(),
                            u_skel.ld(),
                            T::zero(),
                            add_l.data_mut(),
                            nl.max(1),
                        );
                        xgemm(
                            Op::Trans,
                            Op::NoTrans,
                            nr,
                            nrhs,
                            s,
                            T::one(),
                            &proj.data()[s * nl..],
                            proj.ld(),
                            u_skel.data(),
                            u_skel.ld(),
                            T::zero(),
                            add_r.data_mut(),
                            nr.max(1),
                        );
                    }
                    accumulate_u_skel(tree, l, &add_l, nrhs);
                    accumulate_u_skel(tree, r, &add_r, nrhs);
                },
            }
        }
    }
}

fn accumulate_u_skel<T: Scalar>(tree: &mut Tree<T>, id: NodeId, add: &Matrix<T>, nrhs: usize) {
    let u_skel = &mut tree.node_mut(id).data.u_skel;
    if u_skel.nrows() == 0 && add.nrows() > 0 {
        *u_skel = Matrix::zeros(add.nrows(), nrhs);
    }
    for j in 0..nrhs {
        for i in 0..add.nrows() {
            u_skel[(i, j)] = u_skel[(i, j)] + add[(i, j)];
        }
    }
}

// NEAR-FIELD DIRECT EVALUATION
// ================================================================================================

/// Leaf-to-leaf direct interaction over the near lists.
#[instrument(skip_all)]
pub(crate) fn near_direct<T, K>(
    kmat: &K,
    tree: &Tree<T>,
    w: &Matrix<T>,
    nn_prune: bool,
    u: &mut Matrix<T>,
) where
    T: Scalar,
    K: SpdMatrix<T>,
{
    let nrhs = w.nrows();

    for &tau in tree.leaves() {
        let tnode = tree.node(tau);
        let near: Vec<NodeId> = near_of(tnode, nn_prune).lock().iter().copied().collect();

        let mut pt = Matrix::zeros(tnode.lids.len(), nrhs);
        for beta in near {
            let bnode = tree.node(beta);
            let kab = kmat.gather(&tnode.lids, &bnode.lids);
            let wb = w.gather_columns(&bnode.lids);
            xgemm(
                Op::NoTrans,
                Op::Trans,
                tnode.lids.len(),
                nrhs,
                bnode.lids.len(),
                T::one(),
                kab.data(),
                kab.ld(),
                wb.data(),
                wb.ld(),
                T::one(),
                pt.data_mut(),
                tnode.lids.len(),
            );
        }

        for (ii, &lid) in tnode.lids.iter().enumerate() {
            for r in 0..nrhs {
                u[(r, lid)] = u[(r, lid)] + pt[(ii, r)];
            }
        }
    }
}

// TREECODE EVALUATION
// ================================================================================================

/// Treecode potentials of a single target point.
///
/// Recursion from the root: a node is pruned through its skeleton when it is
/// skeletonized and its subtree holds none of the `nnandi` ids (the target
/// and, under NN pruning, its neighbors); otherwise the recursion descends
/// and leaves are evaluated directly.
pub(crate) fn evaluate_point<T, K>(
    kmat: &K,
    tree: &Tree<T>,
    gid: usize,
    w: &Matrix<T>,
    nnandi: &[usize],
) -> Vec<T>
where
    T: Scalar,
    K: SpdMatrix<T>,
{
    let mut potentials = vec![T::zero(); w.nrows()];
    evaluate_point_on(kmat, tree, tree.root(), gid, w, nnandi, &mut potentials);
    potentials
}

fn evaluate_point_on<T, K>(
    kmat: &K,
    tree: &Tree<T>,
    beta: NodeId,
    gid: usize,
    w: &Matrix<T>,
    nnandi: &[usize],
    potentials: &mut [T],
) where
    T: Scalar,
    K: SpdMatrix<T>,
{
    let node = tree.node(beta);
    let nrhs = w.nrows();
    let amap = [gid];

    let prunable =
        node.data.isskel && !nnandi.iter().any(|&p| tree.contains_point(beta, p));

    if !prunable {
        match node.kids {
            None => {
                let kab = kmat.gather(&amap, &node.lids);
                let wb = w.gather_columns(&node.lids);
                xgemm(
                    Op::NoTrans,
                    Op::Trans,
                    1,
                    nrhs,
                    node.lids.len(),
                    T::one(),
                    kab.data(),
                    1,
                    wb.data(),
                    wb.ld(),
                    T::one(),
                    potentials,
                    1,
                );
            },
            Some([l, r]) => {
                evaluate_point_on(kmat, tree, l, gid, w, nnandi, potentials);
                evaluate_point_on(kmat, tree, r, gid, w, nnandi, potentials);
            },
        }
    } else {
        let kab = kmat.gather(&amap, &node.data.skels);
        let w_skel = &node.data.w_skel;
        xgemm(
            Op::NoTrans,
            Op::NoTrans,
            1,
            nrhs,
            node.data.skels.len(),
            T::one(),
            kab.data(),
            1,
            w_skel.data(),
            w_skel.ld(),
            T::one(),
            potentials,
            1,
        );
    }
}

/// Symbolic twin of [`evaluate_point`]: no arithmetic, just a record of which
/// node prunes or directly covers the target. Prunable nodes collect the id
/// in their far-id set, non-prunable leaves in their near-id set; insertions
/// take the per-node lock so targets can be traversed concurrently.
pub(crate) fn evaluate_point_symbolic<T: Scalar>(
    tree: &Tree<T>,
    gid: usize,
    nnandi: &[usize],
    nn_prune: bool,
) {
    symbolic_on(tree, tree.root(), gid, nnandi, nn_prune);
}

fn symbolic_on<T: Scalar>(
    tree: &Tree<T>,
    beta: NodeId,
    gid: usize,
    nnandi: &[usize],
    nn_prune: bool,
) {
    let node = tree.node(beta);
    let prunable =
        node.data.isskel && !nnandi.iter().any(|&p| tree.contains_point(beta, p));

    if !prunable {
        match node.kids {
            None => {
                if nn_prune {
                    node.data.nn_near_ids.lock().insert(gid);
                } else {
                    node.data.near_ids.lock().insert(gid);
                }
            },
            Some([l, r]) => {
                symbolic_on(tree, l, gid, nnandi, nn_prune);
                symbolic_on(tree, r, gid, nnandi, nn_prune);
            },
        }
    } else if nn_prune {
        node.data.nn_far_ids.lock().insert(gid);
    } else {
        node.data.far_ids.lock().insert(gid);
    }
}

// ERROR PROBES
// ================================================================================================

/// Exact dense product `u = K * w^T` laid out like `w` (nrhs x n); the oracle
/// for the accuracy probes.
pub fn direct_evaluate<T, K>(kmat: &K, w: &Matrix<T>) -> Matrix<T>
where
    T: Scalar,
    K: SpdMatrix<T>,
{
    let n = kmat.size();
    let nrhs = w.nrows();
    let mut u = Matrix::zeros(nrhs, n);
    for (i, j) in iproduct!(0..n, 0..n) {
        let kij = kmat.entry(i, j);
        for r in 0..nrhs {
            u[(r, i)] = u[(r, i)] + kij * w[(r, j)];
        }
    }
    u
}

/// Relative l2 error of `potentials` against the exact row `K(gid, :) * w^T`.
pub(crate) fn compute_error<T, K>(kmat: &K, w: &Matrix<T>, gid: usize, potentials: &[T]) -> T
where
    T: Scalar,
    K: SpdMatrix<T>,
{
    let n = kmat.size();
    let nrhs = w.nrows();
    debug_assert_eq!(potentials.len(), nrhs);

    let mut exact = vec![T::zero(); nrhs];
    for j in 0..n {
        let kj = kmat.entry(gid, j);
        for r in 0..nrhs {
            exact[r] = exact[r] + kj * w[(r, j)];
        }
    }

    let mut err = T::zero();
    let mut nrm = T::zero();
    for r in 0..nrhs {
        let d = potentials[r] - exact[r];
        err = err + d * d;
        nrm = nrm + exact[r] * exact[r];
    }
    (err / nrm.max(T::min_positive_value())).sqrt()
}
