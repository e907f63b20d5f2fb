use tracing::debug;

use crate::{Matrix, Scalar};

// INTERPOLATIVE DECOMPOSITION
// ================================================================================================

/// Result of an interpolative decomposition of an `m x n` matrix `A`:
/// a set of representative columns and the interpolation matrix such that
/// `A ≈ A[:, skels] * proj`.
///
/// `skels` holds column indices local to the decomposed matrix; `proj` is
/// `skels.len() x n` and restricted to the skeleton columns it is the
/// identity. An empty `skels` signals that the requested tolerance was not
/// reachable within the rank cap (the adaptive path's failure channel; never
/// produced by the fixed-rank path).
#[derive(Debug, Clone)]
pub struct Interpolative<T> {
    pub skels: Vec<usize>,
    pub proj: Matrix<T>,
}

impl<T: Scalar> Interpolative<T> {
    fn failed(ncols: usize) -> Self {
        Self { skels: Vec::new(), proj: Matrix::zeros(0, ncols) }
    }
}

/// Adaptive-rank interpolative decomposition.
///
/// Runs a column-pivoted Householder QR and stops as soon as the pivot
/// magnitude drops to `stol` relative to the first pivot. If the drop does
/// not happen within `max_rank` steps and unresolved columns remain, the
/// decomposition reports failure through an empty skeleton set.
pub fn id_adaptive<T: Scalar>(max_rank: usize, stol: T, kab: &Matrix<T>) -> Interpolative<T> {
    pivoted_id(kab, max_rank, Some(stol))
}

/// Fixed-rank interpolative decomposition.
///
/// Always selects `min(rank, m, n)` skeleton columns; the reconstruction is
/// best-effort at that rank and failure is never signalled.
pub fn id_fixed<T: Scalar>(rank: usize, kab: &Matrix<T>) -> Interpolative<T> {
    pivoted_id(kab, rank, None)
}

/// Column-pivoted QR driver shared by both entry points.
fn pivoted_id<T: Scalar>(kab: &Matrix<T>, max_rank: usize, stol: Option<T>) -> Interpolative<T> {
    let m = kab.nrows();
    let n = kab.ncols();
    let r_limit = max_rank.min(m).min(n);

    let mut work = kab.clone();
    let mut perm: Vec<usize> = (0..n).collect();
    let mut first_pivot = T::zero();
    let mut rank = r_limit;

    for j in 0..r_limit {
        // Exact residual norms of the trailing columns; the blocks are small
        // (2s x s at most), so the O(mn) rescan per step is preferable to a
        // downdating scheme that can lose accuracy.
        let (piv, piv_norm) = trailing_pivot(&work, j);

        if j == 0 {
            first_pivot = piv_norm;
        }
        if let Some(tol) = stol {
            if piv_norm <= tol * first_pivot {
                rank = j;
                break;
            }
        }

        if piv != j {
            swap_columns(&mut work, j, piv);
            perm.swap(j, piv);
        }
        householder_step(&mut work, j);
    }

    // The adaptive path fails when the cap is hit while trailing columns
    // still carry mass above the tolerance.
    if let Some(tol) = stol {
        if rank == r_limit && rank < n {
            let (_, residual) = trailing_pivot(&work, rank);
            if residual > tol * first_pivot {
                debug!(rank, n, "tolerance unreachable within rank cap");
                return Interpolative::failed(n);
            }
        }
    }

    let skels: Vec<usize> = perm[..rank].to_vec();
    let proj = interpolation_matrix(&work, &perm, rank, n);
    Interpolative { skels, proj }
}

/// Finds the trailing column (index >= `j`) with the largest residual norm
/// below row `j`.
fn trailing_pivot<T: Scalar>(work: &Matrix<T>, j: usize) -> (usize, T) {
    let m = work.nrows();
    let n = work.ncols();
    let mut piv = j;
    let mut best = T::zero();
    for col in j..n {
        let mut acc = T::zero();
        for row in j..m {
            let x = work[(row, col)];
            acc = acc + x * x;
        }
        let norm = acc.sqrt();
        if norm > best {
            best = norm;
            piv = col;
        }
    }
    (piv, best)
}

fn swap_columns<T: Scalar>(work: &mut Matrix<T>, a: usize, b: usize) {
    let m = work.nrows();
    for row in 0..m {
        let tmp = work[(row, a)];
        work[(row, a)] = work[(row, b)];
        work[(row, b)] = tmp;
    }
}

/// Applies the Householder reflector that zeroes column `j` below the
/// diagonal to every trailing column, then writes the diagonal entry.
fn householder_step<T: Scalar>(work: &mut Matrix<T>, j: usize) {
    let m = work.nrows();
    let n = work.ncols();

    let mut norm = T::zero();
    for row in j..m {
        let x = work[(row, j)];
        norm = norm + x * x;
    }
    let norm = norm.sqrt();
    if norm == T::zero() {
        return;
    }

    let x0 = work[(j, j)];
    let alpha = if x0 >= T::zero() { -norm } else { norm };

    // v = x - alpha * e1, kept in place of column j below the diagonal.
    let mut vnorm2 = T::zero();
    work[(j, j)] = x0 - alpha;
    for row in j..m {
        let v = work[(row, j)];
        vnorm2 = vnorm2 + v * v;
    }

    if vnorm2 > T::zero() {
        let two = T::from_f64(2.0).unwrap();
        for col in j + 1..n {
            let mut dot = T::zero();
            for row in j..m {
                dot = dot + work[(row, j)] * work[(row, col)];
            }
            let scale = two * dot / vnorm2;
            for row in j..m {
                let v = work[(row, j)];
                work[(row, col)] = work[(row, col)] - scale * v;
            }
        }
    }

    work[(j, j)] = alpha;
}

/// Builds `proj = R11^{-1} [I | R12]` scattered back to the original column
/// order, so that `A[:, skels] * proj` approximates `A`.
fn interpolation_matrix<T: Scalar>(
    work: &Matrix<T>,
    perm: &[usize],
    rank: usize,
    n: usize,
) -> Matrix<T> {
    let mut proj = Matrix::zeros(rank, n);

    // Skeleton columns interpolate themselves.
    for (i, &col) in perm[..rank].iter().enumerate() {
        proj[(i, col)] = T::one();
    }

    // Back-substitute R11 * x = R12 per redundant column.
    for c in rank..n {
        let mut x = vec![T::zero(); rank];
        for i in 0..rank {
            x[i] = work[(i, c)];
        }
        for i in (0..rank).rev() {
            for t in i + 1..rank {
                x[i] = x[i] - work[(i, t)] * x[t];
            }
            let rii = work[(i, i)];
            x[i] = if rii.abs() > T::epsilon() { x[i] / rii } else { T::zero() };
        }
        for i in 0..rank {
            proj[(i, perm[c])] = x[i];
        }
    }

    proj
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{frobenius_norm, xgemm, Op};

    /// `A[:, skels] * proj` against `A` in the Frobenius norm.
    fn reconstruction_error(a: &Matrix<f64>, id: &Interpolative<f64>) -> f64 {
        let m = a.nrows();
        let n = a.ncols();
        let cols = a.gather((0..m).collect::<Vec<_>>().as_slice(), &id.skels);
        let mut approx = a.clone();
        xgemm(
            Op::NoTrans,
            Op::NoTrans,
            m,
            n,
            id.skels.len(),
            -1.0,
            cols.data(),
            cols.ld(),
            id.proj.data(),
            id.proj.ld(),
            1.0,
            approx.data_mut(),
            m,
        );
        frobenius_norm(m, n, approx.data(), m) / frobenius_norm(m, n, a.data(), m)
    }

    /// Rank-`r` test matrix `U * V` with well-separated singular values.
    fn low_rank(m: usize, n: usize, r: usize, seed: u64) -> Matrix<f64> {
        let u = Matrix::<f64>::randn(m, r, seed);
        let v = Matrix::<f64>::randn(r, n, seed + 1);
        let mut a = Matrix::zeros(m, n);
        xgemm(
            Op::NoTrans,
            Op::NoTrans,
            m,
            n,
            r,
            1.0,
            u.data(),
            u.ld(),
            v.data(),
            v.ld(),
            0.0,
            a.data_mut(),
            m,
        );
        a
    }

    #[test]
    fn adaptive_recovers_numerical_rank() {
        let a = low_rank(40, 24, 5, 17);
        let id = id_adaptive(20, 1e-10, &a);
        assert_eq!(id.skels.len(), 5);
        assert!(reconstruction_error(&a, &id) < 1e-8);
    }

    #[test]
    fn skeleton_columns_interpolate_themselves() {
        let a = low_rank(30, 16, 4, 3);
        let id = id_adaptive(8, 1e-10, &a);
        for (i, &col) in id.skels.iter().enumerate() {
            for row in 0..id.skels.len() {
                let expect = if row == i { 1.0 } else { 0.0 };
                assert!((id.proj[(row, col)] - expect).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn adaptive_fails_on_full_rank_noise() {
        let a = Matrix::<f64>::randn(32, 32, 9);
        let id = id_adaptive(4, 1e-12, &a);
        assert!(id.skels.is_empty());
        assert_eq!(id.proj.nrows(), 0);
    }

    #[test]
    fn fixed_rank_never_fails() {
        let a = Matrix::<f64>::randn(32, 32, 9);
        let id = id_fixed(4, &a);
        assert_eq!(id.skels.len(), 4);
        assert_eq!(id.proj.nrows(), 4);
        assert_eq!(id.proj.ncols(), 32);
    }

    #[test]
    fn fixed_rank_is_exact_when_rank_covers_the_matrix() {
        let a = low_rank(20, 10, 3, 5);
        let id = id_fixed(10, &a);
        assert_eq!(id.skels.len(), 10);
        assert!(reconstruction_error(&a, &id) < 1e-8);
    }
}
