use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::Scalar;

// DENSE MATRIX
// ================================================================================================

/// A dense column-major matrix.
///
/// The element at `(i, j)` lives at `data[j * nrows + i]`; the leading
/// dimension equals the row count. All the factorizations and kernels in the
/// workspace consume this layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix<T> {
    nrows: usize,
    ncols: usize,
    data: Vec<T>,
}

impl<T: Scalar> Matrix<T> {
    // CONSTRUCTORS
    // --------------------------------------------------------------------------------------------

    /// An `nrows x ncols` matrix of zeros.
    pub fn zeros(nrows: usize, ncols: usize) -> Self {
        Self { nrows, ncols, data: vec![T::zero(); nrows * ncols] }
    }

    /// Wraps an existing column-major buffer.
    ///
    /// # Panics
    ///
    /// Panics if `data.len() != nrows * ncols`.
    pub fn from_vec(nrows: usize, ncols: usize, data: Vec<T>) -> Self {
        assert_eq!(data.len(), nrows * ncols, "buffer does not match matrix shape");
        Self { nrows, ncols, data }
    }

    /// Uniform random entries in `[lo, hi)`, deterministic in `seed`.
    pub fn rand_uniform(nrows: usize, ncols: usize, lo: T, hi: T, seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let span = hi - lo;
        let data = (0..nrows * ncols)
            .map(|_| lo + span * T::from_f64(rng.random::<f64>()).unwrap())
            .collect();
        Self { nrows, ncols, data }
    }

    /// Standard-normal random entries (Box–Muller), deterministic in `seed`.
    pub fn randn(nrows: usize, ncols: usize, seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let data = (0..nrows * ncols)
            .map(|_| {
                let u1: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
                let u2: f64 = rng.random::<f64>();
                let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
                T::from_f64(z).unwrap()
            })
            .collect();
        Self { nrows, ncols, data }
    }

    /// A random diagonally dominant SPD matrix: the symmetric part of a
    /// uniform random matrix with `n` added on the diagonal.
    pub fn rand_spd(n: usize, seed: u64) -> Self {
        let raw = Self::rand_uniform(n, n, T::zero(), T::one(), seed);
        let mut spd = Self::zeros(n, n);
        let half = T::from_f64(0.5).unwrap();
        for j in 0..n {
            for i in 0..n {
                spd[(i, j)] = half * (raw[(i, j)] + raw[(j, i)]);
            }
            spd[(j, j)] = spd[(j, j)] + T::from_usize(n).unwrap();
        }
        spd
    }

    // ACCESSORS
    // --------------------------------------------------------------------------------------------

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    /// Leading dimension of the column-major buffer.
    pub fn ld(&self) -> usize {
        self.nrows
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Borrows column `j` as a contiguous slice.
    pub fn column(&self, j: usize) -> &[T] {
        &self.data[j * self.nrows..(j + 1) * self.nrows]
    }

    // GATHERS
    // --------------------------------------------------------------------------------------------

    /// Gathers the submatrix addressed by row ids `imap` and column ids
    /// `jmap` into a fresh dense matrix.
    pub fn gather(&self, imap: &[usize], jmap: &[usize]) -> Matrix<T> {
        let mut out = Matrix::zeros(imap.len(), jmap.len());
        for (jj, &j) in jmap.iter().enumerate() {
            for (ii, &i) in imap.iter().enumerate() {
                out[(ii, jj)] = self[(i, j)];
            }
        }
        out
    }

    /// Gathers whole columns, preserving row count.
    pub fn gather_columns(&self, jmap: &[usize]) -> Matrix<T> {
        let mut out = Matrix::zeros(self.nrows, jmap.len());
        for (jj, &j) in jmap.iter().enumerate() {
            out.data[jj * self.nrows..(jj + 1) * self.nrows].copy_from_slice(self.column(j));
        }
        out
    }

    /// Scatter-adds `block` (shaped `imap.len() x ncols`) into the rows
    /// addressed by `imap`.
    pub fn scatter_add_rows(&mut self, imap: &[usize], block: &Matrix<T>) {
        debug_assert_eq!(block.nrows(), imap.len());
        debug_assert_eq!(block.ncols(), self.ncols);
        for j in 0..self.ncols {
            for (ii, &i) in imap.iter().enumerate() {
                self[(i, j)] = self[(i, j)] + block[(ii, j)];
            }
        }
    }
}

impl<T> core::ops::Index<(usize, usize)> for Matrix<T> {
    type Output = T;

    fn index(&self, (i, j): (usize, usize)) -> &T {
        debug_assert!(i < self.nrows && j < self.ncols);
        &self.data[j * self.nrows + i]
    }
}

impl<T> core::ops::IndexMut<(usize, usize)> for Matrix<T> {
    fn index_mut(&mut self, (i, j): (usize, usize)) -> &mut T {
        debug_assert!(i < self.nrows && j < self.ncols);
        &mut self.data[j * self.nrows + i]
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn column_major_indexing() {
        let m = Matrix::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(m[(0, 0)], 1.0);
        assert_eq!(m[(1, 0)], 2.0);
        assert_eq!(m[(0, 2)], 5.0);
        assert_eq!(m.column(1), &[3.0, 4.0]);
    }

    #[test]
    fn gather_matches_direct_indexing() {
        let m = Matrix::<f64>::rand_uniform(6, 6, -1.0, 1.0, 7);
        let sub = m.gather(&[4, 0, 2], &[5, 1]);
        assert_eq!(sub.nrows(), 3);
        assert_eq!(sub.ncols(), 2);
        assert_eq!(sub[(0, 0)], m[(4, 5)]);
        assert_eq!(sub[(2, 1)], m[(2, 1)]);
    }

    #[test]
    fn rand_spd_is_symmetric_and_dominant() {
        let k = Matrix::<f64>::rand_spd(16, 3);
        for i in 0..16 {
            for j in 0..16 {
                assert_eq!(k[(i, j)], k[(j, i)]);
            }
            let off: f64 = (0..16).filter(|&j| j != i).map(|j| k[(i, j)].abs()).sum();
            assert!(k[(i, i)] > off);
        }
    }

    #[test]
    fn seeds_are_deterministic() {
        let a = Matrix::<f32>::randn(4, 4, 11);
        let b = Matrix::<f32>::randn(4, 4, 11);
        assert_eq!(a, b);
    }
}
