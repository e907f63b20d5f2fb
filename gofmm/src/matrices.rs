use hartree_linalg::{Matrix, Scalar};

// SPD MATRIX ABSTRACTION
// ================================================================================================

/// An SPD matrix the compression framework can sample.
///
/// Only three capabilities are required: the dimension, scalar element
/// access, and a dense gather of an arbitrary submatrix. Implementations may
/// be explicit (a stored dense matrix) or implicit (a kernel evaluated on
/// demand); the framework never assumes the full matrix fits in memory.
pub trait SpdMatrix<T: Scalar>: Sync {
    /// The matrix dimension `N`.
    fn size(&self) -> usize;

    /// The element `K(i, j)`.
    fn entry(&self, i: usize, j: usize) -> T;

    /// Gathers `K(imap, jmap)` as a dense `imap.len() x jmap.len()` matrix.
    fn gather(&self, imap: &[usize], jmap: &[usize]) -> Matrix<T> {
        let mut out = Matrix::zeros(imap.len(), jmap.len());
        for (jj, &j) in jmap.iter().enumerate() {
            for (ii, &i) in imap.iter().enumerate() {
                out[(ii, jj)] = self.entry(i, j);
            }
        }
        out
    }

    /// Squared kernel distance `K(i,i) + K(j,j) - 2 K(i,j)`, the metric the
    /// geometry-oblivious splitters and the neighbor search run on.
    fn kernel_distance(&self, i: usize, j: usize) -> T {
        let two = T::from_f64(2.0).unwrap();
        self.entry(i, i) + self.entry(j, j) - two * self.entry(i, j)
    }
}

// DENSE SPD MATRIX
// ================================================================================================

/// An explicitly stored SPD matrix.
#[derive(Debug, Clone)]
pub struct DenseSpd<T> {
    inner: Matrix<T>,
}

impl<T: Scalar> DenseSpd<T> {
    /// Wraps a symmetric matrix. Symmetry is the caller's responsibility.
    pub fn new(inner: Matrix<T>) -> Self {
        debug_assert_eq!(inner.nrows(), inner.ncols());
        Self { inner }
    }

    /// A random diagonally dominant SPD matrix, deterministic in `seed`.
    pub fn rand(n: usize, seed: u64) -> Self {
        Self { inner: Matrix::rand_spd(n, seed) }
    }

    pub fn inner(&self) -> &Matrix<T> {
        &self.inner
    }
}

impl<T: Scalar> SpdMatrix<T> for DenseSpd<T> {
    fn size(&self) -> usize {
        self.inner.nrows()
    }

    fn entry(&self, i: usize, j: usize) -> T {
        self.inner[(i, j)]
    }

    fn gather(&self, imap: &[usize], jmap: &[usize]) -> Matrix<T> {
        self.inner.gather(imap, jmap)
    }
}

// GAUSSIAN KERNEL MATRIX
// ================================================================================================

/// The implicit Gaussian kernel matrix of a point set: only the `d x n`
/// coordinates are stored and `K(i, j) = exp(-||x_i - x_j||^2 / (2 h^2))`.
#[derive(Debug, Clone)]
pub struct GaussianKernel<T> {
    points: Matrix<T>,
    scal: T,
}

impl<T: Scalar> GaussianKernel<T> {
    /// Builds the kernel over column-point coordinates with bandwidth `h`.
    pub fn new(points: Matrix<T>, bandwidth: T) -> Self {
        let half = T::from_f64(-0.5).unwrap();
        Self { points, scal: half / (bandwidth * bandwidth) }
    }

    pub fn num_points(&self) -> usize {
        self.points.ncols()
    }
}

impl<T: Scalar> SpdMatrix<T> for GaussianKernel<T> {
    fn size(&self) -> usize {
        self.points.ncols()
    }

    fn entry(&self, i: usize, j: usize) -> T {
        let xi = self.points.column(i);
        let xj = self.points.column(j);
        let mut dist2 = T::zero();
        for (&a, &b) in xi.iter().zip(xj.iter()) {
            let d = a - b;
            dist2 = dist2 + d * d;
        }
        (self.scal * dist2).exp()
    }
}

// TESTS
// ================================================================================================
