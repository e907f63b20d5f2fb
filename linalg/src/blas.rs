use crate::Scalar;

// REFERENCE BLAS
// ================================================================================================

/// Whether an operand enters the product transposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    NoTrans,
    Trans,
}

/// `C := alpha * op(A) * op(B) + beta * C` on column-major storage.
///
/// Standard BLAS GEMM semantics: `op(A)` is `m x k`, `op(B)` is `k x n`, `C`
/// is `m x n` with leading dimension `ldc`. This is the reference
/// instantiation the workspace links against; it favors clarity over speed
/// and is the oracle the blocked engine is tested against.
#[allow(clippy::too_many_arguments)]
pub fn xgemm<T: Scalar>(
    transa: Op,
    transb: Op,
    m: usize,
    n: usize,
    k: usize,
    alpha: T,
    a: &[T],
    lda: usize,
    b: &[T],
    ldb: usize,
    beta: T,
    c: &mut [T],
    ldc: usize,
) {
    let at = |i: usize, l: usize| match transa {
        Op::NoTrans => a[l * lda + i],
        Op::Trans => a[i * lda + l],
    };
    let bt = |l: usize, j: usize| match transb {
        Op::NoTrans => b[j * ldb + l],
        Op::Trans => b[l * ldb + j],
    };

    for j in 0..n {
        for i in 0..m {
            let mut acc = T::zero();
            for l in 0..k {
                acc = acc + at(i, l) * bt(l, j);
            }
            let out = &mut c[j * ldc + i];
            *out = if beta == T::zero() { alpha * acc } else { alpha * acc + beta * *out };
        }
    }
}

/// Frobenius norm of an `m x n` column-major block with leading dimension
/// `lda`.
pub fn frobenius_norm<T: Scalar>(m: usize, n: usize, a: &[T], lda: usize) -> T {
    let mut acc = T::zero();
    for j in 0..n {
        for i in 0..m {
            let x = a[j * lda + i];
            acc = acc + x * x;
        }
    }
    acc.sqrt()
}

// TESTS
// ================================================================================================
