use hartree_linalg::Scalar;

use crate::{MR, NR, PACK_MR, PACK_NR};

// MICRO-KERNEL AUX DESCRIPTOR
// ================================================================================================

/// Per-invocation descriptor handed from the macro-kernel to a micro-kernel.
///
/// `pc == 0` marks the first K slab: the kernel must overwrite C instead of
/// accumulating. `ib`/`jb` are the live tile extents; when either is short
/// the macro-kernel supplies an `MR x NR` scratch tile, sets `do_pack_c`,
/// and gathers the corner itself. A kernel seeing `do_pack_c` must
/// accumulate into the provided tile unconditionally: the caller owns the
/// overwrite-vs-accumulate decision at gather time. `b_next` points at the
/// next packed B panel this worker will stream, for kernels that want to
/// issue software prefetch.
#[derive(Debug)]
pub struct MicroAux<'a, T> {
    pub pc: usize,
    pub ib: usize,
    pub jb: usize,
    pub b_next: Option<&'a [T]>,
    pub do_pack_c: bool,
}

// KERNEL CAPABILITIES
// ================================================================================================

/// Rank-k update micro-kernel: `C (+)= A_panel * B_panel` over `k` rank-one
/// updates, overwriting on the first slab.
///
/// `a` is a packed row panel (`k` steps of [`PACK_MR`] contiguous values),
/// `b` a packed column panel (`k` steps of [`PACK_NR`]).
pub trait SemiringKernel<T: Scalar>: Copy + Send + Sync {
    /// # Safety
    ///
    /// `c[jj * ldc + ii]` must be in bounds for `ii < MR`, `jj < NR`, and no
    /// other thread may touch that tile while the kernel runs. The
    /// macro-kernel's JR/IR sharding guarantees both.
    unsafe fn run(&self, k: usize, a: &[T], b: &[T], c: *mut T, ldc: usize, aux: &MicroAux<'_, T>);
}

/// Micro-kernel for the final K slab: the rank-k update fused with an
/// elementwise epilogue over the finished tile.
pub trait FusedKernel<T: Scalar>: Copy + Send + Sync {
    /// # Safety
    ///
    /// Same contract as [`SemiringKernel::run`].
    unsafe fn run(&self, k: usize, a: &[T], b: &[T], c: *mut T, ldc: usize, aux: &MicroAux<'_, T>);
}

/// Elementwise epilogue a fused kernel applies to the finished tile.
pub trait Epilogue<T: Scalar>: Copy + Send + Sync {
    fn apply(&self, x: T) -> T;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl<T: Scalar> Epilogue<T> for Identity {
    fn apply(&self, x: T) -> T {
        x
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Relu;

impl<T: Scalar> Epilogue<T> for Relu {
    fn apply(&self, x: T) -> T {
        x.max(T::zero())
    }
}

// REFERENCE KERNELS
// ================================================================================================

/// Accumulates the `MR x NR` rank-k product of two packed panels.
#[inline(always)]
fn rank_k_tile<T: Scalar>(k: usize, a: &[T], b: &[T]) -> [[T; MR]; NR] {
    debug_assert!(a.len() >= k * PACK_MR);
    debug_assert!(b.len() >= k * PACK_NR);

    let mut acc = [[T::zero(); MR]; NR];
    for l in 0..k {
        let ap = &a[l * PACK_MR..l * PACK_MR + MR];
        let bp = &b[l * PACK_NR..l * PACK_NR + NR];
        for (j, col) in acc.iter_mut().enumerate() {
            let bv = bp[j];
            for (i, out) in col.iter_mut().enumerate() {
                *out = *out + ap[i] * bv;
            }
        }
    }
    acc
}

/// The portable semiring kernel; no prescribed SIMD ABI, just the contract.
#[derive(Debug, Clone, Copy, Default)]
pub struct RankKSemiring;

impl<T: Scalar> SemiringKernel<T> for RankKSemiring {
    unsafe fn run(&self, k: usize, a: &[T], b: &[T], c: *mut T, ldc: usize, aux: &MicroAux<'_, T>) {
        let acc = rank_k_tile(k, a, b);
        let overwrite = aux.pc == 0 && !aux.do_pack_c;
        for (j, col) in acc.iter().enumerate() {
            for (i, &v) in col.iter().enumerate() {
                let out = unsafe { c.add(j * ldc + i) };
                if overwrite {
                    unsafe { out.write(v) };
                } else {
                    unsafe { out.write(out.read() + v) };
                }
            }
        }
    }
}

/// The portable fused kernel: rank-k update plus epilogue `E`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RankKFused<E> {
    epilogue: E,
}

impl<E> RankKFused<E> {
    pub fn new(epilogue: E) -> Self {
        Self { epilogue }
    }
}

impl<T: Scalar, E: Epilogue<T>> FusedKernel<T> for RankKFused<E> {
    unsafe fn run(&self, k: usize, a: &[T], b: &[T], c: *mut T, ldc: usize, aux: &MicroAux<'_, T>) {
        let acc = rank_k_tile(k, a, b);
        let overwrite = aux.pc == 0 && !aux.do_pack_c;
        for (j, col) in acc.iter().enumerate() {
            for (i, &v) in col.iter().enumerate() {
                let out = unsafe { c.add(j * ldc + i) };
                let total = if overwrite { v } else { (unsafe { out.read() }) + v };
                unsafe { out.write(self.epilogue.apply(total)) };
            }
        }
    }
}

// TESTS
// ================================================================================================
