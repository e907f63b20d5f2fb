use hartree_linalg::Scalar;
use hartree_runtime::{CommShape, PackBuffer, RuntimeError, ThreadComm, Worker};
use tracing::{debug, instrument};

use crate::range::BlockRange;
use crate::{
    EngineError, FusedKernel, MicroAux, RankKFused, RankKSemiring, SemiringKernel, ALIGN_SIZE, KC,
    MC, MR, NC, NR, PACK_MC, PACK_MR, PACK_NC, PACK_NR,
};

// ENGINE CONFIGURATION
// ================================================================================================

/// Configuration of one engine call.
///
/// With `shape == None` the thread team is read from the environment
/// (`HARTREE_JC_NT` / `HARTREE_IC_NT` / `HARTREE_JR_NT`, PC fixed at 1).
/// `use_strassen` exists for interface parity only: requesting it is fatal.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub shape: Option<CommShape>,
    pub use_strassen: bool,
}

impl EngineConfig {
    pub(crate) fn resolve_shape(&self) -> Result<CommShape, EngineError> {
        if self.use_strassen {
            return Err(EngineError::StrassenUnsupported);
        }
        let shape = match self.shape {
            Some(shape) => shape,
            None => CommShape::from_env()?,
        };
        if shape.pc_nt != 1 {
            // The K loop is not sharded; a PC fan-out other than 1 would race.
            return Err(RuntimeError::InvalidCommShape {
                jc_nt: shape.jc_nt,
                pc_nt: shape.pc_nt,
                ic_nt: shape.ic_nt,
                jr_nt: shape.jr_nt,
            }
            .into());
        }
        Ok(shape)
    }

    /// JC-aware N blocking: with more than one JC group the block is sized so
    /// every group receives an NR-aligned share of N.
    pub(crate) fn blocking(shape: &CommShape, n: usize) -> (usize, usize) {
        if shape.jc_nt > 1 {
            let nc = ((n - 1) / (NR * shape.jc_nt) + 1) * NR;
            (nc, (nc / NR) * PACK_NR)
        } else {
            (NC, PACK_NC)
        }
    }
}

// SHARED POINTERS
// ================================================================================================

/// Raw operand pointers shared across the team.
///
/// Workers read A/B anywhere but write only their own C tiles and their own
/// packed-panel slices; the worker-origin arithmetic in `gemm_internal` is
/// the disjointness proof.
#[derive(Clone, Copy)]
pub(crate) struct SharedConst<T>(pub *const T);

unsafe impl<T: Send + Sync> Send for SharedConst<T> {}
unsafe impl<T: Send + Sync> Sync for SharedConst<T> {}

#[derive(Clone, Copy)]
pub(crate) struct SharedMut<T>(pub *mut T);

unsafe impl<T: Send + Sync> Send for SharedMut<T> {}
unsafe impl<T: Send + Sync> Sync for SharedMut<T> {}

// PACKING
// ================================================================================================

/// Packs one `mr_loc x pb` slice of A into a `PACK_MR`-wide row panel.
///
/// Within the panel each k step stores `PACK_MR` contiguous values; short
/// panels are zero padded so the micro-kernel never branches on `ib`.
///
/// # Safety
///
/// `src` must address a column-major block with `mr_loc` rows and `pb`
/// columns at leading dimension `lda`.
pub(crate) unsafe fn pack_a_panel<T: Scalar>(
    mr_loc: usize,
    pb: usize,
    src: *const T,
    lda: usize,
    dst: &mut [T],
) {
    debug_assert!(dst.len() >= pb * PACK_MR);
    for kk in 0..pb {
        let panel = &mut dst[kk * PACK_MR..(kk + 1) * PACK_MR];
        for (ii, out) in panel.iter_mut().enumerate() {
            *out = if ii < mr_loc { unsafe { src.add(kk * lda + ii).read() } } else { T::zero() };
        }
    }
}

/// Packs one `pb x jb_loc` slice of B into a `PACK_NR`-wide column panel.
///
/// # Safety
///
/// `src` must address a column-major block with `pb` rows and `jb_loc`
/// columns at leading dimension `ldb`.
pub(crate) unsafe fn pack_b_panel<T: Scalar>(
    jb_loc: usize,
    pb: usize,
    src: *const T,
    ldb: usize,
    dst: &mut [T],
) {
    debug_assert!(dst.len() >= pb * PACK_NR);
    for kk in 0..pb {
        let panel = &mut dst[kk * PACK_NR..(kk + 1) * PACK_NR];
        for (jj, out) in panel.iter_mut().enumerate() {
            *out = if jj < jb_loc { unsafe { src.add(jj * ldb + kk).read() } } else { T::zero() };
        }
    }
}

// MACRO-KERNELS
// ================================================================================================

/// Rank-k macro-kernel: streams `NR`-wide B panels (sharded by `jr_id`)
/// against `MR`-wide A panels and invokes the semiring micro-kernel per tile.
///
/// # Safety
///
/// `c` must address an `m x n` column-major tile at leading dimension `ldc`
/// that no other worker touches during this call, and the packed panels must
/// cover `k` steps each.
#[allow(clippy::too_many_arguments)]
pub(crate) unsafe fn rank_k_macro_kernel<T: Scalar, SK: SemiringKernel<T>>(
    worker: &Worker<'_>,
    pc: usize,
    m: usize,
    n: usize,
    k: usize,
    a_panels: &[T],
    a_panel_stride: usize,
    b_panels: &[T],
    c: *mut T,
    ldc: usize,
    semiringkernel: SK,
) {
    let jr_step = worker.ic_comm.num_threads();

    for j in BlockRange::new(n, NR, worker.jr_id, jr_step) {
        let jb = n - j;
        let b_panel = &b_panels[(j / NR) * PACK_NR * k..];
        let next = j + jr_step * NR;
        let b_next = (next < n).then(|| &b_panels[(next / NR) * PACK_NR * k..]);

        for i in BlockRange::full(m, MR) {
            let ib = m - i;
            let aux = MicroAux {
                pc,
                ib: ib.min(MR),
                jb: jb.min(NR),
                b_next,
                do_pack_c: ib < MR || jb < NR,
            };
            let a_panel = &a_panels[(i / MR) * a_panel_stride..];

            if !aux.do_pack_c {
                let tile = unsafe { c.add(j * ldc + i) };
                unsafe { semiringkernel.run(k, a_panel, b_panel, tile, ldc, &aux) };
            } else {
                // Corner case: the kernel folds into a zeroed scratch tile
                // and the live `ib x jb` region is gathered here.
                let mut ctmp = [T::zero(); MR * NR];
                unsafe { semiringkernel.run(k, a_panel, b_panel, ctmp.as_mut_ptr(), MR, &aux) };
                for jj in 0..aux.jb {
                    for ii in 0..aux.ib {
                        let out = unsafe { c.add((j + jj) * ldc + i + ii) };
                        let v = ctmp[jj * MR + ii];
                        if pc > 0 {
                            unsafe { out.write(out.read() + v) };
                        } else {
                            unsafe { out.write(v) };
                        }
                    }
                }
            }
        }
    }
}

/// Fused macro-kernel for the final K slab.
///
/// Identical traversal to [`rank_k_macro_kernel`]; corners preload the prior
/// C values into the scratch tile so the epilogue sees fully accumulated
/// results, and the gather writes back by assignment.
///
/// # Safety
///
/// Same contract as [`rank_k_macro_kernel`].
#[allow(clippy::too_many_arguments)]
pub(crate) unsafe fn fused_macro_kernel<T: Scalar, FK: FusedKernel<T>>(
    worker: &Worker<'_>,
    pc: usize,
    m: usize,
    n: usize,
    k: usize,
    a_panels: &[T],
    a_panel_stride: usize,
    b_panels: &[T],
    c: *mut T,
    ldc: usize,
    microkernel: FK,
) {
    let jr_step = worker.ic_comm.num_threads();

    for j in BlockRange::new(n, NR, worker.jr_id, jr_step) {
        let jb = n - j;
        let b_panel = &b_panels[(j / NR) * PACK_NR * k..];
        let next = j + jr_step * NR;
        let b_next = (next < n).then(|| &b_panels[(next / NR) * PACK_NR * k..]);

        for i in BlockRange::full(m, MR) {
            let ib = m - i;
            let aux = MicroAux {
                pc,
                ib: ib.min(MR),
                jb: jb.min(NR),
                b_next,
                do_pack_c: ib < MR || jb < NR,
            };
            let a_panel = &a_panels[(i / MR) * a_panel_stride..];

            if !aux.do_pack_c {
                let tile = unsafe { c.add(j * ldc + i) };
                unsafe { microkernel.run(k, a_panel, b_panel, tile, ldc, &aux) };
            } else {
                let mut ctmp = [T::zero(); MR * NR];
                if pc > 0 {
                    for jj in 0..aux.jb {
                        for ii in 0..aux.ib {
                            ctmp[jj * MR + ii] = unsafe { c.add((j + jj) * ldc + i + ii).read() };
                        }
                    }
                }
                unsafe { microkernel.run(k, a_panel, b_panel, ctmp.as_mut_ptr(), MR, &aux) };
                for jj in 0..aux.jb {
                    for ii in 0..aux.ib {
                        unsafe { c.add((j + jj) * ldc + i + ii).write(ctmp[jj * MR + ii]) };
                    }
                }
            }
        }
    }
}

// SIX-LOOP DRIVER
// ================================================================================================

/// One worker's share of the six-loop blocked multiplication.
///
/// # Safety
///
/// `a`/`b`/`c` must address column-major matrices of the stated shapes; every
/// worker of the team must run this function with the same arguments.
#[allow(clippy::too_many_arguments)]
unsafe fn gemm_internal<T: Scalar, SK: SemiringKernel<T>, FK: FusedKernel<T>>(
    worker: &Worker<'_>,
    m: usize,
    n: usize,
    k: usize,
    a: SharedConst<T>,
    lda: usize,
    b: SharedConst<T>,
    ldb: usize,
    c: SharedMut<T>,
    ldc: usize,
    semiringkernel: SK,
    microkernel: FK,
    nc: usize,
    pack_nc: usize,
    pack_a_buf: &PackBuffer<T>,
    pack_b_buf: &PackBuffer<T>,
) {
    // Worker origins into the shared pack buffers; see the disjointness note
    // on [`SharedConst`].
    let a_origin = (worker.jc_id * worker.ic_nt + worker.ic_id) * PACK_MC * KC;
    let b_origin = worker.jc_id * pack_nc * KC;

    for jc in BlockRange::new(n, nc, worker.jc_id, worker.jc_nt) {
        let jb = (n - jc).min(nc);

        for pc in BlockRange::full(k, KC) {
            let pb = (k - pc).min(KC);
            let is_last_pc = pc + KC >= k;

            // Pack B across all lanes of the PC group.
            for j in BlockRange::new(jb, NR, worker.ic_jr, worker.pc_comm.num_threads()) {
                let jb_loc = (jb - j).min(NR);
                let dst =
                    unsafe { pack_b_buf.slice_mut(b_origin + (j / NR) * PACK_NR * pb, PACK_NR * pb) };
                let src = unsafe { b.0.add((jc + j) * ldb + pc) };
                unsafe { pack_b_panel(jb_loc, pb, src, ldb, dst) };
            }
            worker.pc_comm.barrier();

            for ic in BlockRange::new(m, MC, worker.ic_id, worker.ic_nt) {
                let ib = (m - ic).min(MC);
                let a_panel_count = ib.div_ceil(MR);

                // Pack A across the JR lanes of this IC group.
                for i in BlockRange::new(ib, MR, worker.jr_id, worker.jr_nt) {
                    let mr_loc = (ib - i).min(MR);
                    let dst = unsafe {
                        pack_a_buf.slice_mut(a_origin + (i / MR) * PACK_MR * pb, PACK_MR * pb)
                    };
                    let src = unsafe { a.0.add(pc * lda + ic + i) };
                    unsafe { pack_a_panel(mr_loc, pb, src, lda, dst) };
                }
                worker.ic_comm.barrier();

                let a_panels =
                    unsafe { pack_a_buf.slice(a_origin, a_panel_count * PACK_MR * pb) };
                let b_panels =
                    unsafe { pack_b_buf.slice(b_origin, jb.div_ceil(NR) * PACK_NR * pb) };
                let c_tile = unsafe { c.0.add(jc * ldc + ic) };

                if is_last_pc {
                    unsafe {
                        fused_macro_kernel(
                            worker,
                            pc,
                            ib,
                            jb,
                            pb,
                            a_panels,
                            PACK_MR * pb,
                            b_panels,
                            c_tile,
                            ldc,
                            microkernel,
                        )
                    };
                } else {
                    unsafe {
                        rank_k_macro_kernel(
                            worker,
                            pc,
                            ib,
                            jb,
                            pb,
                            a_panels,
                            PACK_MR * pb,
                            b_panels,
                            c_tile,
                            ldc,
                            semiringkernel,
                        )
                    };
                }
                worker.ic_comm.barrier();
            }
            worker.pc_comm.barrier();
        }
    }
}

// PUBLIC ENTRY
// ================================================================================================

/// `C := A * B` for column-major matrices, blocked and threaded per the
/// engine configuration.
///
/// The first K slab overwrites C, so no zeroing of the output is required.
///
/// # Errors
///
/// Fails on a Strassen request, an invalid thread configuration, or packed
/// scratch allocation failure.
#[instrument(skip_all, fields(m = m, n = n, k = k))]
#[allow(clippy::too_many_arguments)]
pub fn gemm<T: Scalar>(
    config: &EngineConfig,
    m: usize,
    n: usize,
    k: usize,
    a: &[T],
    lda: usize,
    b: &[T],
    ldb: usize,
    c: &mut [T],
    ldc: usize,
) -> Result<(), EngineError> {
    let shape = config.resolve_shape()?;

    if m == 0 || n == 0 {
        return Ok(());
    }
    if k == 0 {
        // Degenerate product: the overwriting first slab never runs.
        for j in 0..n {
            c[j * ldc..j * ldc + m].fill(T::zero());
        }
        return Ok(());
    }

    debug_assert!(lda >= m && ldb >= k && ldc >= m);
    debug_assert!(a.len() >= lda * (k - 1) + m);
    debug_assert!(b.len() >= ldb * (n - 1) + k);
    debug_assert!(c.len() >= ldc * (n - 1) + m);

    let (nc, pack_nc) = EngineConfig::blocking(&shape, n);
    let pack_a_buf =
        PackBuffer::<T>::new(KC * (PACK_MC + 1) * shape.jc_nt * shape.ic_nt, ALIGN_SIZE)?;
    let pack_b_buf = PackBuffer::<T>::new(KC * (pack_nc + 1) * shape.jc_nt, ALIGN_SIZE)?;
    let comm = ThreadComm::new(shape.jc_nt, shape.pc_nt, shape.ic_nt, shape.jr_nt)?;
    debug!(threads = comm.num_threads(), nc, "entering parallel region");

    let a_ptr = SharedConst(a.as_ptr());
    let b_ptr = SharedConst(b.as_ptr());
    let c_ptr = SharedMut(c.as_mut_ptr());
    let semiring = RankKSemiring;
    let fused = RankKFused::new(crate::Identity);

    std::thread::scope(|scope| {
        let comm = &comm;
        let pack_a_buf = &pack_a_buf;
        let pack_b_buf = &pack_b_buf;

        for tid in 1..comm.num_threads() {
            scope.spawn(move || {
                let worker = Worker::new(tid, comm);
                // SAFETY: operand shapes were validated above; slice
                // disjointness follows from the worker origins.
                unsafe {
                    gemm_internal(
                        &worker, m, n, k, a_ptr, lda, b_ptr, ldb, c_ptr, ldc, semiring, fused,
                        nc, pack_nc, pack_a_buf, pack_b_buf,
                    )
                };
            });
        }

        let worker = Worker::new(0, comm);
        // SAFETY: as above.
        unsafe {
            gemm_internal(
                &worker, m, n, k, a_ptr, lda, b_ptr, ldb, c_ptr, ldc, semiring, fused, nc,
                pack_nc, pack_a_buf, pack_b_buf,
            )
        };
    });

    Ok(())
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use hartree_linalg::{xgemm, Matrix, Op};
    use rstest::rstest;

    use super::*;

    fn reference_product(m: usize, n: usize, k: usize, a: &Matrix<f64>, b: &Matrix<f64>) -> Matrix<f64> {
        let mut c = Matrix::zeros(m, n);
        xgemm(
            Op::NoTrans,
            Op::NoTrans,
            m,
            n,
            k,
            1.0,
            a.data(),
            a.ld(),
            b.data(),
            b.ld(),
            0.0,
            c.data_mut(),
            m,
        );
        c
    }

    fn assert_close(actual: &Matrix<f64>, expect: &Matrix<f64>, tol: f64) {
        for j in 0..expect.ncols() {
            for i in 0..expect.nrows() {
                let denom = expect[(i, j)].abs().max(1.0);
                assert!(
                    ((actual[(i, j)] - expect[(i, j)]) / denom).abs() < tol,
                    "mismatch at ({i}, {j}): {} vs {}",
                    actual[(i, j)],
                    expect[(i, j)],
                );
            }
        }
    }

    fn run_gemm(m: usize, n: usize, k: usize, shape: CommShape, seed: u64) {
        let a = Matrix::<f64>::rand_uniform(m, k, -1.0, 1.0, seed);
        let b = Matrix::<f64>::rand_uniform(k, n, -1.0, 1.0, seed + 1);
        let mut c = Matrix::from_vec(m, n, vec![f64::NAN; m * n]);

        let config = EngineConfig { shape: Some(shape), use_strassen: false };
        gemm(&config, m, n, k, a.data(), m, b.data(), k, c.data_mut(), m).unwrap();

        assert_close(&c, &reference_product(m, n, k, &a, &b), 1e-12);
    }

    #[test]
    fn single_thread_square() {
        run_gemm(64, 64, 64, CommShape::default(), 11);
    }

    #[rstest]
    #[case(1, 1, 1)]
    #[case(7, 3, 5)]
    #[case(8, 4, 256)]
    #[case(72, 80, 256)]
    #[case(73, 81, 257)] // one past every blocking boundary
    #[case(130, 61, 530)] // multiple K slabs with corners
    fn single_thread_odd_shapes(#[case] m: usize, #[case] n: usize, #[case] k: usize) {
        run_gemm(m, n, k, CommShape::default(), m as u64 * 31 + n as u64);
    }

    #[rstest]
    #[case(2, 1, 2, 1)]
    #[case(2, 1, 2, 2)]
    #[case(1, 1, 1, 4)]
    #[case(4, 1, 1, 1)]
    fn threaded_matches_reference(
        #[case] jc_nt: usize,
        #[case] pc_nt: usize,
        #[case] ic_nt: usize,
        #[case] jr_nt: usize,
    ) {
        let shape = CommShape { jc_nt, pc_nt, ic_nt, jr_nt };
        run_gemm(150, 170, 96, shape, 5);
        run_gemm(256, 256, 300, shape, 6);
    }

    #[test]
    fn k_zero_zeroes_the_output() {
        let mut c = Matrix::from_vec(2, 2, vec![3.0; 4]);
        let config = EngineConfig::default();
        gemm::<f64>(&config, 2, 2, 0, &[], 2, &[], 1, c.data_mut(), 2).unwrap();
        assert!(c.data().iter().all(|&x| x == 0.0));
    }

    #[test]
    fn strassen_request_is_fatal() {
        let config = EngineConfig { shape: None, use_strassen: true };
        let mut c = [0.0f64; 1];
        let err = gemm(&config, 1, 1, 1, &[1.0], 1, &[1.0], 1, &mut c, 1).unwrap_err();
        assert!(matches!(err, EngineError::StrassenUnsupported));
    }

    #[test]
    fn pc_parallelism_is_rejected() {
        let shape = CommShape { jc_nt: 1, pc_nt: 2, ic_nt: 1, jr_nt: 1 };
        let config = EngineConfig { shape: Some(shape), use_strassen: false };
        let mut c = [0.0f64; 1];
        assert!(gemm(&config, 1, 1, 1, &[1.0], 1, &[1.0], 1, &mut c, 1).is_err());
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(24))]

        // Blocking and corner handling must be invisible: any shape matches
        // the reference.
        #[test]
        fn arbitrary_shapes_match_reference(m in 1usize..40, n in 1usize..40, k in 1usize..70) {
            run_gemm(m, n, k, CommShape::default(), (m * 10_000 + n * 100 + k) as u64);
        }
    }
}
