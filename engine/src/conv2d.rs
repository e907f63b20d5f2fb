use hartree_linalg::Scalar;
use hartree_runtime::{PackBuffer, ThreadComm, Worker};
use tracing::{debug, instrument};

use crate::gemm::{fused_macro_kernel, rank_k_macro_kernel, SharedMut};
use crate::range::BlockRange;
use crate::{
    EngineConfig, EngineError, FusedKernel, RankKFused, RankKSemiring, SemiringKernel, ALIGN_SIZE,
    KC, MC, MR, NR, PACK_MR, PACK_NR,
};

// CONVOLUTION GEOMETRY
// ================================================================================================

/// Shapes of a 2-D convolution: a `(w0, h0, d0)` image filtered by `d1`
/// kernels of shape `(w1, h1, d0)` at stride `stride` with zero padding
/// `pad`.
///
/// The lowering to GEMM views the filters as an `m x k` matrix (`m = d1`,
/// `k = w1 * h1 * d0`) and every output position as one of `n = nx * ny`
/// columns whose entries are the taps of its receptive window.
#[derive(Debug, Clone, Copy)]
pub struct ConvGeometry {
    pub w0: usize,
    pub h0: usize,
    pub d0: usize,
    pub stride: usize,
    pub pad: usize,
    pub w1: usize,
    pub h1: usize,
    pub d1: usize,
}

impl ConvGeometry {
    /// Output extents, checked for positivity.
    pub fn validate(&self) -> Result<(usize, usize), EngineError> {
        let nx = (self.w0 as isize - self.w1 as isize + 2 * self.pad as isize)
            / self.stride as isize
            + 1;
        let ny = (self.h0 as isize - self.h1 as isize + 2 * self.pad as isize)
            / self.stride as isize
            + 1;
        if nx <= 0 || ny <= 0 {
            return Err(EngineError::BadConvGeometry { nx, ny });
        }
        Ok((nx as usize, ny as usize))
    }

    /// Rows of the lowered GEMM (`d1`).
    pub fn m(&self) -> usize {
        self.d1
    }

    /// Reduction length of the lowered GEMM (`w1 * h1 * d0`).
    pub fn k(&self) -> usize {
        self.w1 * self.h1 * self.d0
    }

    /// One image tap, honoring the zero padding halo.
    #[inline]
    fn tap<T: Scalar>(&self, img: &[T], x: isize, y: isize, z: usize) -> T {
        if x < 0 || y < 0 || x >= self.w0 as isize || y >= self.h0 as isize {
            T::zero()
        } else {
            img[(z * self.h0 + y as usize) * self.w0 + x as usize]
        }
    }
}

// FILTER PACKING
// ================================================================================================

/// Packs the filter tensor into the engine's A-panel format.
///
/// `filters` holds `d1` filters contiguously, each `k()` taps in image walk
/// order (x fastest, then y, then channel): `filters[f * k + t]`. The output
/// is `ceil(d1 / MR)` row panels of `PACK_MR * k` values, full-K contiguous
/// with stride `PACK_MR` per k step, so a PC slab enters a panel at offset
/// `pc * PACK_MR`. The conv driver itself never packs filters.
pub fn pack_filters<T: Scalar>(geom: &ConvGeometry, filters: &[T]) -> Vec<T> {
    let m = geom.m();
    let k = geom.k();
    debug_assert_eq!(filters.len(), m * k);

    let panels = m.div_ceil(MR);
    let mut packed = vec![T::zero(); panels * PACK_MR * k];
    for p in 0..panels {
        let base = p * PACK_MR * k;
        for t in 0..k {
            for ii in 0..MR {
                let f = p * MR + ii;
                if f < m {
                    packed[base + t * PACK_MR + ii] = filters[f * k + t];
                }
            }
        }
    }
    packed
}

// IMAGE PACKING
// ================================================================================================

/// Packs one `pb x jb_loc` image panel: for each of up to `NR` output
/// positions starting at `pos0`, the receptive-window taps `pc..pc + pb`.
///
/// Taps outside the padded image contribute zero; so do the padding lanes
/// beyond `jb_loc`.
#[allow(clippy::too_many_arguments)]
fn pack_im2col<T: Scalar>(
    geom: &ConvGeometry,
    nx: usize,
    pos0: usize,
    jb_loc: usize,
    pc: usize,
    pb: usize,
    img: &[T],
    dst: &mut [T],
) {
    debug_assert!(dst.len() >= pb * PACK_NR);
    let wh = geom.w1 * geom.h1;

    for kk in 0..pb {
        let t = pc + kk;
        let dx = (t % geom.w1) as isize;
        let dy = ((t / geom.w1) % geom.h1) as isize;
        let z = t / wh;

        let row = &mut dst[kk * PACK_NR..(kk + 1) * PACK_NR];
        for (jj, out) in row.iter_mut().enumerate() {
            *out = if jj < jb_loc {
                let pos = pos0 + jj;
                let x0 = ((pos % nx) * geom.stride) as isize - geom.pad as isize;
                let y0 = ((pos / nx) * geom.stride) as isize - geom.pad as isize;
                geom.tap(img, x0 + dx, y0 + dy, z)
            } else {
                T::zero()
            };
        }
    }
}

// CONV DRIVER
// ================================================================================================

/// One worker's share of the lowered convolution.
///
/// The loop nest is the GEMM engine's with two substitutions: B panels come
/// from [`pack_im2col`] instead of a matrix, and A panels are read straight
/// out of the pre-packed filter buffer.
///
/// # Safety
///
/// `c` must address a `d1 x n` column-major output; every worker of the team
/// must run this function with the same arguments.
#[allow(clippy::too_many_arguments)]
unsafe fn conv2d_internal<T: Scalar, SK: SemiringKernel<T>, FK: FusedKernel<T>>(
    worker: &Worker<'_>,
    geom: &ConvGeometry,
    nx: usize,
    ny: usize,
    img: &[T],
    packed_filters: &[T],
    c: SharedMut<T>,
    semiringkernel: SK,
    microkernel: FK,
    nc: usize,
    pack_nc: usize,
    pack_b_buf: &PackBuffer<T>,
) {
    let m = geom.m();
    let n = nx * ny;
    let k = geom.k();
    let ldc = m;
    let b_origin = worker.jc_id * pack_nc * KC;

    for jc in BlockRange::new(n, nc, worker.jc_id, worker.jc_nt) {
        let jb = (n - jc).min(nc);

        for pc in BlockRange::full(k, KC) {
            let pb = (k - pc).min(KC);
            let is_last_pc = pc + KC >= k;

            for j in BlockRange::new(jb, NR, worker.ic_jr, worker.pc_comm.num_threads()) {
                let jb_loc = (jb - j).min(NR);
                let dst =
                    unsafe { pack_b_buf.slice_mut(b_origin + (j / NR) * PACK_NR * pb, PACK_NR * pb) };
                pack_im2col(geom, nx, jc + j, jb_loc, pc, pb, img, dst);
            }
            worker.pc_comm.barrier();

            for ic in BlockRange::new(m, MC, worker.ic_id, worker.ic_nt) {
                let ib = (m - ic).min(MC);

                // Filters are pre-packed with full-K panels; enter the panel
                // run at this tile's first row panel and this slab's offset.
                let a_panels = &packed_filters[(ic / MR) * PACK_MR * k + pc * PACK_MR..];
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
                            PACK_MR * k,
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
                            PACK_MR * k,
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

/// 2-D convolution lowered onto the blocked engine.
///
/// `img` is the `(w0, h0, d0)` input (x fastest, then y, then channel),
/// `packed_filters` the output of [`pack_filters`], and `out` the `d1 x n`
/// column-major result (channel-major per output position).
///
/// # Errors
///
/// Fails on non-positive output extents, a Strassen request, an invalid
/// thread configuration, or scratch allocation failure.
#[instrument(skip_all, fields(w0 = geom.w0, h0 = geom.h0, d0 = geom.d0, d1 = geom.d1))]
pub fn conv2d<T: Scalar>(
    config: &EngineConfig,
    geom: &ConvGeometry,
    img: &[T],
    packed_filters: &[T],
    out: &mut [T],
) -> Result<(), EngineError> {
    let shape = config.resolve_shape()?;
    let (nx, ny) = geom.validate()?;
    let m = geom.m();
    let n = nx * ny;
    let k = geom.k();

    debug_assert!(img.len() >= geom.w0 * geom.h0 * geom.d0);
    debug_assert_eq!(packed_filters.len(), m.div_ceil(MR) * PACK_MR * k);
    debug_assert!(out.len() >= m * n);

    let (nc, pack_nc) = EngineConfig::blocking(&shape, n);
    let pack_b_buf = PackBuffer::<T>::new(KC * (pack_nc + 1) * shape.jc_nt, ALIGN_SIZE)?;
    let comm = ThreadComm::new(shape.jc_nt, shape.pc_nt, shape.ic_nt, shape.jr_nt)?;
    debug!(threads = comm.num_threads(), nx, ny, "entering parallel region");

    let c_ptr = SharedMut(out.as_mut_ptr());
    let semiring = RankKSemiring;
    let fused = RankKFused::new(crate::Identity);

    std::thread::scope(|scope| {
        let comm = &comm;
        let pack_b_buf = &pack_b_buf;

        for tid in 1..comm.num_threads() {
            scope.spawn(move || {
                let worker = Worker::new(tid, comm);
                // SAFETY: shapes validated above; C tiles are disjoint per
                // worker by the jc/ic sharding.
                unsafe {
                    conv2d_internal(
                        &worker, geom, nx, ny, img, packed_filters, c_ptr, semiring, fused, nc,
                        pack_nc, pack_b_buf,
                    )
                };
            });
        }

        let worker = Worker::new(0, comm);
        // SAFETY: as above.
        unsafe {
            conv2d_internal(
                &worker, geom, nx, ny, img, packed_filters, c_ptr, semiring, fused, nc, pack_nc,
                pack_b_buf,
            )
        };
    });

    Ok(())
}

/// Naive reference convolution over unpacked filters (`filters[f * k + t]`),
/// used as the oracle in tests.
pub fn conv2d_ref<T: Scalar>(geom: &ConvGeometry, img: &[T], filters: &[T]) -> Result<Vec<T>, EngineError> {
    let (nx, ny) = geom.validate()?;
    let m = geom.m();
    let k = geom.k();
    let n = nx * ny;
    let wh = geom.w1 * geom.h1;

    let mut out = vec![T::zero(); m * n];
    for pos in 0..n {
        let x0 = ((pos % nx) * geom.stride) as isize - geom.pad as isize;
        let y0 = ((pos / nx) * geom.stride) as isize - geom.pad as isize;
        for f in 0..m {
            let mut acc = T::zero();
            for t in 0..k {
                let dx = (t % geom.w1) as isize;
                let dy = ((t / geom.w1) % geom.h1) as isize;
                let z = t / wh;
                acc = acc + filters[f * k + t] * geom.tap(img, x0 + dx, y0 + dy, z);
            }
            out[pos * m + f] = acc;
        }
    }
    Ok(out)
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use hartree_linalg::Matrix;
    use hartree_runtime::CommShape;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn run_conv(geom: &ConvGeometry, shape: CommShape, seed: u64) {
        let (nx, ny) = geom.validate().unwrap();
        let n = nx * ny;
        let img = Matrix::<f64>::rand_uniform(geom.w0 * geom.h0 * geom.d0, 1, -1.0, 1.0, seed);
        let filters =
            Matrix::<f64>::rand_uniform(geom.m() * geom.k(), 1, -1.0, 1.0, seed + 1);

        let packed = pack_filters(geom, filters.data());
        let mut out = vec![f64::NAN; geom.m() * n];
        let config = EngineConfig { shape: Some(shape), use_strassen: false };
        conv2d(&config, geom, img.data(), &packed, &mut out).unwrap();

        let expect = conv2d_ref(geom, img.data(), filters.data()).unwrap();
        for (i, (&got, &want)) in out.iter().zip(expect.iter()).enumerate() {
            assert!(
                (got - want).abs() < 1e-10 * want.abs().max(1.0),
                "output {i}: {got} vs {want}"
            );
        }
    }

    #[test]
    fn pointwise_identity_filters_reproduce_the_image() {
        let geom = ConvGeometry { w0: 5, h0: 4, d0: 3, stride: 1, pad: 0, w1: 1, h1: 1, d1: 3 };
        let img = Matrix::<f64>::rand_uniform(5 * 4 * 3, 1, -1.0, 1.0, 2);

        // k = d0; filter f selects channel f.
        let mut filters = vec![0.0; 3 * 3];
        for f in 0..3 {
            filters[f * 3 + f] = 1.0;
        }

        let packed = pack_filters(&geom, &filters);
        let mut out = vec![f64::NAN; 3 * 20];
        conv2d(&EngineConfig::default(), &geom, img.data(), &packed, &mut out).unwrap();

        for pos in 0..20 {
            let (x, y) = (pos % 5, pos / 5);
            for f in 0..3 {
                let expect = img.data()[(f * 4 + y) * 5 + x];
                assert_eq!(out[pos * 3 + f], expect);
            }
        }
    }

    #[test]
    fn all_ones_count_receptive_field_taps() {
        let geom = ConvGeometry { w0: 8, h0: 8, d0: 3, stride: 1, pad: 1, w1: 3, h1: 3, d1: 4 };
        let (nx, ny) = geom.validate().unwrap();
        assert_eq!((nx, ny), (8, 8));

        let img = vec![1.0f64; 8 * 8 * 3];
        let filters = vec![1.0f64; geom.m() * geom.k()];
        let packed = pack_filters(&geom, &filters);
        let mut out = vec![f64::NAN; geom.m() * nx * ny];
        conv2d(&EngineConfig::default(), &geom, &img, &packed, &mut out).unwrap();

        for pos in 0..nx * ny {
            let x0 = (pos % nx) as isize - 1;
            let y0 = (pos / nx) as isize - 1;
            let mut taps = 0;
            for dy in 0..3isize {
                for dx in 0..3isize {
                    let (x, y) = (x0 + dx, y0 + dy);
                    if x >= 0 && y >= 0 && x < 8 && y < 8 {
                        taps += 1;
                    }
                }
            }
            let expect = (taps * 3) as f64;
            for f in 0..4 {
                assert_eq!(out[pos * 4 + f], expect, "position {pos}");
            }
        }
    }

    #[rstest]
    #[case(6, 6, 4, 1, 1, 3, 3, 5)] // small, padded
    #[case(9, 7, 2, 2, 0, 3, 3, 11)] // strided, no padding
    #[case(6, 6, 30, 1, 1, 3, 3, 9)] // k = 270 spans two K slabs
    #[allow(clippy::too_many_arguments)]
    fn conv_matches_reference(
        #[case] w0: usize,
        #[case] h0: usize,
        #[case] d0: usize,
        #[case] stride: usize,
        #[case] pad: usize,
        #[case] w1: usize,
        #[case] h1: usize,
        #[case] d1: usize,
    ) {
        let geom = ConvGeometry { w0, h0, d0, stride, pad, w1, h1, d1 };
        run_conv(&geom, CommShape::default(), w0 as u64 * 7 + d0 as u64);
    }

    #[test]
    fn threaded_conv_matches_reference() {
        let geom =
            ConvGeometry { w0: 12, h0: 10, d0: 6, stride: 1, pad: 1, w1: 3, h1: 3, d1: 17 };
        let shape = CommShape { jc_nt: 2, pc_nt: 1, ic_nt: 2, jr_nt: 1 };
        run_conv(&geom, shape, 23);
    }

    #[test]
    fn degenerate_geometry_is_fatal() {
        let geom = ConvGeometry { w0: 2, h0: 2, d0: 1, stride: 1, pad: 0, w1: 5, h1: 5, d1: 1 };
        assert!(matches!(
            geom.validate(),
            Err(EngineError::BadConvGeometry { .. })
        ));
    }

    #[test]
    fn packed_filters_pad_the_last_panel() {
        let geom = ConvGeometry { w0: 4, h0: 4, d0: 2, stride: 1, pad: 0, w1: 2, h1: 2, d1: 5 };
        let filters = vec![1.0f64; geom.m() * geom.k()];
        let packed = pack_filters(&geom, &filters);
        assert_eq!(packed.len(), PACK_MR * geom.k());

        // Rows beyond d1 = 5 are zero lanes.
        for t in 0..geom.k() {
            for ii in 5..PACK_MR {
                assert_eq!(packed[t * PACK_MR + ii], 0.0);
            }
        }
    }
}
