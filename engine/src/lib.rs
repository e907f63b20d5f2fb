//! Blocked matrix engine for the Hartree workspace.
//!
//! The engine is the classic six-loop formulation: N is tiled by [`NC`] over
//! JC thread groups, K by [`KC`] over PC slabs, M by [`MC`] over IC groups,
//! operands are repacked into panel form, and an `MR x NR` micro-kernel
//! streams the packed panels. Two kernel capabilities split the K dimension:
//! the semiring kernel owns the first slab (it initializes C), the fused
//! kernel owns the last (it applies the epilogue).
//!
//! [`conv2d`] lowers a 2-D convolution onto the same loop nest by packing
//! image receptive windows into B panels on the fly; filters arrive
//! pre-packed via [`pack_filters`].

mod conv2d;
mod errors;
mod gemm;
mod kernel;
mod range;

pub use conv2d::{conv2d, conv2d_ref, pack_filters, ConvGeometry};
pub use errors::EngineError;
pub use gemm::{gemm, EngineConfig};
pub use kernel::{
    Epilogue, FusedKernel, Identity, MicroAux, RankKFused, RankKSemiring, Relu, SemiringKernel,
};

// BLOCKING PARAMETERS
// ================================================================================================

/// L2 blocking of the M dimension; a multiple of [`MR`].
pub const MC: usize = 72;
/// L3 blocking of the N dimension; a multiple of [`NR`].
pub const NC: usize = 4080;
/// Blocking of the K dimension (one packed slab).
pub const KC: usize = 256;

/// Micro-tile rows.
pub const MR: usize = 8;
/// Micro-tile columns.
pub const NR: usize = 4;

/// Packed row-panel width; padded micro-panels are this wide.
pub const PACK_MR: usize = MR;
/// Packed column-panel width.
pub const PACK_NR: usize = NR;
/// Packed capacity of an MC tile.
pub const PACK_MC: usize = MC;
/// Packed capacity of an NC tile.
pub const PACK_NC: usize = NC;

/// Alignment of the packed-panel allocations, in bytes.
pub const ALIGN_SIZE: usize = 64;

const _: () = assert!(MC % MR == 0, "MC must be a whole number of row panels");
const _: () = assert!(NC % NR == 0, "NC must be a whole number of column panels");
