//! Dense linear-algebra primitives for the Hartree workspace.
//!
//! The engines treat BLAS-level matrix multiplication, norms, the
//! interpolative decomposition, and bounded-heap neighbor selection as
//! black-box routines; this crate is the reference instantiation of those
//! contracts. Everything is column-major, mirroring the packed layouts the
//! blocked engine streams through.

mod blas;
mod heap;
mod id;
mod matrix;

pub use blas::{frobenius_norm, xgemm, Op};
pub use heap::heap_select;
pub use id::{id_adaptive, id_fixed, Interpolative};
pub use matrix::Matrix;

/// Element-type bound shared across the workspace.
///
/// Monomorphic instantiations are expected (`f32`, `f64`); the bound only
/// captures what the kernels and factorizations actually need.
pub trait Scalar:
    num_traits::Float + num_traits::FromPrimitive + Send + Sync + core::fmt::Debug + 'static
{
}

impl Scalar for f32 {}
impl Scalar for f64 {}
