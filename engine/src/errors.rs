use hartree_runtime::RuntimeError;

// ENGINE ERROR
// ================================================================================================

/// Fatal conditions detected at engine entry.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("convolution geometry yields non-positive output extents (nx = {nx}, ny = {ny})")]
    BadConvGeometry { nx: isize, ny: isize },

    #[error("the Strassen variant is not implemented")]
    StrassenUnsupported,

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}
