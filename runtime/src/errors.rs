// RUNTIME ERROR
// ================================================================================================

/// Fatal conditions raised while setting up a parallel region.
///
/// Everything here is detected at engine entry; once the team is running
/// there are no failure points in this crate.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(
        "communicator shape {jc_nt}x{pc_nt}x{ic_nt}x{jr_nt} is invalid: every fan-out must be \
         at least 1"
    )]
    InvalidCommShape { jc_nt: usize, pc_nt: usize, ic_nt: usize, jr_nt: usize },

    #[error("environment variable {var} = {value:?} is not a positive integer")]
    InvalidThreadConfig { var: String, value: String },

    #[error("failed to allocate {bytes} bytes (alignment {align}) for packed panels")]
    Alloc { bytes: usize, align: usize },
}
