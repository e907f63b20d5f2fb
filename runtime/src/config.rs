use crate::RuntimeError;

// THREAD CONFIGURATION
// ================================================================================================

/// The shape of the thread team, as read from the environment.
///
/// Three knobs fully determine the communicator tree; PC parallelism is not
/// exposed and defaults to 1. There is no autotuning: what the environment
/// says is what the engine runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommShape {
    pub jc_nt: usize,
    pub pc_nt: usize,
    pub ic_nt: usize,
    pub jr_nt: usize,
}

impl CommShape {
    /// Reads `HARTREE_JC_NT`, `HARTREE_IC_NT`, and `HARTREE_JR_NT`; unset
    /// variables default to 1.
    pub fn from_env() -> Result<Self, RuntimeError> {
        Ok(Self {
            jc_nt: read_nway_from_env("HARTREE_JC_NT")?,
            pc_nt: 1,
            ic_nt: read_nway_from_env("HARTREE_IC_NT")?,
            jr_nt: read_nway_from_env("HARTREE_JR_NT")?,
        })
    }

    /// Total number of threads the shape spans.
    pub fn num_threads(&self) -> usize {
        self.jc_nt * self.pc_nt * self.ic_nt * self.jr_nt
    }
}

impl Default for CommShape {
    fn default() -> Self {
        Self { jc_nt: 1, pc_nt: 1, ic_nt: 1, jr_nt: 1 }
    }
}

/// Reads a parallelization degree from the environment variable `var`.
///
/// Unset means 1; anything set must parse as a positive integer.
pub fn read_nway_from_env(var: &str) -> Result<usize, RuntimeError> {
    let Ok(value) = std::env::var(var) else {
        return Ok(1);
    };

    match value.trim().parse::<usize>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(RuntimeError::InvalidThreadConfig { var: var.to_string(), value }),
    }
}

// TESTS
// ================================================================================================
