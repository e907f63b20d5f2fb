use core::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::RuntimeError;

// THREAD COMMUNICATOR
// ================================================================================================

/// A node of the four-level thread-communicator tree.
///
/// The root contains every thread of the team; each level below it partitions
/// its threads into `n_groups` equally sized child communicators, with
/// fan-outs `[jc_nt, pc_nt, ic_nt, jr_nt]` from root to leaf. Every node owns
/// a sense-reversal barrier that synchronizes exactly the threads it
/// contains, so barriers at different subtrees never interfere.
#[derive(Debug)]
pub struct ThreadComm {
    name: &'static str,
    n_threads: usize,
    n_groups: usize,
    barrier_sense: AtomicBool,
    barrier_arrived: AtomicUsize,
    kids: Vec<ThreadComm>,
}

impl ThreadComm {
    /// Builds the communicator tree for a `jc_nt x pc_nt x ic_nt x jr_nt`
    /// thread team.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidCommShape`] if any fan-out is zero.
    pub fn new(
        jc_nt: usize,
        pc_nt: usize,
        ic_nt: usize,
        jr_nt: usize,
    ) -> Result<Self, RuntimeError> {
        if jc_nt == 0 || pc_nt == 0 || ic_nt == 0 || jr_nt == 0 {
            return Err(RuntimeError::InvalidCommShape { jc_nt, pc_nt, ic_nt, jr_nt });
        }

        let n_threads = jc_nt * pc_nt * ic_nt * jr_nt;
        tracing::debug!(n_threads, jc_nt, pc_nt, ic_nt, jr_nt, "building communicator tree");
        let levels = [("jc_comm", pc_nt), ("pc_comm", ic_nt), ("ic_comm", jr_nt)];
        let proto = Self::create_level(n_threads / jc_nt, &levels);

        Ok(Self {
            name: "team",
            n_threads,
            n_groups: jc_nt,
            barrier_sense: AtomicBool::new(false),
            barrier_arrived: AtomicUsize::new(0),
            kids: (0..jc_nt).map(|_| proto.clone_shape()).collect(),
        })
    }

    /// Recursively creates one child communicator per remaining level.
    ///
    /// `levels` holds `(name, n_groups)` for this node and everything below
    /// it; the JR level is a leaf and carries no communicator of its own.
    fn create_level(n_threads: usize, levels: &[(&'static str, usize)]) -> ThreadComm {
        let (name, n_groups) = levels[0];
        let kids = if levels.len() > 1 {
            let kid = Self::create_level(n_threads / n_groups, &levels[1..]);
            (0..n_groups).map(|_| kid.clone_shape()).collect()
        } else {
            Vec::new()
        };

        ThreadComm {
            name,
            n_threads,
            n_groups,
            barrier_sense: AtomicBool::new(false),
            barrier_arrived: AtomicUsize::new(0),
            kids,
        }
    }

    /// Clones the static shape of a subtree with fresh barrier state.
    fn clone_shape(&self) -> ThreadComm {
        ThreadComm {
            name: self.name,
            n_threads: self.n_threads,
            n_groups: self.n_groups,
            barrier_sense: AtomicBool::new(false),
            barrier_arrived: AtomicUsize::new(0),
            kids: self.kids.iter().map(|kid| kid.clone_shape()).collect(),
        }
    }

    // ACCESSORS
    // --------------------------------------------------------------------------------------------

    /// Number of threads this communicator contains.
    pub fn num_threads(&self) -> usize {
        self.n_threads
    }

    /// Number of child groups this communicator is partitioned into.
    pub fn num_groups(&self) -> usize {
        self.n_groups
    }

    /// The child communicator for group `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id >= num_groups()` or if this node is a leaf level.
    pub fn kid(&self, id: usize) -> &ThreadComm {
        &self.kids[id]
    }

    // BARRIER
    // --------------------------------------------------------------------------------------------

    /// Sense-reversal barrier over the threads of this communicator.
    ///
    /// Each thread snapshots the local sense and atomically bumps the arrival
    /// counter; the last arrival resets the counter and flips the sense,
    /// releasing the spinners. The flip makes back-to-back barriers safe: a
    /// thread re-entering immediately spins on the *new* sense value.
    pub fn barrier(&self) {
        if self.n_threads < 2 {
            return;
        }

        let my_sense = self.barrier_sense.load(Ordering::Acquire);
        let arrived = self.barrier_arrived.fetch_add(1, Ordering::AcqRel) + 1;

        if arrived == self.n_threads {
            // Counter must be reset before the sense flip publishes it;
            // the Release store pairs with the spinners' Acquire loads.
            self.barrier_arrived.store(0, Ordering::Relaxed);
            self.barrier_sense.store(!my_sense, Ordering::Release);
        } else {
            while self.barrier_sense.load(Ordering::Acquire) == my_sense {
                core::hint::spin_loop();
            }
        }
    }
}

impl fmt::Display for ThreadComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} threads, {} groups)", self.name, self.n_threads, self.n_groups)
    }
}

// TESTS
// ================================================================================================
