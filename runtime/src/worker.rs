use crate::ThreadComm;

// WORKER
// ================================================================================================

/// A thread's coordinate within the communicator hierarchy.
///
/// Constructed inside the parallel region from the thread id and the root
/// communicator; the `(jc_id, pc_id, ic_id, jr_id)` coordinate is recovered
/// by successive division/modulo down the tree. A worker is read-only for the
/// lifetime of the parallel region.
#[derive(Clone, Copy)]
pub struct Worker<'a> {
    pub tid: usize,

    pub jc_id: usize,
    pub pc_id: usize,
    pub ic_id: usize,
    pub jr_id: usize,

    /// Residual thread id within the PC group; pack-B is parallelized across
    /// this lane index rather than `jr_id` alone.
    pub ic_jr: usize,

    pub jc_nt: usize,
    pub pc_nt: usize,
    pub ic_nt: usize,
    pub jr_nt: usize,

    pub comm: &'a ThreadComm,
    pub jc_comm: &'a ThreadComm,
    pub pc_comm: &'a ThreadComm,
    pub ic_comm: &'a ThreadComm,
}

impl<'a> Worker<'a> {
    /// Resolves thread `tid` of the team rooted at `comm` to its coordinate.
    pub fn new(tid: usize, comm: &'a ThreadComm) -> Self {
        debug_assert!(tid < comm.num_threads());

        let mut rem = tid;

        let jc_nt = comm.num_groups();
        let per_jc = comm.num_threads() / jc_nt;
        let jc_id = rem / per_jc;
        rem %= per_jc;
        let jc_comm = comm.kid(jc_id);

        let pc_nt = jc_comm.num_groups();
        let per_pc = jc_comm.num_threads() / pc_nt;
        let pc_id = rem / per_pc;
        rem %= per_pc;
        let pc_comm = jc_comm.kid(pc_id);

        let ic_jr = rem;
        let ic_nt = pc_comm.num_groups();
        let per_ic = pc_comm.num_threads() / ic_nt;
        let ic_id = rem / per_ic;
        let jr_id = rem % per_ic;
        let ic_comm = pc_comm.kid(ic_id);
        let jr_nt = ic_comm.num_groups();

        Self {
            tid,
            jc_id,
            pc_id,
            ic_id,
            jr_id,
            ic_jr,
            jc_nt,
            pc_nt,
            ic_nt,
            jr_nt,
            comm,
            jc_comm,
            pc_comm,
            ic_comm,
        }
    }
}

// TESTS
// ================================================================================================

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(2, 1, 2, 2)]
    #[case(1, 1, 1, 1)]
    #[case(3, 2, 2, 1)]
    fn coordinates_cover_the_team(
        #[case] jc_nt: usize,
        #[case] pc_nt: usize,
        #[case] ic_nt: usize,
        #[case] jr_nt: usize,
    ) {
        let comm = ThreadComm::new(jc_nt, pc_nt, ic_nt, jr_nt).unwrap();
        let mut seen = Vec::new();

        for tid in 0..comm.num_threads() {
            let w = Worker::new(tid, &comm);
            assert_eq!(w.jc_nt, jc_nt);
            assert_eq!(w.pc_nt, pc_nt);
            assert_eq!(w.ic_nt, ic_nt);
            assert_eq!(w.jr_nt, jr_nt);
            assert_eq!(w.ic_jr, w.ic_id * jr_nt + w.jr_id);
            seen.push((w.jc_id, w.pc_id, w.ic_id, w.jr_id));
        }

        // Every coordinate is hit exactly once.
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), comm.num_threads());
    }

    #[test]
    fn worker_caches_the_right_subcommunicators() {
        let comm = ThreadComm::new(2, 1, 2, 2).unwrap();
        let w = Worker::new(5, &comm);

        // tid 5 = jc 1, pc 0, ic 0, jr 1 for shape (2, 1, 2, 2).
        assert_eq!((w.jc_id, w.pc_id, w.ic_id, w.jr_id), (1, 0, 0, 1));
        assert_eq!(w.ic_comm.num_threads(), 2);
        assert_eq!(w.pc_comm.num_threads(), 4);
        assert_eq!(w.jc_comm.num_threads(), 4);
    }
}
