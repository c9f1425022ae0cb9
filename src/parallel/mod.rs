//! Collective communication used by the solver core.
//!
//! Every cross-process aggregation in the crate goes through a [`Comm`] passed in
//! explicitly by the caller. All operations are blocking collectives: every rank must
//! call them in the same order with consistently sized inputs.

use crate::error::{MixError, Result};

/// Blocking collective operations over the ranks of an SPMD job.
pub trait Comm: Sync {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    fn barrier(&self);
    /// Sum of `x` over all ranks.
    fn all_reduce(&self, x: f64) -> f64;
    /// Maximum of `x` over all ranks.
    fn all_reduce_max(&self, x: f64) -> f64;
    /// Element-wise sum of `data` over all ranks, in place.
    fn all_reduce_sum_vec(&self, data: &mut [f64]);
    /// Concatenation of every rank's `local` slice in rank order.
    fn all_gather_indices(&self, local: &[usize]) -> Vec<usize>;
    /// Value of `value` on `root`, delivered to every rank.
    fn broadcast(&self, value: f64, root: usize) -> f64;

    /// The highest rank; by convention it owns the circuit state.
    fn last_rank(&self) -> usize {
        self.size() - 1
    }

    fn all_reduce_count(&self, n: usize) -> usize {
        self.all_reduce(n as f64).round() as usize
    }

    fn dot(&self, a: &[f64], b: &[f64]) -> f64 {
        let local = a.iter().zip(b).map(|(&x, &y)| x * y).sum::<f64>();
        self.all_reduce(local)
    }

    /// Global Euclidean norm of a partitioned vector given this rank's segment.
    fn norm(&self, local: &[f64]) -> f64 {
        self.dot(local, local).sqrt()
    }
}

/// Make a rank-local outcome global (collective).
///
/// If any rank failed, every rank returns an error: failing ranks their own, the
/// others [`MixError::PeerFailure`] naming the lowest failing rank. All ranks agree on
/// [`MixError::is_recoverable`], so their recovery paths stay in step.
pub fn agree<T, C: Comm + ?Sized>(comm: &C, stage: &'static str, local: Result<T>) -> Result<T> {
    let mine = match &local {
        Ok(_) => Vec::new(),
        Err(e) => vec![comm.rank(), usize::from(e.is_recoverable())],
    };
    let failures = comm.all_gather_indices(&mine);
    if failures.is_empty() {
        return local;
    }
    let recoverable = failures.chunks(2).all(|f| f[1] == 1);
    match local {
        Err(e) if e.is_recoverable() == recoverable => Err(e),
        _ => Err(MixError::PeerFailure { stage, rank: failures[0], recoverable }),
    }
}

/// Single-process communicator: every collective is the identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialComm;

impl Comm for SerialComm {
    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn barrier(&self) {}
    fn all_reduce(&self, x: f64) -> f64 {
        x
    }
    fn all_reduce_max(&self, x: f64) -> f64 {
        x
    }
    fn all_reduce_sum_vec(&self, _data: &mut [f64]) {}
    fn all_gather_indices(&self, local: &[usize]) -> Vec<usize> {
        local.to_vec()
    }
    fn broadcast(&self, value: f64, _root: usize) -> f64 {
        value
    }
}

#[cfg(feature = "mpi")]
pub mod mpi_comm;
#[cfg(feature = "mpi")]
pub use mpi_comm::MpiComm;

#[cfg(feature = "rayon")]
pub mod rayon_comm;
#[cfg(feature = "rayon")]
pub use rayon_comm::RayonComm;

pub enum UniverseComm {
    #[cfg(feature = "mpi")]
    Mpi(MpiComm),
    #[cfg(feature = "rayon")]
    Rayon(RayonComm),
    Serial(SerialComm),
}

impl UniverseComm {
    /// Pick the widest backend compiled in: MPI, then rayon, then serial.
    pub fn new() -> Self {
        #[cfg(feature = "mpi")]
        {
            UniverseComm::Mpi(MpiComm::new())
        }
        #[cfg(all(feature = "rayon", not(feature = "mpi")))]
        {
            UniverseComm::Rayon(RayonComm::new())
        }
        #[cfg(not(any(feature = "mpi", feature = "rayon")))]
        {
            UniverseComm::Serial(SerialComm)
        }
    }

    fn inner(&self) -> &dyn Comm {
        match self {
            #[cfg(feature = "mpi")]
            UniverseComm::Mpi(comm) => comm,
            #[cfg(feature = "rayon")]
            UniverseComm::Rayon(comm) => comm,
            UniverseComm::Serial(comm) => comm,
        }
    }
}

impl Default for UniverseComm {
    fn default() -> Self {
        Self::new()
    }
}

impl Comm for UniverseComm {
    fn rank(&self) -> usize {
        self.inner().rank()
    }
    fn size(&self) -> usize {
        self.inner().size()
    }
    fn barrier(&self) {
        self.inner().barrier()
    }
    fn all_reduce(&self, x: f64) -> f64 {
        self.inner().all_reduce(x)
    }
    fn all_reduce_max(&self, x: f64) -> f64 {
        self.inner().all_reduce_max(x)
    }
    fn all_reduce_sum_vec(&self, data: &mut [f64]) {
        self.inner().all_reduce_sum_vec(data)
    }
    fn all_gather_indices(&self, local: &[usize]) -> Vec<usize> {
        self.inner().all_gather_indices(local)
    }
    fn broadcast(&self, value: f64, root: usize) -> f64 {
        self.inner().broadcast(value, root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_collectives_are_identity() {
        let comm = SerialComm;
        assert_eq!(comm.rank(), 0);
        assert_eq!(comm.last_rank(), 0);
        assert_eq!(comm.all_reduce(2.5), 2.5);
        assert_eq!(comm.all_reduce_max(-1.0), -1.0);
        assert_eq!(comm.broadcast(7.0, 0), 7.0);
        assert_eq!(comm.all_gather_indices(&[3, 1]), vec![3, 1]);
        assert_eq!(comm.all_reduce_count(4), 4);
    }

    #[test]
    fn serial_agreement_passes_outcome_through() {
        let comm = SerialComm;
        assert_eq!(agree(&comm, "test", Ok(3)).unwrap(), 3);
        let err = agree::<(), _>(&comm, "test", Err(MixError::LinearSolve("singular".into())));
        assert!(matches!(err, Err(MixError::LinearSolve(_))));
    }

    #[test]
    fn norm_matches_euclidean() {
        let comm = SerialComm;
        assert_eq!(comm.norm(&[3.0, 4.0]), 5.0);
    }
}
