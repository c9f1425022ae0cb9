//! MPI-based communicator for distributed-memory runs.
//!
//! Wraps the world communicator and maps the collectives of [`super::Comm`] onto MPI
//! reductions, gathers and broadcasts. Only compiled with the `mpi` feature.
//!
//! # Example
//! ```no_run
//! #[cfg(feature = "mpi")]
//! {
//!     use mixddm::parallel::{Comm, MpiComm};
//!     let comm = MpiComm::new();
//!     println!("Rank: {} / {}", comm.rank(), comm.size());
//! }
//! ```

#[cfg(feature = "mpi")]
use mpi::Count;
#[cfg(feature = "mpi")]
use mpi::collective::SystemOperation;
#[cfg(feature = "mpi")]
use mpi::datatype::PartitionMut;
#[cfg(feature = "mpi")]
use mpi::environment::Universe;
#[cfg(feature = "mpi")]
use mpi::topology::SimpleCommunicator;
#[cfg(feature = "mpi")]
use mpi::traits::*;

/// MPI communicator wrapper for distributed parallelism.
#[cfg(feature = "mpi")]
pub struct MpiComm {
    /// Keeps MPI initialized for the lifetime of the communicator.
    _universe: Universe,
    /// The MPI world communicator (all processes in the job).
    pub world: SimpleCommunicator,
    /// The rank (ID) of this process within the communicator.
    pub rank: usize,
    /// The total number of processes in the communicator.
    pub size: usize,
}

#[cfg(feature = "mpi")]
impl MpiComm {
    /// Initializes MPI and constructs a new `MpiComm` instance.
    ///
    /// # Panics
    /// Panics if MPI initialization fails or was already performed.
    pub fn new() -> Self {
        let universe = mpi::initialize().expect("MPI initialization failed");
        let world = universe.world();
        let rank = world.rank() as usize;
        let size = world.size() as usize;
        MpiComm { _universe: universe, world, rank, size }
    }
}

#[cfg(feature = "mpi")]
impl super::Comm for MpiComm {
    fn rank(&self) -> usize { self.rank }
    fn size(&self) -> usize { self.size }
    fn barrier(&self) { self.world.barrier(); }

    fn all_reduce(&self, x: f64) -> f64 {
        let mut y = x;
        self.world.all_reduce_into(&x, &mut y, SystemOperation::sum());
        y
    }

    fn all_reduce_max(&self, x: f64) -> f64 {
        let mut y = x;
        self.world.all_reduce_into(&x, &mut y, SystemOperation::max());
        y
    }

    fn all_reduce_sum_vec(&self, data: &mut [f64]) {
        let local = data.to_vec();
        self.world
            .all_reduce_into(&local[..], &mut data[..], SystemOperation::sum());
    }

    fn all_gather_indices(&self, local: &[usize]) -> Vec<usize> {
        let count = local.len() as Count;
        let mut counts = vec![0 as Count; self.size];
        self.world.all_gather_into(&count, &mut counts[..]);

        let displs: Vec<Count> = counts
            .iter()
            .scan(0 as Count, |acc, &c| {
                let d = *acc;
                *acc += c;
                Some(d)
            })
            .collect();
        let total: Count = counts.iter().sum();

        let send: Vec<u64> = local.iter().map(|&i| i as u64).collect();
        let mut recv = vec![0u64; total as usize];
        {
            let mut partition = PartitionMut::new(&mut recv[..], counts, &displs[..]);
            self.world.all_gather_varcount_into(&send[..], &mut partition);
        }
        recv.into_iter().map(|i| i as usize).collect()
    }

    fn broadcast(&self, value: f64, root: usize) -> f64 {
        let mut v = value;
        self.world.process_at_rank(root as i32).broadcast_into(&mut v);
        v
    }
}
