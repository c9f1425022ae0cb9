//! Nonlinear and time-stepping machinery.

use crate::error::Result;
use crate::matrix::SparseMatrix;
use crate::parallel::Comm;
use crate::utils::convergence::SolveStats;

/// Common interface for the linear solve inside each Newton iteration.
pub trait LinearSolver {
    /// Solve A·x = b, writing the result into `x` (collective).
    ///
    /// `a` and `b` are the assembled, replicated system; every rank must return the
    /// same `x`.
    fn solve(&mut self, comm: &dyn Comm, a: &SparseMatrix, b: &[f64], x: &mut [f64]) -> Result<SolveStats>;
}

pub mod assembler;
pub mod circuit_bridge;
pub mod damping;
pub mod direct_lu;
pub mod newton;
pub mod norms;
pub mod row_coupler;
pub mod time_integrator;

pub use assembler::{Assembler, DeviceSystem};
pub use circuit_bridge::CircuitBridge;
pub use damping::{
    BankRoseDamping, DampingChain, DampingFlags, DampingPolicy, PositiveDensityDamping, PotentialDamping,
};
pub use direct_lu::LuSolver;
pub use newton::{NewtonSolver, NewtonStats};
pub use norms::{ErrorNorms, NormEvaluator};
pub use row_coupler::{RowCoupler, RowRequests};
pub use time_integrator::{TimeIntegrator, TimeState};
