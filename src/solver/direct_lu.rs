//! Direct dense solver using Faer: LU with full pivoting.
//!
//! The assembled Jacobian is replicated on every rank, so each rank factors the same
//! dense copy and obtains the same update. Suitable for the small and medium systems
//! used in tests and single-node runs; large meshes plug in their own [`LinearSolver`].
//!
//! # References
//! - Faer documentation: https://github.com/sarah-ek/faer-rs
//! - Golub & Van Loan, Matrix Computations

use faer::linalg::solvers::{FullPivLu, SolveCore};
use faer::{Conj, MatMut};

use crate::error::{MixError, Result};
use crate::matrix::SparseMatrix;
use crate::parallel::Comm;
use crate::solver::LinearSolver;
use crate::utils::convergence::SolveStats;

/// LU solver using full pivoting from Faer.
#[derive(Default)]
pub struct LuSolver {
    /// Factorization of the last matrix solved.
    factor: Option<FullPivLu<f64>>,
}

impl LuSolver {
    pub fn new() -> Self {
        LuSolver { factor: None }
    }

    /// Solve again with the cached factorization.
    pub fn solve_cached(&self, b: &[f64], x: &mut [f64]) -> Result<()> {
        let factor = self
            .factor
            .as_ref()
            .ok_or_else(|| MixError::LinearSolve("solve_cached called before factorization".into()))?;
        let n = b.len();
        x.copy_from_slice(b);
        let x_mat = MatMut::from_column_major_slice_mut(x, n, 1);
        factor.solve_in_place_with_conj(Conj::No, x_mat);
        Ok(())
    }
}

impl LinearSolver for LuSolver {
    fn solve(&mut self, _comm: &dyn Comm, a: &SparseMatrix, b: &[f64], x: &mut [f64]) -> Result<SolveStats> {
        let dense = a.to_dense();
        self.factor = Some(FullPivLu::new(dense.as_ref()));
        self.solve_cached(b, x)?;
        if let Some(i) = x.iter().position(|v| !v.is_finite()) {
            return Err(MixError::LinearSolve(format!("non-finite update in row {}", i)));
        }
        Ok(SolveStats {
            iterations: 1,
            final_residual: 0.0,
            converged: true,
        })
    }
}
