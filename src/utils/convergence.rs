//! Convergence tracking & tolerance checks for the Newton iteration.

use crate::config::NewtonOptions;
use crate::solver::norms::ErrorNorms;

/// Stopping criteria & stats.
pub struct Convergence {
    pub options: NewtonOptions,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SolveStats {
    pub iterations: usize,
    pub final_residual: f64,
    pub converged: bool,
}

impl Convergence {
    pub fn new(options: NewtonOptions) -> Self {
        Self { options }
    }

    /// Every residual norm within `factor` × its tolerance.
    pub fn residual_within(&self, norms: &ErrorNorms, factor: f64) -> bool {
        let o = &self.options;
        norms.poisson <= factor * o.poisson_tol
            && norms.electron_continuity <= factor * o.continuity_tol
            && norms.hole_continuity <= factor * o.continuity_tol
            && norms.circuit <= factor * o.circuit_tol
    }

    /// Returns (converged, stats) given the current norms and the relative size of the
    /// last update, if one was taken.
    ///
    /// Converged when all residuals meet their tolerances, or when the update fell
    /// below `relative_step_tol` with residuals within the relaxed tolerances.
    pub fn check(&self, norms: &ErrorNorms, relative_step: Option<f64>, iteration: usize) -> (bool, SolveStats) {
        let function_converged = self.residual_within(norms, 1.0);
        let step_converged = relative_step
            .is_some_and(|s| s <= self.options.relative_step_tol && self.residual_within(norms, self.options.relax_factor));
        let converged = function_converged || step_converged;
        let final_residual = (norms.poisson.powi(2)
            + norms.electron_continuity.powi(2)
            + norms.hole_continuity.powi(2)
            + norms.circuit.powi(2))
        .sqrt();
        (
            converged,
            SolveStats {
                iterations: iteration,
                final_residual,
                converged,
            },
        )
    }
}
