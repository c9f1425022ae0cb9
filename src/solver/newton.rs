//! Damped Newton iteration on the assembled device/circuit system.
//!
//! Each iteration assembles the scaled residual and Jacobian at the current
//! iterate, tests convergence on the unscaled per-quantity norms, solves for the
//! update, proposes `x − Δx` and lets the damping chain rewrite the proposal before
//! it is accepted.

use crate::config::SolverConfig;
use crate::core::layout::DofMap;
use crate::core::vector::{DistributedVector, LocalVector};
use crate::error::{MixError, Result};
use crate::parallel::{Comm, agree};
use crate::solver::LinearSolver;
use crate::solver::assembler::{Assembler, DeviceSystem};
use crate::solver::damping::{DampingChain, DampingFlags};
use crate::solver::norms::{ErrorNorms, NormEvaluator};
use crate::solver::time_integrator::TimeState;
use crate::utils::convergence::Convergence;

/// Outcome of one converged Newton solve.
#[derive(Debug, Clone, Default)]
pub struct NewtonStats {
    pub iterations: usize,
    pub norms: ErrorNorms,
    /// Flags reported by the damping chain, one entry per update taken.
    pub damping: Vec<DampingFlags>,
}

impl NewtonStats {
    pub fn damped_iterations(&self) -> usize {
        self.damping.iter().filter(|f| f.contains(DampingFlags::CHANGED_CANDIDATE)).count()
    }
}

pub struct NewtonSolver {
    chain: DampingChain,
    convergence: Convergence,
}

impl NewtonSolver {
    pub fn new(chain: DampingChain, convergence: Convergence) -> Self {
        Self { chain, convergence }
    }

    pub fn from_config(config: &SolverConfig) -> Self {
        Self::new(DampingChain::from_config(config), Convergence::new(config.newton.clone()))
    }

    pub fn max_iterations(&self) -> usize {
        self.convergence.options.max_iterations
    }

    /// Iterate `x` to convergence (collective).
    ///
    /// On failure `x` holds the last iterate; the caller decides how to recover.
    #[allow(clippy::too_many_arguments)]
    pub fn solve(
        &self,
        comm: &dyn Comm,
        dofs: &DofMap,
        system: &DeviceSystem,
        assembler: &mut Assembler,
        linear: &mut dyn LinearSolver,
        x: &mut DistributedVector,
        scaling: &LocalVector,
        time: Option<&TimeState>,
    ) -> Result<NewtonStats> {
        let n = dofs.n_dofs();
        let max_iterations = self.max_iterations();
        let mut damping = Vec::new();
        let mut relative_step = None;

        for iteration in 0..=max_iterations {
            let _span = tracing::debug_span!("newton_iter", iteration).entered();
            let x_local = x.gather(comm);
            let r = assembler.assemble(comm, dofs, system, &x_local, scaling, time)?;
            let norms = NormEvaluator::evaluate(comm, dofs, x, &x_local, &r, scaling, &system.circuit);

            let (converged, stats) = self.convergence.check(&norms, relative_step, iteration);
            tracing::debug!(
                poisson = norms.poisson,
                electron = norms.electron_continuity,
                hole = norms.hole_continuity,
                circuit = norms.circuit,
                relative_step = relative_step.unwrap_or(f64::NAN),
                "newton residual"
            );
            if converged {
                tracing::debug!(iterations = stats.iterations, "Newton converged");
                return Ok(NewtonStats { iterations: iteration, norms, damping });
            }
            if iteration == max_iterations {
                break;
            }

            let mut dx = vec![0.0; n];
            let solved = linear.solve(comm, assembler.jacobian(), &r, &mut dx);
            agree(comm, "linear solve", solved)?;
            let mut step = DistributedVector::from_full(dofs, comm.rank(), &dx);
            let mut candidate = x.clone();
            candidate.axpy(-1.0, &step);

            damping.push(self.chain.apply(comm, dofs, x, &mut step, &mut candidate));
            if let Some(row) = candidate.first_non_finite_global(comm) {
                return Err(MixError::NumericalFault { stage: "newton update", row });
            }

            let mut update = candidate.clone();
            update.axpy(-1.0, x);
            let x_norm = candidate.norm(comm);
            relative_step = Some(if x_norm > 0.0 { update.norm(comm) / x_norm } else { update.norm(comm) });
            x.copy_from(&candidate);
        }

        Err(MixError::NewtonDiverged { iterations: max_iterations })
    }
}
