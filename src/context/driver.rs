//! Run driver: operating point, DC sweep and transient.
//!
//! The driver owns the solution and scaling vectors, the assembler and the Newton
//! solver, and sequences the collaborators around every solve:
//!
//! 1. `pre_solve_process`: optionally reload the state from the region and boundary
//!    fill hooks, then give every boundary its `pre_process` call.
//! 2. Newton (with time terms in transient mode).
//! 3. `post_solve_process`: clamp densities, hand the solution back to regions and
//!    boundaries, and let the circuit engine persist its state.
//!
//! Recoverable failures (divergence, numerical faults, singular updates) reload the
//! last stored state, restore the circuit, and retry with a smaller sweep or time
//! step until the retry budget runs out.

use crate::config::{IntegrationOrder, SolveMode, SolverConfig, SweepSpec, TransientSpec};
use crate::context::report::{RunReport, StepRecord};
use crate::core::layout::DofMap;
use crate::core::vector::{DistributedVector, LocalVector};
use crate::error::{MixError, Result};
use crate::parallel::{Comm, agree};
use crate::solver::LinearSolver;
use crate::solver::assembler::{Assembler, DeviceSystem};
use crate::solver::damping::project_positive_density;
use crate::solver::newton::{NewtonSolver, NewtonStats};
use crate::solver::time_integrator::{TimeIntegrator, TimeState};

pub struct Driver<C: Comm> {
    config: SolverConfig,
    comm: C,
    dofs: DofMap,
    system: DeviceSystem,
    assembler: Assembler,
    newton: NewtonSolver,
    linear: Box<dyn LinearSolver>,
    integrator: TimeIntegrator,
    x: DistributedVector,
    scaling: DistributedVector,
    scaling_local: LocalVector,
}

impl<C: Comm> Driver<C> {
    pub fn new(config: SolverConfig, comm: C, dofs: DofMap, system: DeviceSystem, linear: Box<dyn LinearSolver>) -> Self {
        let rank = comm.rank();
        let x = DistributedVector::zeros(&dofs, rank);
        let scaling = DistributedVector::filled(&dofs, rank, 1.0);
        let scaling_local = LocalVector::new(vec![1.0; dofs.n_dofs()]);
        Self {
            assembler: Assembler::new(dofs.n_dofs(), config.t_external),
            newton: NewtonSolver::from_config(&config),
            integrator: TimeIntegrator::new(config.order, config.ts_rtol, config.ts_atol),
            config,
            comm,
            dofs,
            system,
            linear,
            x,
            scaling,
            scaling_local,
        }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn dofs(&self) -> &DofMap {
        &self.dofs
    }

    pub fn system(&self) -> &DeviceSystem {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut DeviceSystem {
        &mut self.system
    }

    /// This rank's segment of the current solution.
    pub fn solution(&self) -> &DistributedVector {
        &self.x
    }

    /// Full copy of the current solution (collective).
    pub fn gather_solution(&self) -> LocalVector {
        self.x.gather(&self.comm)
    }

    /// Run the configured mode.
    pub fn solve(&mut self) -> Result<RunReport> {
        let checked = self.config.validate().and_then(|()| self.system.validate());
        agree(&self.comm, "configuration", checked)?;
        match self.config.mode.clone() {
            SolveMode::OperatingPoint => self.solve_dcop(),
            SolveMode::DcSweep(sweep) => self.solve_dcsweep(&sweep),
            SolveMode::Transient(spec) => self.solve_transient(&spec),
        }
    }

    /// Rebuild the solution and scaling vectors from the collaborators' stored state.
    pub fn fill_values(&mut self) {
        let rank = self.comm.rank();
        self.x = DistributedVector::zeros(&self.dofs, rank);
        self.scaling = DistributedVector::filled(&self.dofs, rank, 1.0);
        for region in &self.system.regions {
            region.fill_initial_value(&self.dofs, &mut self.x, &mut self.scaling);
        }
        for bc in &self.system.boundaries {
            if bc.is_electrode() && !bc.is_interconnect() {
                bc.fill_coupled_value(&self.dofs, &mut self.x, &mut self.scaling);
            } else {
                bc.fill_initial_value(&self.dofs, &mut self.x, &mut self.scaling);
            }
        }
        self.system.circuit.fill_initial_value(rank, &self.dofs, &mut self.x, &mut self.scaling);
        self.scaling_local = self.scaling.gather(&self.comm);
    }

    pub fn pre_solve_process(&mut self, load_solution: bool) {
        if load_solution {
            self.fill_values();
        }
        for bc in self.system.boundaries.iter_mut() {
            bc.pre_process();
        }
    }

    /// Accept the current solution: clamp densities, update every collaborator and
    /// persist the circuit state (collective).
    pub fn post_solve_process(&mut self) {
        let rank = self.comm.rank();
        project_positive_density(&self.dofs, rank, self.config.density_floor, &mut self.x);
        let local = self.x.gather(&self.comm);
        for region in self.system.regions.iter_mut() {
            region.update_solution(&self.dofs, &local);
        }
        for bc in self.system.boundaries.iter_mut() {
            bc.update_solution(&self.dofs, &local);
        }
        self.system.circuit.save_state(rank, &self.dofs, &local);
    }

    /// Write an intermediate iterate into the regions without accepting it (collective).
    pub fn flush_system(&mut self, v: &DistributedVector) {
        let local = v.gather(&self.comm);
        for region in self.system.regions.iter_mut() {
            region.update_solution(&self.dofs, &local);
        }
    }

    /// Return to the last accepted state after a failed solve.
    pub fn diverged_recovery(&mut self) {
        self.fill_values();
        self.system.circuit.restore_state(self.comm.rank());
    }

    fn newton_solve(&mut self, time: Option<&TimeState>) -> Result<NewtonStats> {
        self.newton.solve(
            &self.comm,
            &self.dofs,
            &self.system,
            &mut self.assembler,
            self.linear.as_mut(),
            &mut self.x,
            &self.scaling_local,
            time,
        )
    }

    pub fn solve_dcop(&mut self) -> Result<RunReport> {
        let _span = tracing::info_span!("dc_operating_point").entered();
        self.pre_solve_process(true);
        let stats = self.newton_solve(None)?;
        self.post_solve_process();
        tracing::info!(iterations = stats.iterations, "operating point converged");

        let mut report = RunReport::default();
        report.push(StepRecord {
            parameter: 0.0,
            step: 0.0,
            order: None,
            newton_iterations: stats.iterations,
            lte: None,
            rejected: 0,
        });
        Ok(report)
    }

    pub fn solve_dcsweep(&mut self, sweep: &SweepSpec) -> Result<RunReport> {
        sweep.validate()?;
        let _span = tracing::info_span!("dc_sweep", start = sweep.start, stop = sweep.stop).entered();
        let rank = self.comm.rank();
        let direction = if sweep.stop >= sweep.start { 1.0 } else { -1.0 };
        let nominal = sweep.step.abs();
        let eps = nominal * 1e-9;

        let mut report = RunReport::default();
        let mut step = nominal;
        let mut value = sweep.start;
        let mut last_good: Option<f64> = None;
        let mut retries = 0;

        self.pre_solve_process(true);
        loop {
            self.system.circuit.apply_sweep_value(rank, value);
            self.pre_solve_process(false);

            match self.newton_solve(None) {
                Ok(stats) => {
                    self.post_solve_process();
                    tracing::debug!(value, iterations = stats.iterations, "sweep point converged");
                    report.push(StepRecord {
                        parameter: value,
                        step: last_good.map_or(0.0, |g| (value - g).abs()),
                        order: None,
                        newton_iterations: stats.iterations,
                        lte: None,
                        rejected: retries,
                    });
                    last_good = Some(value);
                    retries = 0;
                    step = (step * 2.0).min(nominal);
                }
                Err(e) if e.is_recoverable() => {
                    let Some(good) = last_good else {
                        return Err(e);
                    };
                    retries += 1;
                    step *= 0.5;
                    tracing::warn!(value, retries, next_step = step, error = %e, "sweep point failed, cutting back");
                    if retries > self.config.max_retries || step < sweep.min_step {
                        return Err(MixError::RetryBudgetExhausted { at: value, step });
                    }
                    self.diverged_recovery();
                    value = good + direction * step;
                    continue;
                }
                Err(e) => return Err(e),
            }

            if (sweep.stop - value) * direction <= eps {
                break;
            }
            value += direction * step;
            if (sweep.stop - value) * direction < 0.0 {
                value = sweep.stop;
            }
        }
        Ok(report)
    }

    pub fn solve_transient(&mut self, spec: &TransientSpec) -> Result<RunReport> {
        spec.validate()?;
        let _span = tracing::info_span!("transient", t_start = spec.t_start, t_stop = spec.t_stop).entered();
        let rank = self.comm.rank();
        let mut report = RunReport::default();

        self.pre_solve_process(true);
        if spec.initial_operating_point {
            let stats = self.newton_solve(None)?;
            self.post_solve_process();
            report.push(StepRecord {
                parameter: spec.t_start,
                step: 0.0,
                order: None,
                newton_iterations: stats.iterations,
                lte: None,
                rejected: 0,
            });
        }
        self.integrator.reset(self.x.clone());

        let eps = (spec.t_stop - spec.t_start).abs() * 1e-12;
        let mut t = spec.t_start;
        let mut dt = spec.dt_initial.clamp(spec.dt_min, spec.dt_max);
        let mut rejected = 0;

        while spec.t_stop - t > eps {
            dt = dt.min(spec.t_stop - t);

            if self.config.order == IntegrationOrder::Second && self.integrator.history_len() >= 2 {
                let safe = self.integrator.order_is_safe(&self.comm, &self.dofs, dt);
                if !safe {
                    tracing::debug!(t, dt, "BDF2 unsafe for densities, using BDF1");
                }
                self.integrator.set_lower_order(!safe);
            }
            let order = self.integrator.active_order();
            let predictor_order = self.integrator.predictor_order();
            let time_state = self.integrator.time_state(&self.comm, t + dt, dt);

            if spec.predict {
                if let Some(mut xp) = self.integrator.predict(dt) {
                    project_positive_density(&self.dofs, rank, self.config.density_floor, &mut xp);
                    self.x = xp;
                }
            }
            self.pre_solve_process(false);

            let _step_span = tracing::debug_span!("time_step", t, dt, order = order.as_usize()).entered();
            let stats = match self.newton_solve(Some(&time_state)) {
                Ok(stats) => stats,
                Err(e) if e.is_recoverable() => {
                    rejected += 1;
                    tracing::warn!(t, dt, rejected, error = %e, "time step diverged, shrinking");
                    if rejected > self.config.max_retries || dt * 0.5 < spec.dt_min {
                        return Err(MixError::RetryBudgetExhausted { at: t, step: dt });
                    }
                    self.diverged_recovery();
                    dt *= 0.5;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let lte = if spec.auto_step {
                self.integrator.lte_estimate(&self.comm, &self.dofs, dt, &self.x)
            } else {
                None
            };

            if let (Some(lte), Some(p)) = (lte, predictor_order) {
                if (lte > 1.0 || lte.is_nan()) && dt > spec.dt_min {
                    rejected += 1;
                    let shrunk = (dt * TimeIntegrator::step_factor(lte, p)).max(spec.dt_min);
                    tracing::debug!(t, dt, lte, next_dt = shrunk, "step rejected by truncation error");
                    if rejected > self.config.max_retries {
                        return Err(MixError::RetryBudgetExhausted { at: t, step: dt });
                    }
                    if let Some(latest) = self.integrator.latest() {
                        self.x = latest.clone();
                    }
                    dt = shrunk;
                    continue;
                }
            }

            t += dt;
            self.post_solve_process();
            self.integrator.accept(self.x.clone(), dt);
            report.push(StepRecord {
                parameter: t,
                step: dt,
                order: Some(order),
                newton_iterations: stats.iterations,
                lte,
                rejected,
            });
            rejected = 0;

            if let (Some(lte), Some(p)) = (lte, predictor_order) {
                dt *= TimeIntegrator::step_factor(lte, p);
            }
            dt = dt.clamp(spec.dt_min, spec.dt_max);
        }

        tracing::info!(steps = report.len(), rejected = report.rejected_steps(), "transient finished");
        Ok(report)
    }
}
