//! BDF1/BDF2 history, prediction, truncation-error estimate and order control.
//!
//! Step sizes follow the usual naming: `hn` is the step being taken, `hn1` the step
//! that produced the latest accepted solution `x_n`, and `hn2` the one before it.
//! The predictor is an explicit extrapolation through the stored history; the
//! difference between the converged solution and the predictor, weighted by the
//! step ratio, estimates the local truncation error. Only carrier densities are
//! controlled; potentials and non-semiconductor unknowns are left out.
//!
//! # References
//! - Brenan, Campbell & Petzold, *Numerical Solution of Initial-Value Problems in
//!   Differential-Algebraic Equations*, §3.2 (variable-step BDF and error control).

use std::collections::VecDeque;

use crate::config::IntegrationOrder;
use crate::core::layout::{DofMap, RegionRole, slot};
use crate::core::vector::{DistributedVector, LocalVector};
use crate::parallel::Comm;

/// Step and history information handed to the time-derivative hooks.
#[derive(Debug, Clone)]
pub struct TimeState {
    /// Time at the end of the step being solved.
    pub time: f64,
    /// Order of the discretization used for this step.
    pub order: IntegrationOrder,
    pub dt: f64,
    pub dt_last: f64,
    history: Vec<LocalVector>,
}

impl TimeState {
    pub fn new(time: f64, order: IntegrationOrder, dt: f64, dt_last: f64, history: Vec<LocalVector>) -> Self {
        Self { time, order, dt, dt_last, history }
    }

    /// `history(0)` is the latest accepted solution, `history(1)` the one before.
    pub fn history(&self, k: usize) -> &LocalVector {
        &self.history[k]
    }

    /// Coefficients `[c0, c1, c2]` with `dx/dt ≈ c0·x + c1·x_n + c2·x_n1`.
    pub fn bdf_coefficients(&self) -> [f64; 3] {
        let hn = self.dt;
        match self.order {
            IntegrationOrder::First => [1.0 / hn, -1.0 / hn, 0.0],
            IntegrationOrder::Second => {
                let hn1 = self.dt_last;
                [
                    (2.0 * hn + hn1) / (hn * (hn + hn1)),
                    -(hn + hn1) / (hn * hn1),
                    hn / (hn1 * (hn + hn1)),
                ]
            }
        }
    }

    /// Discrete time derivative of unknown `index` given its current value.
    pub fn derivative(&self, index: usize, value: f64) -> f64 {
        let [c0, c1, c2] = self.bdf_coefficients();
        let mut d = c0 * value + c1 * self.history[0][index];
        if self.order == IntegrationOrder::Second {
            d += c2 * self.history[1][index];
        }
        d
    }

    /// ∂(derivative)/∂(value), for Jacobian hooks.
    pub fn derivative_coefficient(&self) -> f64 {
        self.bdf_coefficients()[0]
    }
}

pub struct TimeIntegrator {
    order: IntegrationOrder,
    rtol: f64,
    atol: f64,
    /// Accepted solutions, latest first; at most three are kept.
    history: VecDeque<DistributedVector>,
    /// `steps[0]` produced `history[0]`.
    steps: VecDeque<f64>,
    lower_order: bool,
}

impl TimeIntegrator {
    pub fn new(order: IntegrationOrder, rtol: f64, atol: f64) -> Self {
        Self {
            order,
            rtol,
            atol,
            history: VecDeque::with_capacity(3),
            steps: VecDeque::with_capacity(2),
            lower_order: false,
        }
    }

    /// Forget all history and start from `x0`.
    pub fn reset(&mut self, x0: DistributedVector) {
        self.history.clear();
        self.steps.clear();
        self.lower_order = false;
        self.history.push_front(x0);
    }

    /// Record an accepted solution produced by a step of size `dt`.
    pub fn accept(&mut self, x: DistributedVector, dt: f64) {
        self.history.push_front(x);
        self.history.truncate(3);
        self.steps.push_front(dt);
        self.steps.truncate(2);
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn latest(&self) -> Option<&DistributedVector> {
        self.history.front()
    }

    pub fn last_step(&self) -> Option<f64> {
        self.steps.front().copied()
    }

    /// Force BDF1 for the next step (`true`) or allow the configured order again.
    pub fn set_lower_order(&mut self, lower: bool) {
        self.lower_order = lower;
    }

    /// Discretization order for the next step.
    pub fn active_order(&self) -> IntegrationOrder {
        match self.order {
            IntegrationOrder::Second if self.history.len() >= 2 && !self.lower_order => IntegrationOrder::Second,
            _ => IntegrationOrder::First,
        }
    }

    /// Order of the extrapolation used by [`TimeIntegrator::predict`], if any.
    pub fn predictor_order(&self) -> Option<IntegrationOrder> {
        if self.history.len() < 2 {
            return None;
        }
        match self.active_order() {
            IntegrationOrder::Second if self.history.len() >= 3 => Some(IntegrationOrder::Second),
            _ => Some(IntegrationOrder::First),
        }
    }

    /// Gather the history needed by the time-derivative hooks (collective).
    pub fn time_state<C: Comm + ?Sized>(&self, comm: &C, time: f64, dt: f64) -> TimeState {
        let order = self.active_order();
        let history = self
            .history
            .iter()
            .take(order.as_usize())
            .map(|h| h.gather(comm))
            .collect();
        TimeState::new(time, order, dt, self.last_step().unwrap_or(dt), history)
    }

    /// Extrapolate the solution to the end of a step of size `hn`.
    pub fn predict(&self, hn: f64) -> Option<DistributedVector> {
        let order = self.predictor_order()?;
        let hn1 = self.steps[0];
        let mut xp = self.history[0].zeros_like();
        match order {
            IntegrationOrder::First => {
                xp.axpy(1.0 + hn / hn1, &self.history[0]);
                xp.axpy(-hn / hn1, &self.history[1]);
            }
            IntegrationOrder::Second => {
                let hn2 = self.steps[1];
                let cn = 1.0 + hn * (hn + 2.0 * hn1 + hn2) / (hn1 * (hn1 + hn2));
                let cn1 = -hn * (hn + hn1 + hn2) / (hn1 * hn2);
                let cn2 = hn * (hn + hn1) / (hn2 * (hn1 + hn2));
                xp.axpy(cn, &self.history[0]);
                xp.axpy(cn1, &self.history[1]);
                xp.axpy(cn2, &self.history[2]);
            }
        }
        Some(xp)
    }

    /// Normalized local truncation error of the converged step `x` (collective).
    ///
    /// Returns `None` when there is not enough history to predict, and exactly `1.0`
    /// when no unknown is under error control anywhere.
    pub fn lte_estimate<C: Comm + ?Sized>(&self, comm: &C, dofs: &DofMap, hn: f64, x: &DistributedVector) -> Option<f64> {
        let order = self.predictor_order()?;
        let xp = self.predict(hn)?;
        let hn1 = self.steps[0];
        let w = match order {
            IntegrationOrder::First => hn / (hn + hn1),
            IntegrationOrder::Second => hn / (hn + hn1 + self.steps[1]),
        };

        let mut sum_sq = 0.0;
        let mut n_controlled = 0;
        for node in dofs.owned_nodes(comm.rank()) {
            if node.role != RegionRole::Semiconductor {
                continue;
            }
            for s in [slot::ELECTRON, slot::HOLE] {
                let i = node.index(s);
                let value = x.get(i);
                let e = w * (value - xp.get(i)) / (self.rtol * value.abs() + self.atol);
                sum_sq += e * e;
            }
            n_controlled += 2;
        }

        let n_controlled = comm.all_reduce_count(n_controlled);
        if n_controlled == 0 {
            return Some(1.0);
        }
        let norm = comm.all_reduce(sum_sq).sqrt();
        Some(norm / (n_controlled as f64).sqrt())
    }

    /// Whether BDF2 keeps carrier densities positive for a next step of `hn` (collective).
    ///
    /// With `r = hn1/(hn1+hn)`, `a = 1/(r(1−r))` and `b = (1−r)/r`, every semiconductor
    /// node must satisfy `a·n ≥ b·n_last` and `a·p ≥ b·p_last`.
    pub fn order_is_safe<C: Comm + ?Sized>(&self, comm: &C, dofs: &DofMap, hn: f64) -> bool {
        let mut failures = 0;
        if self.history.len() >= 2 {
            let hn1 = self.steps[0];
            let r = hn1 / (hn1 + hn);
            let a = 1.0 / (r * (1.0 - r));
            let b = (1.0 - r) / r;
            let (now, last) = (&self.history[0], &self.history[1]);
            for node in dofs.owned_nodes(comm.rank()) {
                if node.role != RegionRole::Semiconductor {
                    continue;
                }
                for s in [slot::ELECTRON, slot::HOLE] {
                    let i = node.index(s);
                    if a * now.get(i) < b * last.get(i) {
                        failures += 1;
                    }
                }
            }
        }
        comm.all_reduce_count(failures) == 0
    }

    /// Step-size multiplier for an LTE of `lte` with a predictor of order `order`.
    pub fn step_factor(lte: f64, order: IntegrationOrder) -> f64 {
        if lte.is_nan() {
            return 0.1;
        }
        if lte <= 0.0 {
            return 2.0;
        }
        let p = order.as_usize() as f64;
        (0.9 * lte.powf(-1.0 / (p + 1.0))).clamp(0.1, 2.0)
    }
}
