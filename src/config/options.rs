//! Run configuration consumed by the driver.
//!
//! Everything the solver needs to know about the run is collected in an immutable
//! [`SolverConfig`] injected at driver construction: the mode (operating point, DC
//! sweep or transient), integration order and tolerances, the damping chain, the
//! ambient temperature and the Newton stopping criteria. Option enums parse from
//! strings so deck or command-line front ends can build a config directly.

use std::str::FromStr;

use crate::error::{MixError, Result};

/// Backward differentiation formula order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationOrder {
    /// BDF1 (backward Euler).
    First,
    /// Variable-step BDF2; falls back to BDF1 while history is short or unsafe.
    Second,
}

impl IntegrationOrder {
    pub fn as_usize(self) -> usize {
        match self {
            IntegrationOrder::First => 1,
            IntegrationOrder::Second => 2,
        }
    }
}

impl FromStr for IntegrationOrder {
    type Err = MixError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bdf1" | "first" | "1" => Ok(IntegrationOrder::First),
            "bdf2" | "second" | "2" => Ok(IntegrationOrder::Second),
            _ => Err(MixError::UnknownOption(s.to_string())),
        }
    }
}

/// Newton step safeguards, applied in the order listed in [`SolverConfig::damping`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DampingKind {
    /// Logarithmic compression of large potential updates.
    Potential,
    /// Density floor and 1 V potential step bound.
    PositiveDensity,
    /// Reserved slot; currently leaves the step untouched.
    BankRose,
}

impl FromStr for DampingKind {
    type Err = MixError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "potential" => Ok(DampingKind::Potential),
            "positive" | "positivedensity" | "positive_density" => Ok(DampingKind::PositiveDensity),
            "bankrose" | "bank_rose" => Ok(DampingKind::BankRose),
            _ => Err(MixError::UnknownOption(s.to_string())),
        }
    }
}

/// Stepped DC sweep of the circuit's swept source.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepSpec {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
    /// Smallest increment the cut-back may reach before giving up.
    pub min_step: f64,
}

impl SweepSpec {
    pub fn new(start: f64, stop: f64, step: f64) -> Self {
        Self { start, stop, step, min_step: step.abs() * 1e-3 }
    }

    /// The sweep must advance: finite bounds, a non-zero step and `0 < min_step ≤ |step|`.
    pub fn validate(&self) -> Result<()> {
        if !self.start.is_finite() || !self.stop.is_finite() {
            return Err(invalid(format!("sweep bounds {} .. {}", self.start, self.stop)));
        }
        if !self.step.is_finite() || self.step == 0.0 {
            return Err(invalid(format!("sweep step {}", self.step)));
        }
        if !(self.min_step > 0.0 && self.min_step <= self.step.abs()) {
            return Err(invalid(format!("sweep min_step {} for step {}", self.min_step, self.step)));
        }
        Ok(())
    }
}

fn invalid(what: String) -> MixError {
    MixError::InvalidConfig(what)
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransientSpec {
    pub t_start: f64,
    pub t_stop: f64,
    pub dt_initial: f64,
    pub dt_min: f64,
    pub dt_max: f64,
    /// Accept/reject and resize steps from the LTE estimate.
    pub auto_step: bool,
    /// Start each Newton solve from the predictor instead of the last solution.
    pub predict: bool,
    /// Solve the operating point at `t_start` before stepping.
    pub initial_operating_point: bool,
}

impl TransientSpec {
    pub fn new(t_start: f64, t_stop: f64, dt_initial: f64) -> Self {
        Self {
            t_start,
            t_stop,
            dt_initial,
            dt_min: dt_initial * 1e-6,
            dt_max: (t_stop - t_start).abs(),
            auto_step: true,
            predict: true,
            initial_operating_point: false,
        }
    }

    /// Finite times with `t_start ≤ t_stop`, and `0 < dt_min ≤ dt_max` with a positive
    /// initial step.
    pub fn validate(&self) -> Result<()> {
        if !self.t_start.is_finite() || !self.t_stop.is_finite() || self.t_stop < self.t_start {
            return Err(invalid(format!("transient interval {} .. {}", self.t_start, self.t_stop)));
        }
        if !(self.dt_min > 0.0 && self.dt_min <= self.dt_max && self.dt_max.is_finite()) {
            return Err(invalid(format!("step bounds dt_min {} dt_max {}", self.dt_min, self.dt_max)));
        }
        if !(self.dt_initial > 0.0 && self.dt_initial.is_finite()) {
            return Err(invalid(format!("initial step {}", self.dt_initial)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SolveMode {
    OperatingPoint,
    DcSweep(SweepSpec),
    Transient(TransientSpec),
}

/// Newton stopping criteria, in the collaborators' (unscaled) residual units.
#[derive(Debug, Clone, PartialEq)]
pub struct NewtonOptions {
    pub max_iterations: usize,
    pub poisson_tol: f64,
    pub continuity_tol: f64,
    pub circuit_tol: f64,
    /// Relative update size ‖Δx‖/‖x‖ accepted as converged...
    pub relative_step_tol: f64,
    /// ...provided every residual is within `relax_factor` × its tolerance.
    pub relax_factor: f64,
}

impl Default for NewtonOptions {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            poisson_tol: 1e-10,
            continuity_tol: 1e-10,
            circuit_tol: 1e-10,
            relative_step_tol: 1e-8,
            relax_factor: 1e4,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolverConfig {
    pub mode: SolveMode,
    pub order: IntegrationOrder,
    /// Relative transient tolerance on carrier densities.
    pub ts_rtol: f64,
    /// Absolute transient tolerance on carrier densities (cm⁻³).
    pub ts_atol: f64,
    /// Fraction of the thermal voltage used by potential damping.
    pub potential_update: f64,
    /// Ambient temperature (K).
    pub t_external: f64,
    pub damping: Vec<DampingKind>,
    /// Lowest admissible carrier density (cm⁻³).
    pub density_floor: f64,
    pub newton: NewtonOptions,
    /// Recovery attempts per transient step or sweep point.
    pub max_retries: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            mode: SolveMode::OperatingPoint,
            order: IntegrationOrder::Second,
            ts_rtol: 1e-3,
            ts_atol: 1e7,
            potential_update: 1.0,
            t_external: 300.0,
            damping: vec![DampingKind::Potential, DampingKind::PositiveDensity],
            density_floor: 1.0,
            newton: NewtonOptions::default(),
            max_retries: 8,
        }
    }
}

impl SolverConfig {
    pub fn new(mode: SolveMode) -> Self {
        Self { mode, ..Self::default() }
    }

    pub fn with_order(mut self, order: IntegrationOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_tolerances(mut self, rtol: f64, atol: f64) -> Self {
        self.ts_rtol = rtol;
        self.ts_atol = atol;
        self
    }

    pub fn with_damping(mut self, damping: Vec<DampingKind>) -> Self {
        self.damping = damping;
        self
    }

    pub fn with_density_floor(mut self, floor: f64) -> Self {
        self.density_floor = floor;
        self
    }

    pub fn with_newton(mut self, newton: NewtonOptions) -> Self {
        self.newton = newton;
        self
    }

    pub fn with_temperature(mut self, t_external: f64) -> Self {
        self.t_external = t_external;
        self
    }

    /// Reject settings that would hang the driver or poison the solve with NaN.
    pub fn validate(&self) -> Result<()> {
        if !(self.ts_atol > 0.0 && self.ts_atol.is_finite()) {
            return Err(invalid(format!("ts_atol {}", self.ts_atol)));
        }
        if !(self.ts_rtol >= 0.0 && self.ts_rtol.is_finite()) {
            return Err(invalid(format!("ts_rtol {}", self.ts_rtol)));
        }
        if !(self.t_external > 0.0 && self.t_external.is_finite()) {
            return Err(invalid(format!("temperature {}", self.t_external)));
        }
        if !(self.potential_update > 0.0 && self.potential_update.is_finite()) {
            return Err(invalid(format!("potential_update {}", self.potential_update)));
        }
        match &self.mode {
            SolveMode::OperatingPoint => Ok(()),
            SolveMode::DcSweep(sweep) => sweep.validate(),
            SolveMode::Transient(spec) => spec.validate(),
        }
    }

    /// Time-derivative terms are assembled only in transient mode.
    pub fn time_dependent(&self) -> bool {
        matches!(self.mode, SolveMode::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_names_parse() {
        assert_eq!("BDF2".parse::<IntegrationOrder>().unwrap(), IntegrationOrder::Second);
        assert_eq!("first".parse::<IntegrationOrder>().unwrap(), IntegrationOrder::First);
        assert_eq!("positive".parse::<DampingKind>().unwrap(), DampingKind::PositiveDensity);
        assert!(matches!("bdf3".parse::<IntegrationOrder>(), Err(MixError::UnknownOption(_))));
    }

    #[test]
    fn degenerate_specs_are_rejected() {
        assert!(SweepSpec::new(0.0, 1.0, 0.25).validate().is_ok());
        assert!(matches!(SweepSpec::new(0.0, 1.0, 0.0).validate(), Err(MixError::InvalidConfig(_))));
        assert!(SweepSpec::new(0.0, 1.0, f64::NAN).validate().is_err());
        let mut sweep = SweepSpec::new(0.0, 1.0, 0.1);
        sweep.min_step = 0.5;
        assert!(sweep.validate().is_err());

        assert!(TransientSpec::new(0.0, 1.0, 0.1).validate().is_ok());
        let mut spec = TransientSpec::new(0.0, 1.0, 0.1);
        spec.dt_min = 0.5;
        spec.dt_max = 0.2;
        assert!(matches!(spec.validate(), Err(MixError::InvalidConfig(_))));
        spec.dt_min = f64::NAN;
        assert!(spec.validate().is_err());
        assert!(TransientSpec::new(1.0, 0.0, 0.1).validate().is_err());
    }

    #[test]
    fn zero_absolute_tolerance_is_rejected() {
        assert!(SolverConfig::default().validate().is_ok());
        let cfg = SolverConfig::default().with_tolerances(1e-3, 0.0);
        assert!(matches!(cfg.validate(), Err(MixError::InvalidConfig(_))));
        let cfg = SolverConfig::new(SolveMode::DcSweep(SweepSpec::new(0.0, 1.0, 0.0)));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn only_transient_is_time_dependent() {
        assert!(!SolverConfig::default().time_dependent());
        let cfg = SolverConfig::new(SolveMode::Transient(TransientSpec::new(0.0, 1e-9, 1e-12)));
        assert!(cfg.time_dependent());
    }
}
