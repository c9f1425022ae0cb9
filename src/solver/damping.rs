//! Newton step safeguards.
//!
//! Every policy inspects the previous iterate, the Newton step and the proposed
//! candidate `previous − step`, and may rewrite the candidate in place. Policies run
//! in the configured order, so each one sees what the previous ones left behind.

use bitflags::bitflags;
use num_traits::Float;
use tracing::trace;

use crate::config::{DampingKind, SolverConfig};
use crate::core::layout::{DofMap, RegionRole, slot};
use crate::core::vector::DistributedVector;
use crate::parallel::Comm;

/// Boltzmann constant over elementary charge (V/K).
pub const KB_OVER_Q: f64 = 8.617333262e-5;

/// Below this potential change (V) potential damping leaves the step alone.
const POTENTIAL_THRESHOLD: f64 = 1e-6;

/// Largest potential update (V) the positive-density policy lets through.
const MAX_POTENTIAL_STEP: f64 = 1.0;

bitflags! {
    /// What a damping policy touched.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DampingFlags: u8 {
        const CHANGED_STEP = 0b01;
        const CHANGED_CANDIDATE = 0b10;
    }
}

/// `ln(1 + r) / r` for `r = dv/vt`; tends to 1 as `dv → 0` and stays in (0, 1].
pub fn log_damping_factor<T: Float>(dv: T, vt: T) -> T {
    let r = dv / vt;
    if r <= T::zero() {
        return T::one();
    }
    r.ln_1p() / r
}

pub trait DampingPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Inspect and possibly rewrite `candidate` (collective).
    fn apply(
        &self,
        comm: &dyn Comm,
        dofs: &DofMap,
        previous: &DistributedVector,
        step: &mut DistributedVector,
        candidate: &mut DistributedVector,
    ) -> DampingFlags;
}

/// Logarithmic compression of large potential updates.
#[derive(Debug, Clone)]
pub struct PotentialDamping {
    /// Damping voltage `k·T/q · potential_update`.
    pub vt: f64,
}

impl PotentialDamping {
    pub fn new(t_external: f64, potential_update: f64) -> Self {
        Self { vt: KB_OVER_Q * t_external * potential_update }
    }
}

impl DampingPolicy for PotentialDamping {
    fn name(&self) -> &'static str {
        "potential"
    }

    fn apply(
        &self,
        comm: &dyn Comm,
        dofs: &DofMap,
        previous: &DistributedVector,
        step: &mut DistributedVector,
        candidate: &mut DistributedVector,
    ) -> DampingFlags {
        let rank = comm.rank();
        let local_max = dofs
            .owned_nodes(rank)
            .filter(|n| n.role == RegionRole::Semiconductor)
            .map(|n| step.get(n.potential()).abs())
            .fold(0.0, f64::max);
        let dv_max = comm.all_reduce_max(local_max);

        if dv_max <= POTENTIAL_THRESHOLD {
            return DampingFlags::empty();
        }

        let f = log_damping_factor(dv_max, self.vt);
        trace!(dv_max, factor = f, "potential damping");
        for node in dofs.owned_nodes(rank) {
            let i = node.potential();
            candidate.set(i, previous.get(i) - f * step.get(i));
        }
        DampingFlags::CHANGED_CANDIDATE
    }
}

/// Keeps carrier densities at or above the floor and bounds the potential update.
#[derive(Debug, Clone)]
pub struct PositiveDensityDamping {
    pub floor: f64,
}

impl DampingPolicy for PositiveDensityDamping {
    fn name(&self) -> &'static str {
        "positive-density"
    }

    fn apply(
        &self,
        comm: &dyn Comm,
        dofs: &DofMap,
        previous: &DistributedVector,
        step: &mut DistributedVector,
        candidate: &mut DistributedVector,
    ) -> DampingFlags {
        let mut clamped = 0;
        for node in dofs.owned_nodes(comm.rank()) {
            if node.role != RegionRole::Semiconductor {
                continue;
            }
            for s in [slot::ELECTRON, slot::HOLE] {
                let i = node.index(s);
                if candidate.get(i) < self.floor {
                    candidate.set(i, self.floor);
                    clamped += 1;
                }
            }
            let i = node.potential();
            let dv = step.get(i);
            if dv.abs() > MAX_POTENTIAL_STEP {
                candidate.set(i, previous.get(i) - dv.signum() * MAX_POTENTIAL_STEP);
                clamped += 1;
            }
        }

        if comm.all_reduce_count(clamped) > 0 {
            DampingFlags::CHANGED_CANDIDATE
        } else {
            DampingFlags::empty()
        }
    }
}

/// Reserved slot for Bank–Rose global damping. Leaves the step untouched.
#[derive(Debug, Clone, Default)]
pub struct BankRoseDamping;

impl DampingPolicy for BankRoseDamping {
    fn name(&self) -> &'static str {
        "bank-rose"
    }

    fn apply(
        &self,
        _comm: &dyn Comm,
        _dofs: &DofMap,
        _previous: &DistributedVector,
        _step: &mut DistributedVector,
        _candidate: &mut DistributedVector,
    ) -> DampingFlags {
        DampingFlags::empty()
    }
}

/// Unconditional density floor on an accepted solution. Local, no report.
pub fn project_positive_density(dofs: &DofMap, rank: usize, floor: f64, x: &mut DistributedVector) {
    for node in dofs.owned_nodes(rank) {
        if node.role != RegionRole::Semiconductor {
            continue;
        }
        for s in [slot::ELECTRON, slot::HOLE] {
            let i = node.index(s);
            if x.get(i) < floor {
                x.set(i, floor);
            }
        }
    }
}

pub struct DampingChain {
    policies: Vec<Box<dyn DampingPolicy>>,
}

impl DampingChain {
    pub fn new(policies: Vec<Box<dyn DampingPolicy>>) -> Self {
        Self { policies }
    }

    pub fn from_config(config: &SolverConfig) -> Self {
        let policies = config
            .damping
            .iter()
            .map(|kind| -> Box<dyn DampingPolicy> {
                match kind {
                    DampingKind::Potential => {
                        Box::new(PotentialDamping::new(config.t_external, config.potential_update))
                    }
                    DampingKind::PositiveDensity => Box::new(PositiveDensityDamping { floor: config.density_floor }),
                    DampingKind::BankRose => Box::new(BankRoseDamping),
                }
            })
            .collect();
        Self::new(policies)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Run every policy in order and union their flags (collective).
    pub fn apply(
        &self,
        comm: &dyn Comm,
        dofs: &DofMap,
        previous: &DistributedVector,
        step: &mut DistributedVector,
        candidate: &mut DistributedVector,
    ) -> DampingFlags {
        self.policies.iter().fold(DampingFlags::empty(), |acc, p| {
            let flags = p.apply(comm, dofs, previous, step, candidate);
            if !flags.is_empty() {
                trace!(policy = p.name(), ?flags, "damping applied");
            }
            acc | flags
        })
    }
}
