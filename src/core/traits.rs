//! Collaborator contracts for the solver core.
//!
//! The physics lives outside this crate. Regions, boundary conditions and the circuit
//! engine plug in through the traits below; the solver only sequences their calls,
//! reduces their contributions across ranks and performs the row surgery that couples
//! device and circuit unknowns.

use crate::core::layout::{DofMap, NodeId, RegionRole};
use crate::core::vector::{DistributedVector, LocalVector, VectorBuffer};
use crate::error::Result;
use crate::matrix::TripletBuffer;
use crate::solver::row_coupler::RowRequests;
use crate::solver::time_integrator::TimeState;

/// What every evaluation hook gets to see besides the iterate.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub dofs: &'a DofMap,
    pub rank: usize,
    /// Ambient lattice temperature (K).
    pub t_external: f64,
    /// Step sizes and history; `Some` only while time-integrating.
    pub time: Option<&'a TimeState>,
}

impl EvalContext<'_> {
    pub fn time_dependent(&self) -> bool {
        self.time.is_some()
    }
}

/// A mesh region: its equations, evaluated over the nodes this rank owns.
pub trait Region: Send + Sync {
    fn name(&self) -> &str;
    fn role(&self) -> RegionRole;
    /// Nodes of this region owned by the current rank.
    fn nodes(&self) -> &[NodeId];

    /// Write the stored state and the per-unknown scaling into owned slots.
    fn fill_initial_value(&self, dofs: &DofMap, x: &mut DistributedVector, scaling: &mut DistributedVector);

    fn evaluate_residual(&self, ctx: &EvalContext<'_>, x: &LocalVector, r: &mut VectorBuffer) -> Result<()>;
    fn evaluate_jacobian(&self, ctx: &EvalContext<'_>, x: &LocalVector, j: &mut TripletBuffer) -> Result<()>;

    fn evaluate_time_residual(&self, _ctx: &EvalContext<'_>, _x: &LocalVector, _r: &mut VectorBuffer) -> Result<()> {
        Ok(())
    }
    fn evaluate_time_jacobian(&self, _ctx: &EvalContext<'_>, _x: &LocalVector, _j: &mut TripletBuffer) -> Result<()> {
        Ok(())
    }

    /// Constraint terms for nodes created by local refinement.
    fn hanging_node_residual(&self, _ctx: &EvalContext<'_>, _x: &LocalVector, _r: &mut VectorBuffer) -> Result<()> {
        Ok(())
    }
    fn hanging_node_jacobian(&self, _ctx: &EvalContext<'_>, _x: &LocalVector, _j: &mut TripletBuffer) -> Result<()> {
        Ok(())
    }

    /// Store a converged solution back into the region's own node data.
    fn update_solution(&mut self, dofs: &DofMap, x: &LocalVector);
}

/// How a boundary's unknown relates to the circuit engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Coupling {
    #[default]
    None,
    /// The electrode potential is a circuit node; the device current feeds the circuit row.
    Circuit,
    /// Electrodes tied together by an interconnect.
    Interconnect,
}

pub trait BoundaryCondition: Send + Sync {
    fn name(&self) -> &str;
    fn is_electrode(&self) -> bool;

    fn coupling(&self) -> Coupling {
        Coupling::None
    }
    fn is_circuit_coupled(&self) -> bool {
        self.coupling() == Coupling::Circuit
    }
    fn is_interconnect(&self) -> bool {
        self.coupling() == Coupling::Interconnect
    }

    fn fill_initial_value(&self, _dofs: &DofMap, _x: &mut DistributedVector, _scaling: &mut DistributedVector) {}

    /// Fill variant for electrodes whose potential may be driven by the circuit.
    fn fill_coupled_value(&self, dofs: &DofMap, x: &mut DistributedVector, scaling: &mut DistributedVector) {
        self.fill_initial_value(dofs, x, scaling)
    }

    /// Called once before every solve.
    fn pre_process(&mut self) {}

    /// Register rows to fold into other rows and rows to clear.
    fn preprocess(&self, _ctx: &EvalContext<'_>, _x: &LocalVector, _requests: &mut RowRequests) -> Result<()> {
        Ok(())
    }

    /// Claim every Jacobian position this boundary will ever write. First assembly only.
    fn reserve_jacobian(&self, _ctx: &EvalContext<'_>, _j: &mut TripletBuffer) {}

    fn evaluate_residual(&self, ctx: &EvalContext<'_>, x: &LocalVector, r: &mut VectorBuffer) -> Result<()>;
    fn evaluate_jacobian(&self, ctx: &EvalContext<'_>, x: &LocalVector, j: &mut TripletBuffer) -> Result<()>;

    fn update_solution(&mut self, _dofs: &DofMap, _x: &LocalVector) {}
}

/// The external circuit-equation engine. Lives on one rank only.
pub trait CircuitEngine: Send + Sync {
    fn fill_initial_value(&self, _dofs: &DofMap, _x: &mut DistributedVector, _scaling: &mut DistributedVector) {}

    fn stamp_residual(&self, ctx: &EvalContext<'_>, x: &LocalVector, r: &mut VectorBuffer) -> Result<()>;
    fn stamp_jacobian(&self, ctx: &EvalContext<'_>, x: &LocalVector, j: &mut TripletBuffer) -> Result<()>;

    /// L2 norm of the circuit's own equations at `x`.
    fn residual_norm(&self, dofs: &DofMap, x: &LocalVector) -> f64;

    /// Persist the solved circuit state.
    fn save_state(&mut self, dofs: &DofMap, x: &LocalVector);
    /// Return to the last persisted state.
    fn restore_state(&mut self);

    /// Set the swept source value for the next DC sweep point.
    fn apply_sweep_value(&mut self, _value: f64) {}
}
