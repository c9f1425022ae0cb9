//! Access to the circuit engine from every rank.
//!
//! Circuit state is not replicated: the engine exists on one owning rank. Stamping,
//! save/restore and sweep updates run there only; circuit-derived scalars are computed
//! there and broadcast, never recomputed per rank.

use crate::core::layout::DofMap;
use crate::core::traits::{CircuitEngine, EvalContext};
use crate::core::vector::{DistributedVector, LocalVector, VectorBuffer};
use crate::error::Result;
use crate::matrix::TripletBuffer;
use crate::parallel::Comm;

pub struct CircuitBridge {
    engine: Option<Box<dyn CircuitEngine>>,
    owner: Option<usize>,
}

impl CircuitBridge {
    /// Bridge on the owning rank: pass the engine. On other ranks: pass `None`
    /// with the same `owner_rank`.
    pub fn new(engine: Option<Box<dyn CircuitEngine>>, owner_rank: usize) -> Self {
        Self { engine, owner: Some(owner_rank) }
    }

    /// Device-only simulation: no circuit on any rank.
    pub fn detached() -> Self {
        Self { engine: None, owner: None }
    }

    pub fn owner_rank(&self) -> Option<usize> {
        self.owner
    }

    fn local(&self, rank: usize) -> Option<&dyn CircuitEngine> {
        match self.owner {
            Some(owner) if owner == rank => self.engine.as_deref(),
            _ => None,
        }
    }

    fn local_mut(&mut self, rank: usize) -> Option<&mut (dyn CircuitEngine + 'static)> {
        match self.owner {
            Some(owner) if owner == rank => self.engine.as_deref_mut(),
            _ => None,
        }
    }

    pub fn fill_initial_value(&self, rank: usize, dofs: &DofMap, x: &mut DistributedVector, scaling: &mut DistributedVector) {
        if let Some(engine) = self.local(rank) {
            engine.fill_initial_value(dofs, x, scaling);
        }
    }

    pub fn stamp_residual(&self, ctx: &EvalContext<'_>, x: &LocalVector, r: &mut VectorBuffer) -> Result<()> {
        match self.local(ctx.rank) {
            Some(engine) => engine.stamp_residual(ctx, x, r),
            None => Ok(()),
        }
    }

    pub fn stamp_jacobian(&self, ctx: &EvalContext<'_>, x: &LocalVector, j: &mut TripletBuffer) -> Result<()> {
        match self.local(ctx.rank) {
            Some(engine) => engine.stamp_jacobian(ctx, x, j),
            None => Ok(()),
        }
    }

    /// Circuit residual norm, computed on the owner and broadcast (collective).
    pub fn residual_norm<C: Comm + ?Sized>(&self, comm: &C, dofs: &DofMap, x: &LocalVector) -> f64 {
        let Some(owner) = self.owner else {
            return 0.0;
        };
        let local = self
            .local(comm.rank())
            .map(|engine| engine.residual_norm(dofs, x))
            .unwrap_or(0.0);
        comm.broadcast(local, owner)
    }

    pub fn save_state(&mut self, rank: usize, dofs: &DofMap, x: &LocalVector) {
        if let Some(engine) = self.local_mut(rank) {
            engine.save_state(dofs, x);
        }
    }

    pub fn restore_state(&mut self, rank: usize) {
        if let Some(engine) = self.local_mut(rank) {
            engine.restore_state();
        }
    }

    pub fn apply_sweep_value(&mut self, rank: usize, value: f64) {
        if let Some(engine) = self.local_mut(rank) {
            engine.apply_sweep_value(value);
        }
    }
}
