//! Residual and Jacobian assembly over regions, boundaries and the circuit.
//!
//! Each evaluation rebuilds the full system from the current iterate in a fixed
//! order: region terms (steady, time, hanging nodes), circuit stamps on the owning
//! rank, cross-rank reduction, boundary row redirection, boundary equations, and
//! finally row scaling. The Jacobian sparsity is open during the first assembly,
//! when boundaries reserve every position they will ever write, and frozen after it.

use tracing::debug_span;

use crate::core::layout::DofMap;
use crate::core::traits::{BoundaryCondition, EvalContext, Region};
use crate::core::vector::{LocalVector, VectorBuffer, first_non_finite};
use crate::error::{MixError, Result};
use crate::matrix::{SparseMatrix, TripletBuffer};
use crate::parallel::{Comm, agree};
use crate::solver::circuit_bridge::CircuitBridge;
use crate::solver::row_coupler::{RowCoupler, RowRequests};
use crate::solver::time_integrator::TimeState;

/// Everything that contributes equations.
pub struct DeviceSystem {
    pub regions: Vec<Box<dyn Region>>,
    pub boundaries: Vec<Box<dyn BoundaryCondition>>,
    pub circuit: CircuitBridge,
}

impl DeviceSystem {
    pub fn new(regions: Vec<Box<dyn Region>>, boundaries: Vec<Box<dyn BoundaryCondition>>, circuit: CircuitBridge) -> Self {
        Self { regions, boundaries, circuit }
    }

    /// Circuit-coupled electrodes need a circuit engine somewhere in the job.
    pub fn validate(&self) -> Result<()> {
        if self.circuit.owner_rank().is_some() {
            return Ok(());
        }
        match self.boundaries.iter().find(|bc| bc.is_circuit_coupled()) {
            Some(bc) => Err(MixError::InvalidConfig(format!(
                "boundary `{}` is circuit-coupled but no circuit is attached",
                bc.name()
            ))),
            None => Ok(()),
        }
    }
}

pub struct Assembler {
    jacobian: SparseMatrix,
    first_assembly: bool,
    t_external: f64,
}

fn check_vector(stage: &'static str, values: &[f64]) -> Result<()> {
    match first_non_finite(values) {
        Some(row) => Err(MixError::NumericalFault { stage, row }),
        None => Ok(()),
    }
}

fn check_matrix(stage: &'static str, j: &SparseMatrix) -> Result<()> {
    match j.first_non_finite() {
        Some((row, _)) => Err(MixError::NumericalFault { stage, row }),
        None => Ok(()),
    }
}

impl Assembler {
    pub fn new(n_dofs: usize, t_external: f64) -> Self {
        Self {
            jacobian: SparseMatrix::new(n_dofs),
            first_assembly: true,
            t_external,
        }
    }

    pub fn is_first_assembly(&self) -> bool {
        self.first_assembly
    }

    pub fn jacobian(&self) -> &SparseMatrix {
        &self.jacobian
    }

    fn context<'a>(&self, comm: &dyn Comm, dofs: &'a DofMap, time: Option<&'a TimeState>) -> EvalContext<'a> {
        EvalContext {
            dofs,
            rank: comm.rank(),
            t_external: self.t_external,
            time,
        }
    }

    fn region_residual(region: &dyn Region, ctx: &EvalContext<'_>, x: &LocalVector, n: usize) -> Result<VectorBuffer> {
        let mut buf = VectorBuffer::zeros(n);
        region.evaluate_residual(ctx, x, &mut buf)?;
        if ctx.time_dependent() {
            region.evaluate_time_residual(ctx, x, &mut buf)?;
        }
        region.hanging_node_residual(ctx, x, &mut buf)?;
        Ok(buf)
    }

    fn region_jacobian(region: &dyn Region, ctx: &EvalContext<'_>, x: &LocalVector) -> Result<TripletBuffer> {
        let mut buf = TripletBuffer::new();
        region.evaluate_jacobian(ctx, x, &mut buf)?;
        if ctx.time_dependent() {
            region.evaluate_time_jacobian(ctx, x, &mut buf)?;
        }
        region.hanging_node_jacobian(ctx, x, &mut buf)?;
        Ok(buf)
    }

    #[cfg(feature = "rayon")]
    fn region_residuals(system: &DeviceSystem, ctx: &EvalContext<'_>, x: &LocalVector) -> Result<Vec<VectorBuffer>> {
        use rayon::prelude::*;
        system
            .regions
            .par_iter()
            .map(|region| Self::region_residual(region.as_ref(), ctx, x, x.len()))
            .collect()
    }

    #[cfg(not(feature = "rayon"))]
    fn region_residuals(system: &DeviceSystem, ctx: &EvalContext<'_>, x: &LocalVector) -> Result<Vec<VectorBuffer>> {
        system
            .regions
            .iter()
            .map(|region| Self::region_residual(region.as_ref(), ctx, x, x.len()))
            .collect()
    }

    #[cfg(feature = "rayon")]
    fn region_jacobians(system: &DeviceSystem, ctx: &EvalContext<'_>, x: &LocalVector) -> Result<Vec<TripletBuffer>> {
        use rayon::prelude::*;
        system
            .regions
            .par_iter()
            .map(|region| Self::region_jacobian(region.as_ref(), ctx, x))
            .collect()
    }

    #[cfg(not(feature = "rayon"))]
    fn region_jacobians(system: &DeviceSystem, ctx: &EvalContext<'_>, x: &LocalVector) -> Result<Vec<TripletBuffer>> {
        system
            .regions
            .iter()
            .map(|region| Self::region_jacobian(region.as_ref(), ctx, x))
            .collect()
    }

    /// Region terms plus the circuit stamp, before any cross-rank reduction.
    fn device_residual(system: &DeviceSystem, ctx: &EvalContext<'_>, x: &LocalVector) -> Result<VectorBuffer> {
        let mut local = VectorBuffer::zeros(x.len());
        for buf in Self::region_residuals(system, ctx, x)? {
            local.merge(&buf);
        }
        system.circuit.stamp_residual(ctx, x, &mut local)?;
        Ok(local)
    }

    fn device_jacobian(system: &DeviceSystem, ctx: &EvalContext<'_>, x: &LocalVector) -> Result<Vec<TripletBuffer>> {
        let mut buffers = Self::region_jacobians(system, ctx, x)?;
        let mut circuit = TripletBuffer::new();
        system.circuit.stamp_jacobian(ctx, x, &mut circuit)?;
        buffers.push(circuit);
        Ok(buffers)
    }

    /// Row redirections requested by every boundary on every rank (collective).
    fn row_requests(system: &DeviceSystem, comm: &dyn Comm, ctx: &EvalContext<'_>, x: &LocalVector) -> Result<RowRequests> {
        let mut requests = RowRequests::new();
        let local = system
            .boundaries
            .iter()
            .try_for_each(|bc| bc.preprocess(ctx, x, &mut requests))
            .and_then(|()| requests.validate());
        agree(comm, "boundary preprocess", local)?;
        requests.synchronize(comm)
    }

    /// Scaled residual `L∘F(x)`, replicated on every rank (collective).
    pub fn assemble_residual(
        &self,
        comm: &dyn Comm,
        dofs: &DofMap,
        system: &DeviceSystem,
        x: &LocalVector,
        scaling: &LocalVector,
        time: Option<&TimeState>,
    ) -> Result<Vec<f64>> {
        let _span = debug_span!("assemble_residual").entered();
        let ctx = self.context(comm, dofs, time);
        let n = dofs.n_dofs();

        let local = agree(comm, "region residual", Self::device_residual(system, &ctx, x))?;
        let mut r = local.finalize(comm);
        check_vector("region residual", &r)?;

        let requests = Self::row_requests(system, comm, &ctx, x)?;
        RowCoupler::couple_vector(&requests, &mut r)?;

        let mut bc_local = VectorBuffer::zeros(n);
        let evaluated = system
            .boundaries
            .iter()
            .try_for_each(|bc| bc.evaluate_residual(&ctx, x, &mut bc_local));
        agree(comm, "boundary residual", evaluated)?;
        for (ri, bi) in r.iter_mut().zip(bc_local.finalize(comm)) {
            *ri += bi;
        }
        check_vector("boundary residual", &r)?;

        for (ri, &li) in r.iter_mut().zip(scaling.iter()) {
            *ri *= li;
        }
        check_vector("residual scaling", &r)?;
        Ok(r)
    }

    /// Scaled Jacobian `diag(L)·J(x)`, kept in [`Assembler::jacobian`] (collective).
    pub fn assemble_jacobian(
        &mut self,
        comm: &dyn Comm,
        dofs: &DofMap,
        system: &DeviceSystem,
        x: &LocalVector,
        scaling: &LocalVector,
        time: Option<&TimeState>,
    ) -> Result<()> {
        let _span = debug_span!("assemble_jacobian", first = self.first_assembly).entered();
        let ctx = self.context(comm, dofs, time);

        self.jacobian.zero_entries();
        let buffers = agree(comm, "region jacobian", Self::device_jacobian(system, &ctx, x))?;
        self.jacobian.accumulate(comm, &buffers)?;
        check_matrix("region jacobian", &self.jacobian)?;

        if self.first_assembly {
            let mut reserved = TripletBuffer::new();
            for bc in &system.boundaries {
                bc.reserve_jacobian(&ctx, &mut reserved);
            }
            self.jacobian.accumulate(comm, &[reserved])?;
        }

        let requests = Self::row_requests(system, comm, &ctx, x)?;
        RowCoupler::couple_matrix(&requests, &mut self.jacobian)?;

        let mut bc_local = TripletBuffer::new();
        let evaluated = system
            .boundaries
            .iter()
            .try_for_each(|bc| bc.evaluate_jacobian(&ctx, x, &mut bc_local));
        agree(comm, "boundary jacobian", evaluated)?;
        self.jacobian.accumulate(comm, &[bc_local])?;
        check_matrix("boundary jacobian", &self.jacobian)?;

        if self.first_assembly {
            self.jacobian.freeze();
            self.first_assembly = false;
        }

        self.jacobian.scale_rows(scaling);
        check_matrix("jacobian scaling", &self.jacobian)?;
        Ok(())
    }

    /// Both halves of the Newton system at `x`.
    pub fn assemble(
        &mut self,
        comm: &dyn Comm,
        dofs: &DofMap,
        system: &DeviceSystem,
        x: &LocalVector,
        scaling: &LocalVector,
        time: Option<&TimeState>,
    ) -> Result<Vec<f64>> {
        let r = self.assemble_residual(comm, dofs, system, x, scaling, time)?;
        self.assemble_jacobian(comm, dofs, system, x, scaling, time)?;
        Ok(r)
    }
}

/// Undo the row scaling of a residual.
pub fn unscale(residual: &mut [f64], scaling: &[f64]) {
    for (ri, &li) in residual.iter_mut().zip(scaling) {
        *ri /= li;
    }
}
