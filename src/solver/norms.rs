//! Per-quantity solution and residual norms for the Newton stopping test.

use crate::core::layout::{DofMap, RegionRole, slot};
use crate::core::vector::{DistributedVector, LocalVector};
use crate::parallel::Comm;
use crate::solver::circuit_bridge::CircuitBridge;

/// Global L2 norms, residuals in unscaled units.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ErrorNorms {
    pub potential: f64,
    pub electron: f64,
    pub hole: f64,
    pub poisson: f64,
    pub electron_continuity: f64,
    pub hole_continuity: f64,
    pub circuit: f64,
}

impl ErrorNorms {
    /// Combined norm of the device unknowns.
    pub fn solution(&self) -> f64 {
        (self.potential.powi(2) + self.electron.powi(2) + self.hole.powi(2)).sqrt()
    }
}

pub struct NormEvaluator;

impl NormEvaluator {
    /// `residual` is the full, scaled residual; `scaling` the full scaling vector (collective).
    pub fn evaluate(
        comm: &dyn Comm,
        dofs: &DofMap,
        x: &DistributedVector,
        x_local: &LocalVector,
        residual: &[f64],
        scaling: &LocalVector,
        circuit: &CircuitBridge,
    ) -> ErrorNorms {
        // potential, electron, hole, poisson, electron continuity, hole continuity
        let mut partial = [0.0; 6];
        let unscaled = |i: usize| residual[i] / scaling[i];

        for node in dofs.owned_nodes(comm.rank()) {
            match node.role {
                RegionRole::Semiconductor => {
                    for (k, s) in [slot::POTENTIAL, slot::ELECTRON, slot::HOLE].into_iter().enumerate() {
                        let i = node.index(s);
                        partial[k] += x.get(i).powi(2);
                        partial[k + 3] += unscaled(i).powi(2);
                    }
                }
                RegionRole::Insulator | RegionRole::Electrode | RegionRole::Metal => {
                    let i = node.potential();
                    partial[0] += x.get(i).powi(2);
                    partial[3] += unscaled(i).powi(2);
                }
                RegionRole::Vacuum => {}
            }
        }

        comm.all_reduce_sum_vec(&mut partial);
        let [potential, electron, hole, poisson, electron_continuity, hole_continuity] = partial.map(f64::sqrt);

        ErrorNorms {
            potential,
            electron,
            hole,
            poisson,
            electron_continuity,
            hole_continuity,
            circuit: circuit.residual_norm(comm, dofs, x_local),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::SerialComm;
    use approx::assert_relative_eq;

    #[test]
    fn norms_are_split_by_quantity_and_unscaled() {
        let mut b = DofMap::builder(1);
        b.add_node(0, 0, RegionRole::Semiconductor, 0)
            .add_node(1, 1, RegionRole::Metal, 0)
            .add_node(2, 2, RegionRole::Vacuum, 0);
        let dofs = b.build().unwrap();
        let full = [1.0, 2.0, 3.0, 4.0, 100.0];
        let x = DistributedVector::from_full(&dofs, 0, &full);
        let x_local = x.gather(&SerialComm);
        let scaling = LocalVector::new(vec![2.0, 10.0, 1.0, 4.0, 1.0]);
        let residual = [2.0, 10.0, 1.0, 12.0, 50.0];

        let norms = NormEvaluator::evaluate(
            &SerialComm,
            &dofs,
            &x,
            &x_local,
            &residual,
            &scaling,
            &CircuitBridge::detached(),
        );
        assert_relative_eq!(norms.potential, 17.0f64.sqrt());
        assert_relative_eq!(norms.electron, 2.0);
        assert_relative_eq!(norms.hole, 3.0);
        assert_relative_eq!(norms.poisson, 10.0f64.sqrt());
        assert_relative_eq!(norms.electron_continuity, 1.0);
        assert_relative_eq!(norms.hole_continuity, 1.0);
        assert_eq!(norms.circuit, 0.0);
    }
}
