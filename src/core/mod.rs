//! Core data model: unknown layout, partitioned vectors and collaborator traits.

pub mod layout;
pub mod traits;
pub mod vector;

pub use layout::{DofMap, DofMapBuilder, NodeDof, NodeId, RegionRole, slot};
pub use traits::{BoundaryCondition, CircuitEngine, Coupling, EvalContext, Region};
pub use vector::{DistributedVector, LocalVector, VectorBuffer};
