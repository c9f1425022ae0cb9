//! Run configuration types.

pub mod options;

pub use options::{
    DampingKind, IntegrationOrder, NewtonOptions, SolveMode, SolverConfig, SweepSpec, TransientSpec,
};
