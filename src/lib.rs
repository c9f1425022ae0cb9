//! mixddm: damped Newton and adaptive BDF time stepping for distributed,
//! circuit-coupled drift-diffusion device simulation.
//!
//! The crate owns the nonlinear-solve machinery only. Physical equations come from
//! [`Region`], [`BoundaryCondition`] and [`CircuitEngine`] implementations; the
//! solver assembles their contributions across SPMD ranks through a [`Comm`],
//! couples electrode rows into circuit rows, damps Newton updates and controls
//! transient steps from a local truncation error estimate.

pub mod parallel;

pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod matrix;
pub mod solver;
pub mod utils;

// Re-exports for convenience
pub use config::*;
pub use context::*;
pub use self::core::*;
pub use error::*;
pub use matrix::*;
pub use parallel::{Comm, SerialComm, UniverseComm};
pub use solver::*;
pub use utils::*;
