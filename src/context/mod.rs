//! Run-level context: the driver that sequences solves and the report it returns.
//!
//! Modules:
//! - [`driver`]: the [`Driver`] dispatching operating point, DC sweep and transient.
//! - [`report`]: per-point [`RunReport`] records.
//!
//! # Example
//! ```rust,ignore
//! use mixddm::{Driver, LuSolver, SerialComm, SolverConfig};
//! let mut driver = Driver::new(SolverConfig::default(), SerialComm, dofs, system, Box::new(LuSolver::new()));
//! let report = driver.solve()?;
//! ```

pub mod driver;
pub mod report;

pub use driver::Driver;
pub use report::{RunReport, StepRecord};
