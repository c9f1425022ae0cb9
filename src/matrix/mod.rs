//! Matrix module: sparse Jacobian storage and its dense expansion.

pub mod dense;
pub mod sparse;
pub use sparse::{SparseMatrix, TripletBuffer};
