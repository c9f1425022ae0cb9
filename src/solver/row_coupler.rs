//! Row redirection between device and circuit equations.
//!
//! When an electrode's potential is a circuit unknown, the device equation assembled
//! in the electrode row is really the current flowing into the circuit node. The
//! boundary asks for that row to be folded into the circuit row and then cleared, so
//! its own constraint can be stamped in the freed row. Both the residual and the
//! Jacobian get the same treatment so they stay consistent.

use crate::error::{MixError, Result};
use crate::matrix::SparseMatrix;
use crate::parallel::Comm;

/// Parallel lists of row operations collected from the boundaries.
///
/// `source[i]` is added to `destination[i]`; every row in `clear` is zeroed after all
/// additions, using the values the source rows had before any of them were touched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowRequests {
    pub source: Vec<usize>,
    pub destination: Vec<usize>,
    pub clear: Vec<usize>,
}

impl RowRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_row(&mut self, source: usize, destination: usize) {
        self.source.push(source);
        self.destination.push(destination);
    }

    pub fn clear_row(&mut self, row: usize) {
        self.clear.push(row);
    }

    /// Fold `source` into `destination`, then empty `source`.
    pub fn move_row(&mut self, source: usize, destination: usize) {
        self.add_row(source, destination);
        self.clear_row(source);
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty() && self.clear.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.len() != self.destination.len() {
            return Err(MixError::MismatchedCoupling {
                sources: self.source.len(),
                destinations: self.destination.len(),
            });
        }
        Ok(())
    }

    /// Union of every rank's requests, in rank order (collective).
    pub fn synchronize<C: Comm + ?Sized>(&self, comm: &C) -> Result<RowRequests> {
        self.validate()?;
        if comm.size() == 1 {
            return Ok(self.clone());
        }
        Ok(RowRequests {
            source: comm.all_gather_indices(&self.source),
            destination: comm.all_gather_indices(&self.destination),
            clear: comm.all_gather_indices(&self.clear),
        })
    }
}

/// Applies [`RowRequests`] to an assembled residual or Jacobian.
pub struct RowCoupler;

impl RowCoupler {
    /// destination[i] += source_original[i], then zero cleared rows.
    pub fn couple_vector(requests: &RowRequests, r: &mut [f64]) -> Result<()> {
        requests.validate()?;
        let originals: Vec<f64> = requests.source.iter().map(|&s| r[s]).collect();
        for (&dst, v) in requests.destination.iter().zip(originals) {
            r[dst] += v;
        }
        for &row in &requests.clear {
            r[row] = 0.0;
        }
        Ok(())
    }

    /// Row-wise counterpart of [`RowCoupler::couple_vector`].
    ///
    /// Destination rows must already hold every column of their source rows once the
    /// pattern is frozen; otherwise this is a structural violation.
    pub fn couple_matrix(requests: &RowRequests, j: &mut SparseMatrix) -> Result<()> {
        requests.validate()?;
        let originals: Vec<Vec<(usize, f64)>> = requests.source.iter().map(|&s| j.row(s)).collect();
        for (&dst, row) in requests.destination.iter().zip(originals) {
            for (col, v) in row {
                j.add_value(dst, col, v)?;
            }
        }
        j.zero_rows(&requests.clear);
        Ok(())
    }
}
