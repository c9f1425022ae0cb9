// Sparse Jacobian storage with a reservable, freezable nonzero pattern

use std::collections::BTreeMap;

use crate::error::{MixError, Result};
use crate::parallel::{Comm, agree};

/// Rank-local (row, col, value) contributions awaiting assembly.
#[derive(Debug, Clone, Default)]
pub struct TripletBuffer {
    entries: Vec<(usize, usize, f64)>,
}

impl TripletBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, row: usize, col: usize, value: f64) {
        self.entries.push((row, col, value));
    }

    /// Claim a structural position without contributing a value.
    pub fn reserve(&mut self, row: usize, col: usize) {
        self.entries.push((row, col, 0.0));
    }

    pub fn iter(&self) -> impl Iterator<Item = &(usize, usize, f64)> {
        self.entries.iter()
    }
}

/// Square sparse matrix replicated on every rank after assembly.
///
/// Until [`SparseMatrix::freeze`] is called any position may be created. Afterwards
/// the pattern is fixed: adding to a position that was never stored is a
/// [`MixError::StructuralViolation`]. Zeroing keeps positions.
#[derive(Debug, Clone)]
pub struct SparseMatrix {
    n: usize,
    entries: BTreeMap<(usize, usize), f64>,
    frozen: bool,
}

impl SparseMatrix {
    pub fn new(n: usize) -> Self {
        Self { n, entries: BTreeMap::new(), frozen: false }
    }

    pub fn nrows(&self) -> usize {
        self.n
    }

    pub fn nnz(&self) -> usize {
        self.entries.len()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Fix the nonzero pattern. Irreversible.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.entries.get(&(row, col)).copied().unwrap_or(0.0)
    }

    /// Zero every stored value, keeping the pattern.
    pub fn zero_entries(&mut self) {
        self.entries.values_mut().for_each(|v| *v = 0.0);
    }

    fn check_bounds(&self, row: usize, col: usize) -> Result<()> {
        if row >= self.n || col >= self.n {
            return Err(MixError::Layout(format!(
                "jacobian position ({}, {}) outside {}x{}",
                row, col, self.n, self.n
            )));
        }
        Ok(())
    }

    pub fn add_value(&mut self, row: usize, col: usize, value: f64) -> Result<()> {
        self.check_bounds(row, col)?;
        match self.entries.get_mut(&(row, col)) {
            Some(v) => *v += value,
            None if self.frozen => return Err(MixError::StructuralViolation { row, col }),
            None => {
                self.entries.insert((row, col), value);
            }
        }
        Ok(())
    }

    /// Sum rank-local triplets across all ranks and add them to the matrix.
    ///
    /// The union of positions is exchanged first so every rank adds the same entries
    /// in the same order; this is collective even for ranks with empty buffers.
    pub fn accumulate<C: Comm + ?Sized>(&mut self, comm: &C, buffers: &[TripletBuffer]) -> Result<()> {
        let in_bounds = buffers
            .iter()
            .flat_map(|buf| buf.iter())
            .try_for_each(|&(r, c, _)| self.check_bounds(r, c));
        agree(comm, "jacobian accumulate", in_bounds)?;

        let mut local: BTreeMap<(usize, usize), f64> = BTreeMap::new();
        for buf in buffers {
            for &(r, c, v) in buf.iter() {
                *local.entry((r, c)).or_insert(0.0) += v;
            }
        }

        let keys: Vec<(usize, usize)> = if comm.size() > 1 {
            let encoded: Vec<usize> = local.keys().map(|&(r, c)| r * self.n + c).collect();
            let mut all = comm.all_gather_indices(&encoded);
            all.sort_unstable();
            all.dedup();
            all.into_iter().map(|k| (k / self.n, k % self.n)).collect()
        } else {
            local.keys().copied().collect()
        };

        let mut values: Vec<f64> = keys
            .iter()
            .map(|k| local.get(k).copied().unwrap_or(0.0))
            .collect();
        comm.all_reduce_sum_vec(&mut values);

        for (&(r, c), v) in keys.iter().zip(values) {
            self.add_value(r, c, v)?;
        }
        Ok(())
    }

    /// Stored (col, value) pairs of one row.
    pub fn row(&self, row: usize) -> Vec<(usize, f64)> {
        self.entries
            .range((row, 0)..(row + 1, 0))
            .map(|(&(_, c), &v)| (c, v))
            .collect()
    }

    /// Zero the listed rows, keeping their positions.
    pub fn zero_rows(&mut self, rows: &[usize]) {
        for &row in rows {
            for (_, v) in self.entries.range_mut((row, 0)..(row + 1, 0)) {
                *v = 0.0;
            }
        }
    }

    /// Left diagonal scaling: row `i` is multiplied by `l[i]`.
    pub fn scale_rows(&mut self, l: &[f64]) {
        for (&(r, _), v) in self.entries.iter_mut() {
            *v *= l[r];
        }
    }

    pub fn first_non_finite(&self) -> Option<(usize, usize)> {
        self.entries
            .iter()
            .find(|(_, v)| !v.is_finite())
            .map(|(&k, _)| k)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        self.entries.iter().map(|(&(r, c), &v)| (r, c, v))
    }
}
