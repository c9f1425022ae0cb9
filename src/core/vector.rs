//! Partitioned vectors and their local (ghosted) views.
//!
//! A [`DistributedVector`] stores only this rank's contiguous range of the global
//! vector. [`DistributedVector::gather`] produces a [`LocalVector`], a full-length
//! read-only copy used by the per-node evaluation hooks. Contributions to global rows
//! are accumulated in a [`VectorBuffer`] and summed across ranks on
//! [`VectorBuffer::finalize`].

use std::ops::{Deref, Range};

use crate::core::layout::DofMap;
use crate::parallel::Comm;

#[derive(Debug, Clone, PartialEq)]
pub struct DistributedVector {
    range: Range<usize>,
    n_global: usize,
    data: Vec<f64>,
}

impl DistributedVector {
    pub fn zeros(dofs: &DofMap, rank: usize) -> Self {
        Self::filled(dofs, rank, 0.0)
    }

    pub fn filled(dofs: &DofMap, rank: usize, value: f64) -> Self {
        let range = dofs.owned_range(rank);
        Self {
            data: vec![value; range.len()],
            range,
            n_global: dofs.n_dofs(),
        }
    }

    /// Take this rank's segment out of a full-length array.
    pub fn from_full(dofs: &DofMap, rank: usize, full: &[f64]) -> Self {
        assert_eq!(full.len(), dofs.n_dofs(), "full vector has wrong length");
        let range = dofs.owned_range(rank);
        Self {
            data: full[range.clone()].to_vec(),
            range,
            n_global: dofs.n_dofs(),
        }
    }

    pub fn zeros_like(&self) -> Self {
        Self {
            range: self.range.clone(),
            n_global: self.n_global,
            data: vec![0.0; self.data.len()],
        }
    }

    pub fn owned(&self) -> &[f64] {
        &self.data
    }

    pub fn is_owned(&self, index: usize) -> bool {
        self.range.contains(&index)
    }

    /// Value at a global index owned by this rank.
    pub fn get(&self, index: usize) -> f64 {
        debug_assert!(self.is_owned(index), "index {} not owned", index);
        self.data[index - self.range.start]
    }

    pub fn set(&mut self, index: usize, value: f64) {
        debug_assert!(self.is_owned(index), "index {} not owned", index);
        self.data[index - self.range.start] = value;
    }

    pub fn copy_from(&mut self, other: &DistributedVector) {
        debug_assert_eq!(self.range, other.range);
        self.data.copy_from_slice(&other.data);
    }

    /// self ← self + alpha · other
    pub fn axpy(&mut self, alpha: f64, other: &DistributedVector) {
        debug_assert_eq!(self.range, other.range);
        for (s, &o) in self.data.iter_mut().zip(&other.data) {
            *s += alpha * o;
        }
    }

    /// Global Euclidean norm (collective).
    pub fn norm<C: Comm + ?Sized>(&self, comm: &C) -> f64 {
        comm.norm(&self.data)
    }

    /// Full-length copy of the global vector on every rank (collective).
    pub fn gather<C: Comm + ?Sized>(&self, comm: &C) -> LocalVector {
        let mut full = vec![0.0; self.n_global];
        full[self.range.clone()].copy_from_slice(&self.data);
        comm.all_reduce_sum_vec(&mut full);
        LocalVector(full)
    }

    /// First owned global index holding a NaN or infinity.
    pub fn first_non_finite(&self) -> Option<usize> {
        first_non_finite(&self.data).map(|i| i + self.range.start)
    }

    /// Lowest global index holding a NaN or infinity on any rank (collective).
    pub fn first_non_finite_global<C: Comm + ?Sized>(&self, comm: &C) -> Option<usize> {
        let local: Vec<usize> = self.first_non_finite().into_iter().collect();
        comm.all_gather_indices(&local).into_iter().min()
    }
}

/// Read-only full-length view of a global vector.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalVector(Vec<f64>);

impl LocalVector {
    pub fn new(values: Vec<f64>) -> Self {
        Self(values)
    }

    pub fn into_inner(self) -> Vec<f64> {
        self.0
    }
}

impl Deref for LocalVector {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        &self.0
    }
}

/// This rank's additive contributions to (any) global rows.
#[derive(Debug, Clone)]
pub struct VectorBuffer {
    data: Vec<f64>,
}

impl VectorBuffer {
    pub fn zeros(n_global: usize) -> Self {
        Self { data: vec![0.0; n_global] }
    }

    pub fn add(&mut self, row: usize, value: f64) {
        self.data[row] += value;
    }

    /// Merge another rank-local buffer into this one.
    pub fn merge(&mut self, other: &VectorBuffer) {
        for (a, &b) in self.data.iter_mut().zip(&other.data) {
            *a += b;
        }
    }

    /// Sum contributions over all ranks; every rank receives the assembled vector.
    pub fn finalize<C: Comm + ?Sized>(mut self, comm: &C) -> Vec<f64> {
        comm.all_reduce_sum_vec(&mut self.data);
        self.data
    }
}

pub(crate) fn first_non_finite(values: &[f64]) -> Option<usize> {
    values.iter().position(|v| !v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::layout::RegionRole;
    use crate::parallel::SerialComm;

    fn two_rank_layout() -> DofMap {
        let mut b = DofMap::builder(2);
        b.add_node(0, 0, RegionRole::Semiconductor, 0)
            .add_node(1, 0, RegionRole::Insulator, 1);
        b.build().unwrap()
    }

    #[test]
    fn segments_follow_owned_range() {
        let dofs = two_rank_layout();
        let full = [1.0, 2.0, 3.0, 4.0];
        let v0 = DistributedVector::from_full(&dofs, 0, &full);
        let v1 = DistributedVector::from_full(&dofs, 1, &full);
        assert_eq!(v0.owned(), &[1.0, 2.0, 3.0]);
        assert_eq!(v1.owned(), &[4.0]);
        assert_eq!(v1.get(3), 4.0);
        assert!(!v1.is_owned(0));
    }

    #[test]
    fn gather_on_single_rank_reproduces_vector() {
        let mut b = DofMap::builder(1);
        b.add_node(0, 0, RegionRole::Metal, 0).add_node(1, 0, RegionRole::Metal, 0);
        let dofs = b.build().unwrap();
        let mut v = DistributedVector::zeros(&dofs, 0);
        v.set(1, 5.0);
        let local = v.gather(&SerialComm);
        assert_eq!(&local[..], &[0.0, 5.0]);
    }

    #[test]
    fn axpy_updates_owned_segment() {
        let dofs = two_rank_layout();
        let mut a = DistributedVector::filled(&dofs, 0, 2.0);
        let b = DistributedVector::filled(&dofs, 0, 4.0);
        a.axpy(-0.5, &b);
        assert_eq!(a.owned(), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn non_finite_is_located_by_global_index() {
        let dofs = two_rank_layout();
        let mut v = DistributedVector::zeros(&dofs, 1);
        assert_eq!(v.first_non_finite(), None);
        v.set(3, f64::NAN);
        assert_eq!(v.first_non_finite(), Some(3));
        assert_eq!(v.first_non_finite_global(&SerialComm), Some(3));
    }
}
