//! Dense views of the assembled Jacobian on top of Faer.
//!
//! The reference direct solver factors the full (replicated) Jacobian, so the sparse
//! storage is expanded into a column-major `faer::Mat<f64>` here.

use faer::Mat;

use crate::matrix::sparse::SparseMatrix;

impl SparseMatrix {
    /// Expand into a dense Faer matrix.
    pub fn to_dense(&self) -> Mat<f64> {
        let n = self.nrows();
        let mut a = Mat::<f64>::zeros(n, n);
        for (r, c, v) in self.iter() {
            a[(r, c)] += v;
        }
        a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_copy_matches_entries() {
        let mut m = SparseMatrix::new(2);
        m.add_value(0, 1, 2.0).unwrap();
        m.add_value(1, 0, -1.0).unwrap();
        let d = m.to_dense();
        assert_eq!(d[(0, 1)], 2.0);
        assert_eq!(d[(1, 0)], -1.0);
        assert_eq!(d[(0, 0)], 0.0);
    }
}
