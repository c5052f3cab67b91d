use nalgebra_sparse::CsrMatrix;

use super::{MatrixColumnStats, MatrixRowStats};
use crate::RaspFloat;

impl<T: RaspFloat> MatrixColumnStats<T> for CsrMatrix<T> {
    fn col_sums(&self) -> Vec<T> {
        let mut sums = vec![T::zero(); self.ncols()];
        for (&col, &value) in self.col_indices().iter().zip(self.values().iter()) {
            sums[col] += value;
        }
        sums
    }

    fn col_squared_sums(&self) -> Vec<T> {
        let mut sums = vec![T::zero(); self.ncols()];
        for (&col, &value) in self.col_indices().iter().zip(self.values().iter()) {
            sums[col] += value * value;
        }
        sums
    }

    fn col_nonzero(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.ncols()];
        for &col in self.col_indices() {
            counts[col] += 1;
        }
        counts
    }

    fn col_means(&self) -> Vec<T> {
        let n = T::from_usize(self.nrows()).unwrap_or_else(T::one);
        self.col_sums().into_iter().map(|s| s / n).collect()
    }
}

impl<T: RaspFloat> MatrixRowStats<T> for CsrMatrix<T> {
    fn row_sums(&self) -> Vec<T> {
        let offsets = self.row_offsets();
        let values = self.values();
        (0..self.nrows())
            .map(|i| values[offsets[i]..offsets[i + 1]].iter().copied().sum())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra_sparse::CooMatrix;

    fn sample_matrix() -> CsrMatrix<f64> {
        // [[1, 0, 2],
        //  [0, 3, 0],
        //  [4, 0, 0]]
        let mut coo = CooMatrix::new(3, 3);
        coo.push(0, 0, 1.0);
        coo.push(0, 2, 2.0);
        coo.push(1, 1, 3.0);
        coo.push(2, 0, 4.0);
        CsrMatrix::from(&coo)
    }

    #[test]
    fn test_column_stats() {
        let m = sample_matrix();
        assert_eq!(m.col_sums(), vec![5.0, 3.0, 2.0]);
        assert_eq!(m.col_squared_sums(), vec![17.0, 9.0, 4.0]);
        assert_eq!(m.col_nonzero(), vec![2, 1, 1]);

        let means = m.col_means();
        assert_relative_eq!(means[0], 5.0 / 3.0);
        assert_relative_eq!(means[2], 2.0 / 3.0);
    }

    #[test]
    fn test_row_stats() {
        let m = sample_matrix();
        assert_eq!(m.row_sums(), vec![3.0, 3.0, 4.0]);
    }
}
