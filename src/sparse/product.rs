use nalgebra_sparse::CsrMatrix;
use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;

use crate::RaspFloat;

/// `A * rhs` for a CSR `A` (m x n) and a dense `rhs` (n x l).
///
/// Rows of the output are independent, so the work is split over row blocks.
/// The sparse operand is only ever read through its raw CSR slices; nothing
/// is densified.
pub fn csr_dense_product<T: RaspFloat>(a: &CsrMatrix<T>, rhs: ArrayView2<T>) -> Array2<T> {
    assert_eq!(
        a.ncols(),
        rhs.nrows(),
        "dimension mismatch in sparse-dense product"
    );
    let l = rhs.ncols();
    let offsets = a.row_offsets();
    let cols = a.col_indices();
    let values = a.values();

    let mut out = vec![T::zero(); a.nrows() * l];
    out.par_chunks_mut(l.max(1))
        .enumerate()
        .for_each(|(i, out_row)| {
            for idx in offsets[i]..offsets[i + 1] {
                let value = values[idx];
                let rhs_row = rhs.row(cols[idx]);
                for (acc, &r) in out_row.iter_mut().zip(rhs_row.iter()) {
                    *acc += value * r;
                }
            }
        });

    Array2::from_shape_vec((a.nrows(), l), out).expect("CSR product shape is consistent")
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra_sparse::CooMatrix;
    use ndarray::array;

    #[test]
    fn test_matches_dense_product() {
        let mut coo = CooMatrix::new(3, 2);
        coo.push(0, 0, 2.0);
        coo.push(1, 1, -1.0);
        coo.push(2, 0, 0.5);
        coo.push(2, 1, 4.0);
        let a = CsrMatrix::from(&coo);

        let rhs = array![[1.0, 0.0, 2.0], [3.0, -2.0, 1.0]];
        let result = csr_dense_product(&a, rhs.view());

        let expected = array![[2.0, 0.0, 4.0], [-3.0, 2.0, -1.0], [12.5, -8.0, 5.0]];
        for (r, e) in result.iter().zip(expected.iter()) {
            assert_relative_eq!(r, e);
        }
    }

    #[test]
    fn test_empty_rows() {
        let coo = CooMatrix::<f64>::new(2, 3);
        let a = CsrMatrix::from(&coo);
        let rhs = Array2::<f64>::ones((3, 4));
        let result = csr_dense_product(&a, rhs.view());
        assert_eq!(result.shape(), &[2, 4]);
        assert!(result.iter().all(|&v| v == 0.0));
    }
}
