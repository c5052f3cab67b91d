//! Dense kernels backing the randomized projector.
//!
//! Everything here operates on small matrices (sketch width columns), so the
//! routines favour robustness over asymptotic cleverness: modified
//! Gram-Schmidt with a re-orthogonalization pass, and a cyclic Jacobi
//! eigensolver for the projected Gram matrix.

use ndarray::{s, Array1, Array2};
use num_traits::Float;

use crate::RaspFloat;

const MAX_JACOBI_SWEEPS: usize = 64;

/// Orthonormalizes the columns of `y` in place, returning the basis and its
/// effective rank.
///
/// Columns whose residual norm falls below `1e-12` of the largest initial
/// column norm are treated as linearly dependent and dropped, so the
/// returned matrix has `rank` columns. A zero input yields an empty basis.
pub fn orthonormalize_columns<T: RaspFloat>(y: Array2<T>) -> (Array2<T>, usize) {
    let (_, l) = y.dim();
    let mut q = y;

    let mut max_norm = T::zero();
    for j in 0..l {
        let col = q.column(j);
        let norm = Float::sqrt(col.dot(&col));
        if norm > max_norm {
            max_norm = norm;
        }
    }
    if max_norm == T::zero() {
        let empty = q.slice_move(s![.., ..0]);
        return (empty, 0);
    }
    let drop_tol = T::from_f64(1e-12).unwrap() * max_norm;

    let mut rank = 0;
    for j in 0..l {
        let mut col = q.column(j).to_owned();
        // Second pass guards against cancellation in the first.
        for _ in 0..2 {
            for i in 0..rank {
                let basis = q.column(i);
                let proj = basis.dot(&col);
                col.zip_mut_with(&basis, |c, &b| *c = *c - proj * b);
            }
        }
        let norm = Float::sqrt(col.dot(&col));
        if norm > drop_tol {
            col.mapv_inplace(|v| v / norm);
            q.column_mut(rank).assign(&col);
            rank += 1;
        }
    }

    let q = q.slice_move(s![.., ..rank]);
    (q, rank)
}

/// Eigendecomposition of a small symmetric matrix by cyclic Jacobi sweeps.
///
/// Returns eigenvalues in descending order with the matching eigenvectors as
/// columns. Sweeps stop once the off-diagonal mass drops below `1e-28` of
/// the squared Frobenius norm or after a fixed sweep cap; for the
/// positive-semidefinite Gram matrices this crate feeds in, the cap is never
/// reached in practice.
pub fn jacobi_eigh<T: RaspFloat>(a: &Array2<T>) -> (Array1<T>, Array2<T>) {
    let n = a.nrows();
    debug_assert_eq!(n, a.ncols(), "jacobi_eigh expects a square matrix");

    let mut m = a.clone();
    let mut v: Array2<T> = Array2::eye(n);

    let frob_sq: T = m.iter().map(|&x| x * x).sum();
    let off_tol = T::from_f64(1e-28).unwrap() * Float::max(frob_sq, T::one());

    for _sweep in 0..MAX_JACOBI_SWEEPS {
        let mut off = T::zero();
        for p in 0..n {
            for q in 0..n {
                if p != q {
                    off += m[[p, q]] * m[[p, q]];
                }
            }
        }
        if off <= off_tol {
            break;
        }

        for p in 0..n.saturating_sub(1) {
            for q in (p + 1)..n {
                let apq = m[[p, q]];
                if Float::abs(apq) <= T::from_f64(1e-300).unwrap() {
                    continue;
                }
                let app = m[[p, p]];
                let aqq = m[[q, q]];
                let zeta = (aqq - app) / (T::from_f64(2.0).unwrap() * apq);
                let t = if zeta >= T::zero() {
                    T::one() / (zeta + Float::sqrt(zeta * zeta + T::one()))
                } else {
                    -T::one() / (-zeta + Float::sqrt(zeta * zeta + T::one()))
                };
                let c = T::one() / Float::sqrt(t * t + T::one());
                let s = t * c;

                for k in 0..n {
                    let mkp = m[[k, p]];
                    let mkq = m[[k, q]];
                    m[[k, p]] = c * mkp - s * mkq;
                    m[[k, q]] = s * mkp + c * mkq;
                }
                for k in 0..n {
                    let mpk = m[[p, k]];
                    let mqk = m[[q, k]];
                    m[[p, k]] = c * mpk - s * mqk;
                    m[[q, k]] = s * mpk + c * mqk;
                }
                for k in 0..n {
                    let vkp = v[[k, p]];
                    let vkq = v[[k, q]];
                    v[[k, p]] = c * vkp - s * vkq;
                    v[[k, q]] = s * vkp + c * vkq;
                }
            }
        }
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| {
        m[[j, j]]
            .partial_cmp(&m[[i, i]])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut eigenvalues = Array1::zeros(n);
    let mut eigenvectors = Array2::zeros((n, n));
    for (dst, &src) in order.iter().enumerate() {
        eigenvalues[dst] = m[[src, src]];
        eigenvectors.column_mut(dst).assign(&v.column(src));
    }
    (eigenvalues, eigenvectors)
}

/// Deterministic sign convention: the largest-magnitude entry of each left
/// singular vector is made positive, with the matching right singular vector
/// flipped in tandem. Removes the sign ambiguity so seeded runs are
/// reproducible bit for bit.
pub fn svd_flip<T: RaspFloat>(u: &mut Array2<T>, vt: &mut Array2<T>) {
    let components = u.ncols().min(vt.nrows());
    for j in 0..components {
        let col = u.column(j);
        let mut max_abs = T::zero();
        let mut max_val = T::zero();
        for &value in col.iter() {
            let abs = Float::abs(value);
            if abs > max_abs {
                max_abs = abs;
                max_val = value;
            }
        }
        if max_val < T::zero() {
            u.column_mut(j).mapv_inplace(|x| -x);
            vt.row_mut(j).mapv_inplace(|x| -x);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_orthonormalize_full_rank() {
        let y = array![[1.0, 1.0], [1.0, 0.0], [0.0, 1.0]];
        let (q, rank) = orthonormalize_columns(y);
        assert_eq!(rank, 2);
        let gram = q.t().dot(&q);
        for i in 0..2 {
            for j in 0..2 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(gram[[i, j]], expected, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_orthonormalize_detects_dependence() {
        let y = array![[1.0, 2.0], [2.0, 4.0], [3.0, 6.0]];
        let (q, rank) = orthonormalize_columns(y);
        assert_eq!(rank, 1);
        assert_eq!(q.ncols(), 1);
    }

    #[test]
    fn test_jacobi_known_spectrum() {
        // Eigenvalues of [[2,1],[1,2]] are 3 and 1.
        let a = array![[2.0, 1.0], [1.0, 2.0]];
        let (vals, vecs) = jacobi_eigh(&a);
        assert_relative_eq!(vals[0], 3.0, epsilon = 1e-10);
        assert_relative_eq!(vals[1], 1.0, epsilon = 1e-10);

        // A v = lambda v for the dominant pair.
        let av = a.dot(&vecs.column(0).to_owned());
        for k in 0..2 {
            assert_relative_eq!(av[k], 3.0 * vecs[[k, 0]], epsilon = 1e-10);
        }
    }

    #[test]
    fn test_svd_flip_sign() {
        let mut u = array![[-2.0, 0.5], [1.0, 1.5]];
        let mut vt = array![[1.0, 2.0], [3.0, 4.0]];
        svd_flip(&mut u, &mut vt);
        // Column 0's dominant entry (-2.0) forces a flip.
        assert_relative_eq!(u[[0, 0]], 2.0);
        assert_relative_eq!(vt[[0, 0]], -1.0);
        // Column 1's dominant entry is already positive.
        assert_relative_eq!(u[[1, 1]], 1.5);
        assert_relative_eq!(vt[[1, 0]], 3.0);
    }
}
