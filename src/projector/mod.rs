//! Randomized range-finding.
//!
//! Approximates the dominant subspace of a (sparse or dense) matrix with the
//! sketch-and-iterate scheme of Halko, Martinsson & Tropp: a seeded Gaussian
//! test matrix, a few power iterations with per-step orthonormalization, and
//! an exact decomposition of the small projected matrix. Cost is near-linear
//! in the number of stored entries; the sparse operand is never densified.
//! Column centering, when requested, enters the products as rank-one
//! corrections instead of materializing a centered copy.

use log::{debug, warn};
use nalgebra_sparse::CsrMatrix;
use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use num_traits::Float;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::error::RaspError;
use crate::linalg::{jacobi_eigh, orthonormalize_columns, svd_flip};
use crate::sparse::{csr_dense_product, MatrixColumnStats};
use crate::utils::CancelToken;
use crate::RaspFloat;

/// How to surface an input whose numerical rank falls short of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RankPolicy {
    /// Return the smaller factorization without comment.
    Silent,
    /// Log and attach a [`RankDeficiency`] record to the result.
    #[default]
    Warn,
}

/// Non-fatal rank shortfall attached to a [`RandomizedSvd`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankDeficiency {
    pub requested: usize,
    pub effective: usize,
}

/// Truncated approximate SVD produced by the projector.
///
/// `u` has orthonormal columns (the low-rank basis over locations), `vt`
/// orthonormal rows; both carry a deterministic sign convention.
#[derive(Debug)]
pub struct RandomizedSvd<T: RaspFloat> {
    pub u: Array2<T>,
    pub singular_values: Array1<T>,
    pub vt: Array2<T>,
    pub deficiency: Option<RankDeficiency>,
}

impl<T: RaspFloat> RandomizedSvd<T> {
    pub fn rank(&self) -> usize {
        self.singular_values.len()
    }

    /// Row scores `U * S`, the projection of the input rows onto the basis.
    pub fn scores(&self) -> Array2<T> {
        let mut scores = self.u.clone();
        for (j, mut column) in scores.columns_mut().into_iter().enumerate() {
            let sigma = self.singular_values[j];
            column.mapv_inplace(|x| x * sigma);
        }
        scores
    }
}

/// Configurable randomized projector. Build with [`RandomizedProjectorBuilder`].
pub struct RandomizedProjector<T: RaspFloat> {
    target_rank: usize,
    oversampling: usize,
    power_iterations: usize,
    center: bool,
    rank_policy: RankPolicy,
    seed: u64,
    cancel: Option<CancelToken>,
    _marker: std::marker::PhantomData<T>,
}

pub struct RandomizedProjectorBuilder<T: RaspFloat> {
    target_rank: usize,
    oversampling: usize,
    power_iterations: usize,
    center: bool,
    rank_policy: RankPolicy,
    seed: u64,
    cancel: Option<CancelToken>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: RaspFloat> Default for RandomizedProjectorBuilder<T> {
    fn default() -> Self {
        Self {
            target_rank: 50,
            oversampling: 10,
            power_iterations: 2,
            center: true,
            rank_policy: RankPolicy::default(),
            seed: 42,
            cancel: None,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: RaspFloat> RandomizedProjectorBuilder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of components to keep after truncation.
    pub fn target_rank(mut self, target_rank: usize) -> Self {
        self.target_rank = target_rank;
        self
    }

    /// Extra sketch columns beyond the target rank; buys accuracy for a
    /// slightly wider intermediate basis.
    pub fn oversampling(mut self, oversampling: usize) -> Self {
        self.oversampling = oversampling;
        self
    }

    /// Subspace iteration rounds sharpening the spectrum before projection.
    pub fn power_iterations(mut self, power_iterations: usize) -> Self {
        self.power_iterations = power_iterations;
        self
    }

    /// Whether to (implicitly) subtract column means first.
    pub fn center(mut self, center: bool) -> Self {
        self.center = center;
        self
    }

    pub fn rank_policy(mut self, rank_policy: RankPolicy) -> Self {
        self.rank_policy = rank_policy;
        self
    }

    /// Seed for the Gaussian test matrix; identical seeds and inputs give
    /// identical factorizations.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Cooperative cancellation, polled between power-iteration rounds.
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn build(self) -> RandomizedProjector<T> {
        RandomizedProjector {
            target_rank: self.target_rank,
            oversampling: self.oversampling,
            power_iterations: self.power_iterations,
            center: self.center,
            rank_policy: self.rank_policy,
            seed: self.seed,
            cancel: self.cancel,
            _marker: std::marker::PhantomData,
        }
    }
}

enum RangeOp<'a, T: RaspFloat> {
    Sparse {
        a: &'a CsrMatrix<T>,
        at: CsrMatrix<T>,
    },
    Dense {
        a: ArrayView2<'a, T>,
    },
}

impl<T: RaspFloat> RangeOp<'_, T> {
    fn nrows(&self) -> usize {
        match self {
            RangeOp::Sparse { a, .. } => a.nrows(),
            RangeOp::Dense { a } => a.nrows(),
        }
    }

    fn ncols(&self) -> usize {
        match self {
            RangeOp::Sparse { a, .. } => a.ncols(),
            RangeOp::Dense { a } => a.ncols(),
        }
    }

    fn mul(&self, rhs: ArrayView2<T>) -> Array2<T> {
        match self {
            RangeOp::Sparse { a, .. } => csr_dense_product(a, rhs),
            RangeOp::Dense { a } => a.dot(&rhs),
        }
    }

    fn tr_mul(&self, rhs: ArrayView2<T>) -> Array2<T> {
        match self {
            RangeOp::Sparse { at, .. } => csr_dense_product(at, rhs),
            RangeOp::Dense { a } => a.t().dot(&rhs),
        }
    }

    fn col_means(&self) -> Array1<T> {
        match self {
            RangeOp::Sparse { a, .. } => Array1::from(a.col_means()),
            RangeOp::Dense { a } => a
                .mean_axis(Axis(0))
                .unwrap_or_else(|| Array1::zeros(a.ncols())),
        }
    }
}

impl<T: RaspFloat> RandomizedProjector<T> {
    pub fn builder() -> RandomizedProjectorBuilder<T> {
        RandomizedProjectorBuilder::new()
    }

    /// Factorizes a sparse matrix (locations x features).
    pub fn project_sparse(&self, a: &CsrMatrix<T>) -> Result<RandomizedSvd<T>, RaspError> {
        let at = a.transpose();
        self.project(&RangeOp::Sparse { a, at })
    }

    /// Factorizes a dense matrix; used for the smoothed stage-2 scores.
    pub fn project_dense(&self, a: ArrayView2<T>) -> Result<RandomizedSvd<T>, RaspError> {
        self.project(&RangeOp::Dense { a })
    }

    fn project(&self, op: &RangeOp<T>) -> Result<RandomizedSvd<T>, RaspError> {
        let n = op.nrows();
        let d = op.ncols();
        if n == 0 || d == 0 {
            return Err(RaspError::EmptyInput {
                context: "projection input has a zero dimension",
            });
        }
        self.check_cancelled()?;

        let max_rank = n.min(d);
        let k = self.target_rank.clamp(1, max_rank);
        let l = (k + self.oversampling).min(max_rank);

        let means = if self.center { Some(op.col_means()) } else { None };

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let omega = gaussian_matrix::<T>(&mut rng, d, l);

        let sketch = self.mul_centered(op, means.as_ref(), omega.view());
        let (mut q, mut subspace_rank) = orthonormalize_columns(sketch);
        if subspace_rank == 0 {
            return Err(RaspError::EmptyInput {
                context: "projection input is numerically zero",
            });
        }

        for round in 0..self.power_iterations {
            self.check_cancelled()?;
            let w = self.tr_mul_centered(op, means.as_ref(), q.view());
            let (w, _) = orthonormalize_columns(w);
            let z = self.mul_centered(op, means.as_ref(), w.view());
            let (refined, rank) = orthonormalize_columns(z);
            q = refined;
            subspace_rank = rank;
            debug!("power iteration {round}: subspace rank {subspace_rank}");
            if subspace_rank == 0 {
                return Err(RaspError::EmptyInput {
                    context: "projection subspace collapsed",
                });
            }
        }
        self.check_cancelled()?;

        // B = Q^T A~, materialized through A~^T Q to reuse the row-parallel kernel.
        let bt = self.tr_mul_centered(op, means.as_ref(), q.view());
        let b = bt.t().to_owned();

        let gram = b.dot(&b.t());
        let (eigenvalues, eigenvectors) = jacobi_eigh(&gram);

        let sigma: Vec<T> = eigenvalues
            .iter()
            .map(|&lambda| Float::sqrt(Float::max(lambda, T::zero())))
            .collect();
        let cutoff = sigma
            .first()
            .map(|&s0| s0 * T::from_f64(1e-12).unwrap())
            .unwrap_or_else(T::zero);
        let effective = sigma.iter().take_while(|&&s| s > cutoff).count();
        if effective == 0 {
            return Err(RaspError::EmptyInput {
                context: "projection input is numerically zero",
            });
        }
        let keep = k.min(effective);

        let u_small = eigenvectors.slice(s![.., ..keep]);
        let mut u = q.dot(&u_small);
        let mut vt = Array2::zeros((keep, d));
        for component in 0..keep {
            let direction = u_small.column(component).to_owned();
            let mut row = direction.dot(&b);
            row.mapv_inplace(|x| x / sigma[component]);
            vt.row_mut(component).assign(&row);
        }
        svd_flip(&mut u, &mut vt);

        let deficiency = if keep < k {
            let record = RankDeficiency {
                requested: k,
                effective: keep,
            };
            match self.rank_policy {
                RankPolicy::Silent => {}
                RankPolicy::Warn => warn!(
                    "rank-deficient input: requested {} components, keeping {}",
                    record.requested, record.effective
                ),
            }
            Some(record)
        } else {
            None
        };

        Ok(RandomizedSvd {
            u,
            singular_values: Array1::from(sigma[..keep].to_vec()),
            vt,
            deficiency,
        })
    }

    /// `A~ rhs`, with the optional centering applied as a rank-one update.
    fn mul_centered(
        &self,
        op: &RangeOp<T>,
        means: Option<&Array1<T>>,
        rhs: ArrayView2<T>,
    ) -> Array2<T> {
        let mut product = op.mul(rhs);
        if let Some(means) = means {
            let correction = means.dot(&rhs);
            product -= &correction;
        }
        product
    }

    /// `A~^T rhs` under the same implicit centering.
    fn tr_mul_centered(
        &self,
        op: &RangeOp<T>,
        means: Option<&Array1<T>>,
        rhs: ArrayView2<T>,
    ) -> Array2<T> {
        let mut product = op.tr_mul(rhs);
        if let Some(means) = means {
            let column_sums = rhs.sum_axis(Axis(0));
            let correction = Array2::from_shape_fn(product.dim(), |(i, j)| {
                means[i] * column_sums[j]
            });
            product -= &correction;
        }
        product
    }

    fn check_cancelled(&self) -> Result<(), RaspError> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(RaspError::Cancelled),
            _ => Ok(()),
        }
    }
}

fn gaussian_matrix<T: RaspFloat>(rng: &mut ChaCha8Rng, rows: usize, cols: usize) -> Array2<T> {
    Array2::from_shape_fn((rows, cols), |_| {
        T::from_f64(rng.sample::<f64, _>(StandardNormal)).unwrap_or_else(T::zero)
    })
}
