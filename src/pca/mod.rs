//! Two-stage randomized PCA engine.
//!
//! Stage 1 factorizes the (optionally covariate-augmented) expression
//! matrix with the randomized projector. Stage 2 pushes the stage-1 scores
//! through the spatial smoothing operator and re-projects the smoothed
//! scores, capturing spatial structure the raw factorization misses. The
//! finalization step blends raw and refined scores in the stage-1
//! coordinate frame, so the result remains compatible with the stage-1
//! loadings for reconstruction.
//!
//! The engine is an explicit state machine
//! (`Uninitialized -> Stage1Complete -> Stage2Complete -> Finalized`) and is
//! single-use: a failed or finished run must be `reset` before the engine
//! accepts new input. A failure in any stage discards all intermediate
//! state, so partial embeddings are never observable.

use log::info;
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use ndarray::{Array1, Array2, ArrayView2, Axis, s};

use crate::error::{RaspError, RaspWarning, Stage};
use crate::projector::{RandomizedProjector, RankPolicy};
use crate::sparse::{csr_dense_product, MatrixColumnStats};
use crate::store::SparseMatrixStore;
use crate::utils::CancelToken;
use crate::RaspFloat;

/// Completed run artifacts. Everything derived during the run lives here
/// and is dropped with the value.
pub struct PcaRun<T: RaspFloat> {
    embedding: Array2<T>,
    loadings: Array2<T>,
    singular_values: Array1<T>,
    explained_variance: Array1<T>,
    total_variance: Option<T>,
    gene_means: Array1<T>,
    n_genes: usize,
    centered: bool,
    warnings: Vec<RaspWarning>,
}

impl<T: RaspFloat> PcaRun<T> {
    /// Final low-dimensional embedding (locations x target_rank).
    pub fn embedding(&self) -> &Array2<T> {
        &self.embedding
    }

    /// Stage-1 loadings over all input columns (genes plus any covariates).
    pub fn loadings(&self) -> &Array2<T> {
        &self.loadings
    }

    /// Loadings restricted to the gene columns, for reconstruction.
    pub fn gene_loadings(&self) -> ArrayView2<T> {
        self.loadings.slice(s![.., ..self.n_genes])
    }

    pub fn singular_values(&self) -> &Array1<T> {
        &self.singular_values
    }

    /// Stage-1 component variances, `s^2 / (n - 1)`.
    pub fn explained_variance(&self) -> &Array1<T> {
        &self.explained_variance
    }

    /// Share of each component in the input variance. For a centered run
    /// the denominator is the total variance of the stage-1 input, so the
    /// ratios tell how much of the data the embedding explains; otherwise
    /// they are relative to the computed components.
    pub fn explained_variance_ratio(&self) -> Array1<T> {
        let total: T = self
            .total_variance
            .unwrap_or_else(|| self.explained_variance.sum());
        if total > T::zero() {
            self.explained_variance.mapv(|v| v / total)
        } else {
            Array1::zeros(self.explained_variance.len())
        }
    }

    pub fn gene_means(&self) -> &Array1<T> {
        &self.gene_means
    }

    pub fn n_genes(&self) -> usize {
        self.n_genes
    }

    /// Whether stage 1 centered the input; reconstruction re-adds the gene
    /// means only in that case.
    pub fn centered(&self) -> bool {
        self.centered
    }

    /// Non-fatal numerical conditions collected across stages.
    pub fn warnings(&self) -> &[RaspWarning] {
        &self.warnings
    }
}

struct Stage1Output<T: RaspFloat> {
    scores: Array2<T>,
    loadings: Array2<T>,
    singular_values: Array1<T>,
    total_variance: Option<T>,
    gene_means: Array1<T>,
    n_genes: usize,
    n_locations: usize,
    warnings: Vec<RaspWarning>,
}

enum EngineState<T: RaspFloat> {
    Uninitialized,
    Stage1Complete(Stage1Output<T>),
    Stage2Complete {
        stage1: Stage1Output<T>,
        refined: Array2<T>,
        warnings: Vec<RaspWarning>,
    },
    Finalized(PcaRun<T>),
}

impl<T: RaspFloat> EngineState<T> {
    fn name(&self) -> &'static str {
        match self {
            EngineState::Uninitialized => "uninitialized",
            EngineState::Stage1Complete(_) => "stage-1 complete",
            EngineState::Stage2Complete { .. } => "stage-2 complete",
            EngineState::Finalized(_) => "finalized",
        }
    }
}

/// Builder for [`TwoStagePca`]; every knob of the pipeline configuration
/// lives here, with no hidden global state.
pub struct TwoStagePcaBuilder<T: RaspFloat> {
    target_rank: usize,
    oversampling: usize,
    power_iterations: usize,
    stage2_rank: Option<usize>,
    covariate_weight: T,
    stage_blend_weight: T,
    center: bool,
    rank_policy: RankPolicy,
    seed: u64,
    cancel: Option<CancelToken>,
}

impl<T: RaspFloat> Default for TwoStagePcaBuilder<T> {
    fn default() -> Self {
        Self {
            target_rank: 50,
            oversampling: 10,
            power_iterations: 2,
            stage2_rank: None,
            covariate_weight: T::one(),
            stage_blend_weight: T::one(),
            center: true,
            rank_policy: RankPolicy::default(),
            seed: 42,
            cancel: None,
        }
    }
}

impl<T: RaspFloat> TwoStagePcaBuilder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Final embedding dimensionality.
    pub fn target_rank(mut self, target_rank: usize) -> Self {
        self.target_rank = target_rank;
        self
    }

    pub fn oversampling(mut self, oversampling: usize) -> Self {
        self.oversampling = oversampling;
        self
    }

    pub fn power_iterations(mut self, power_iterations: usize) -> Self {
        self.power_iterations = power_iterations;
        self
    }

    /// Rank of the stage-2 refinement projection; defaults to the target
    /// rank and is capped by it.
    pub fn stage2_rank(mut self, stage2_rank: usize) -> Self {
        self.stage2_rank = Some(stage2_rank);
        self
    }

    /// Scale applied to standardized covariate columns before they are
    /// appended to the stage-1 input.
    pub fn covariate_weight(mut self, covariate_weight: T) -> Self {
        self.covariate_weight = covariate_weight;
        self
    }

    /// Mixing factor between raw stage-1 scores (0) and the spatially
    /// refined scores (1).
    pub fn stage_blend_weight(mut self, stage_blend_weight: T) -> Self {
        self.stage_blend_weight = stage_blend_weight;
        self
    }

    pub fn center(mut self, center: bool) -> Self {
        self.center = center;
        self
    }

    pub fn rank_policy(mut self, rank_policy: RankPolicy) -> Self {
        self.rank_policy = rank_policy;
        self
    }

    pub fn random_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn build(self) -> TwoStagePca<T> {
        TwoStagePca {
            config: self,
            state: EngineState::Uninitialized,
        }
    }
}

/// The two-stage PCA engine. See the module documentation for the state
/// machine and failure semantics.
pub struct TwoStagePca<T: RaspFloat> {
    config: TwoStagePcaBuilder<T>,
    state: EngineState<T>,
}

impl<T: RaspFloat> TwoStagePca<T> {
    pub fn builder() -> TwoStagePcaBuilder<T> {
        TwoStagePcaBuilder::new()
    }

    /// Runs all stages back to back and returns the finished run.
    pub fn fit(
        &mut self,
        store: &SparseMatrixStore<T>,
        operator: &CsrMatrix<T>,
    ) -> Result<&PcaRun<T>, RaspError> {
        self.run_stage1(store)?;
        self.run_stage2(operator)?;
        self.finalize()
    }

    /// Stage 1: randomized PCA of the (covariate-augmented) expression
    /// matrix. Requires an uninitialized engine.
    pub fn run_stage1(&mut self, store: &SparseMatrixStore<T>) -> Result<(), RaspError> {
        if !matches!(self.state, EngineState::Uninitialized) {
            return Err(RaspError::InvalidState {
                expected: "uninitialized",
                actual: self.state.name(),
            });
        }
        match self.stage1_inner(store) {
            Ok(output) => {
                info!(
                    "stage 1 complete: {} locations, {} components",
                    output.n_locations,
                    output.scores.ncols()
                );
                self.state = EngineState::Stage1Complete(output);
                Ok(())
            }
            Err(error) => {
                self.state = EngineState::Uninitialized;
                Err(error.in_stage(Stage::Stage1))
            }
        }
    }

    /// Stage 2: smooth the stage-1 scores through the spatial operator and
    /// re-project. Requires stage 1 to be complete.
    pub fn run_stage2(&mut self, operator: &CsrMatrix<T>) -> Result<(), RaspError> {
        let stage1 = match std::mem::replace(&mut self.state, EngineState::Uninitialized) {
            EngineState::Stage1Complete(stage1) => stage1,
            other => {
                let actual = other.name();
                self.state = other;
                return Err(RaspError::InvalidState {
                    expected: "stage-1 complete",
                    actual,
                });
            }
        };
        match self.stage2_inner(&stage1, operator) {
            Ok((refined, warnings)) => {
                info!("stage 2 complete: refined {} components", refined.ncols());
                self.state = EngineState::Stage2Complete {
                    stage1,
                    refined,
                    warnings,
                };
                Ok(())
            }
            Err(error) => {
                self.state = EngineState::Uninitialized;
                Err(error.in_stage(Stage::Stage2))
            }
        }
    }

    /// Blends stage-1 and stage-2 scores into the final embedding.
    pub fn finalize(&mut self) -> Result<&PcaRun<T>, RaspError> {
        let (stage1, refined, stage2_warnings) =
            match std::mem::replace(&mut self.state, EngineState::Uninitialized) {
                EngineState::Stage2Complete {
                    stage1,
                    refined,
                    warnings,
                } => (stage1, refined, warnings),
                other => {
                    let actual = other.name();
                    self.state = other;
                    return Err(RaspError::InvalidState {
                        expected: "stage-2 complete",
                        actual,
                    });
                }
            };

        let alpha = num_traits::Float::min(
            num_traits::Float::max(self.config.stage_blend_weight, T::zero()),
            T::one(),
        );
        let embedding = &stage1.scores * (T::one() - alpha) + &refined * alpha;

        let denominator = T::from_usize(stage1.n_locations.saturating_sub(1).max(1)).unwrap();
        let explained_variance = stage1.singular_values.mapv(|s| s * s / denominator);

        let mut warnings = stage1.warnings.clone();
        warnings.extend(stage2_warnings);

        let run = PcaRun {
            embedding,
            loadings: stage1.loadings,
            singular_values: stage1.singular_values,
            explained_variance,
            total_variance: stage1.total_variance,
            gene_means: stage1.gene_means,
            n_genes: stage1.n_genes,
            centered: self.config.center,
            warnings,
        };
        self.state = EngineState::Finalized(run);
        match &self.state {
            EngineState::Finalized(run) => Ok(run),
            _ => unreachable!(),
        }
    }

    /// The finished run, if the engine has been finalized.
    pub fn run(&self) -> Result<&PcaRun<T>, RaspError> {
        match &self.state {
            EngineState::Finalized(run) => Ok(run),
            other => Err(RaspError::InvalidState {
                expected: "finalized",
                actual: other.name(),
            }),
        }
    }

    /// Consumes the engine, handing out the finished run.
    pub fn into_run(self) -> Result<PcaRun<T>, RaspError> {
        match self.state {
            EngineState::Finalized(run) => Ok(run),
            other => Err(RaspError::InvalidState {
                expected: "finalized",
                actual: other.name(),
            }),
        }
    }

    /// Clears all state so the engine can be reused for a fresh run.
    pub fn reset(&mut self) {
        self.state = EngineState::Uninitialized;
    }

    fn stage1_inner(&self, store: &SparseMatrixStore<T>) -> Result<Stage1Output<T>, RaspError> {
        let projector = self.projector(self.config.target_rank, self.config.center, self.config.seed);
        let (svd, total_variance) = match store.covariates() {
            None => {
                let matrix = store.expression();
                let total = self.config.center.then(|| total_variance_of(matrix));
                (projector.project_sparse(matrix)?, total)
            }
            Some(covariates) => {
                let augmented = augment_with_covariates(
                    store.expression(),
                    covariates,
                    self.config.covariate_weight,
                );
                let total = self.config.center.then(|| total_variance_of(&augmented));
                (projector.project_sparse(&augmented)?, total)
            }
        };

        let mut warnings = Vec::new();
        if let Some(deficiency) = svd.deficiency {
            warnings.push(RaspWarning::RankDeficiency {
                stage: Stage::Stage1,
                requested: deficiency.requested,
                effective: deficiency.effective,
            });
        }

        Ok(Stage1Output {
            scores: svd.scores(),
            loadings: svd.vt,
            singular_values: svd.singular_values,
            total_variance,
            gene_means: store.gene_means(),
            n_genes: store.n_genes(),
            n_locations: store.n_locations(),
            warnings,
        })
    }

    fn stage2_inner(
        &self,
        stage1: &Stage1Output<T>,
        operator: &CsrMatrix<T>,
    ) -> Result<(Array2<T>, Vec<RaspWarning>), RaspError> {
        if operator.nrows() != stage1.n_locations || operator.ncols() != stage1.n_locations {
            return Err(RaspError::OperatorShape {
                rows: operator.nrows(),
                cols: operator.ncols(),
                locations: stage1.n_locations,
            });
        }

        let smoothed = csr_dense_product(operator, stage1.scores.view());

        let k1 = stage1.scores.ncols();
        let k2 = self.config.stage2_rank.unwrap_or(k1).min(k1);
        // Smoothed scores are centered already when stage 1 was; a second
        // centering pass would fight the smoothing.
        let projector = self.projector(k2, false, self.config.seed.wrapping_add(1));
        let svd = projector.project_dense(smoothed.view())?;

        let mut warnings = Vec::new();
        if let Some(deficiency) = svd.deficiency {
            warnings.push(RaspWarning::RankDeficiency {
                stage: Stage::Stage2,
                requested: deficiency.requested,
                effective: deficiency.effective,
            });
        }

        // Back into the stage-1 frame: U2 S2 V2^T is the denoised smoothed
        // score matrix, still expressed over stage-1 components.
        let refined = svd.scores().dot(&svd.vt);
        Ok((refined, warnings))
    }

    fn projector(&self, target_rank: usize, center: bool, seed: u64) -> RandomizedProjector<T> {
        let mut builder = RandomizedProjector::builder()
            .target_rank(target_rank)
            .oversampling(self.config.oversampling)
            .power_iterations(self.config.power_iterations)
            .center(center)
            .rank_policy(self.config.rank_policy)
            .seed(seed);
        if let Some(token) = &self.config.cancel {
            builder = builder.cancel_token(token.clone());
        }
        builder.build()
    }
}

/// Appends standardized, weighted covariate columns to the expression
/// matrix. Covariates are z-scored so the weight acts on comparable scales.
fn augment_with_covariates<T: RaspFloat>(
    expression: &CsrMatrix<T>,
    covariates: &Array2<T>,
    weight: T,
) -> CsrMatrix<T> {
    let n = expression.nrows();
    let n_genes = expression.ncols();
    let n_covariates = covariates.ncols();

    let mut coo = CooMatrix::new(n, n_genes + n_covariates);
    for (row, col, &value) in expression.triplet_iter() {
        coo.push(row, col, value);
    }

    let n_t = T::from_usize(n.max(1)).unwrap();
    for (j, column) in covariates.axis_iter(Axis(1)).enumerate() {
        let mean = column.sum() / n_t;
        let variance = column.iter().map(|&v| (v - mean) * (v - mean)).sum::<T>() / n_t;
        let std = num_traits::Float::sqrt(variance);
        let scale = if std > T::zero() { std } else { T::one() };
        for (i, &value) in column.iter().enumerate() {
            let standardized = (value - mean) / scale * weight;
            if standardized != T::zero() {
                coo.push(i, n_genes + j, standardized);
            }
        }
    }
    CsrMatrix::from(&coo)
}

/// Total column variance of a sparse matrix, `sum_j (E[x_j^2] - E[x_j]^2)`
/// scaled by `n / (n - 1)`, computed from the stored entries alone.
fn total_variance_of<T: RaspFloat>(matrix: &CsrMatrix<T>) -> T {
    let n = matrix.nrows();
    if n < 2 {
        return T::zero();
    }
    let n_t = T::from_usize(n).unwrap();
    let denominator = T::from_usize(n - 1).unwrap();
    let sums = matrix.col_sums();
    let squared_sums = matrix.col_squared_sums();
    sums.iter()
        .zip(squared_sums.iter())
        .map(|(&sum, &sq)| {
            let mean = sum / n_t;
            (sq - mean * sum) / denominator
        })
        .sum()
}
