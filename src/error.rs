//! Error taxonomy for the pipeline.
//!
//! Input problems surface as [`FormatError`] at load time and are never
//! silently coerced. Numerical degradations that do not invalidate a run
//! (rank deficiency) are [`RaspWarning`] values carried alongside results.
//! A failure inside a pipeline stage aborts the whole run and is wrapped in
//! [`RaspError::Pipeline`] naming the stage.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Malformed or mismatched input data.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse Matrix Market file {path}: {message}")]
    MatrixMarket { path: PathBuf, message: String },
    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("could not parse '{value}' as a number in {path}, record {record}")]
    NumberParse {
        path: PathBuf,
        record: usize,
        value: String,
    },
    #[error(
        "expression matrix has {expression_rows} rows but the coordinate table has \
         {coordinate_rows}; inputs must be index-aligned per location"
    )]
    RowCountMismatch {
        expression_rows: usize,
        coordinate_rows: usize,
    },
    #[error(
        "covariate table has {covariate_rows} rows but the run has {expression_rows} locations"
    )]
    CovariateRowMismatch {
        covariate_rows: usize,
        expression_rows: usize,
    },
    #[error("spatial coordinates must be 2- or 3-dimensional, got {dim} columns")]
    CoordinateDim { dim: usize },
    #[error("ragged table in {path}: record {record} has {found} fields, expected {expected}")]
    RaggedTable {
        path: PathBuf,
        record: usize,
        found: usize,
        expected: usize,
    },
    #[error("expression matrix contains a negative entry at ({row}, {col}); counts must be non-negative")]
    NegativeEntry { row: usize, col: usize },
    #[error("unsupported expression format for {path}; expected a Matrix Market .mtx file")]
    UnsupportedFormat { path: PathBuf },
}

/// Pipeline stage used to annotate failures and warnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Graph,
    Stage1,
    Stage2,
    Finalize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Graph => write!(f, "graph construction"),
            Stage::Stage1 => write!(f, "stage 1 (randomized PCA)"),
            Stage::Stage2 => write!(f, "stage 2 (spatial refinement)"),
            Stage::Finalize => write!(f, "finalization"),
        }
    }
}

/// Top-level error type of the crate.
#[derive(Error, Debug)]
pub enum RaspError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("expression matrix has no non-zero entries ({context})")]
    EmptyInput { context: &'static str },
    #[error(
        "location {location} has no neighbours within radius {radius}; enable a k-nearest \
         fallback or increase the radius"
    )]
    InsufficientNeighbors { location: usize, radius: f64 },
    #[error("smoothing operator is {rows}x{cols} but the run has {locations} locations")]
    OperatorShape {
        rows: usize,
        cols: usize,
        locations: usize,
    },
    #[error("pipeline stage failed ({stage}): {source}")]
    Pipeline {
        stage: Stage,
        #[source]
        source: Box<RaspError>,
    },
    #[error("run cancelled")]
    Cancelled,
    #[error("gene index {gene} out of range for a run over {n_genes} genes")]
    GeneIndex { gene: usize, n_genes: usize },
    #[error("invalid engine state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
}

impl RaspError {
    /// Wraps `self` with the stage it occurred in.
    pub fn in_stage(self, stage: Stage) -> Self {
        RaspError::Pipeline {
            stage,
            source: Box::new(self),
        }
    }
}

/// Non-fatal numerical condition surfaced to the caller next to the result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaspWarning {
    RankDeficiency {
        stage: Stage,
        requested: usize,
        effective: usize,
    },
}

impl fmt::Display for RaspWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaspWarning::RankDeficiency {
                stage,
                requested,
                effective,
            } => write!(
                f,
                "rank deficiency in {stage}: requested {requested} components, input supports {effective}"
            ),
        }
    }
}
