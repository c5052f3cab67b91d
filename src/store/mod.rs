//! Input container for a pipeline run.
//!
//! [`SparseMatrixStore`] owns the expression matrix (CSR, locations x genes),
//! the spatial coordinates (one row per location) and optional covariates,
//! and is the exclusive entry point for user-provided data: everything is
//! validated here, eagerly, before any stage runs. Conversion from
//! ecosystem-specific single-cell object models is deliberately out of
//! scope; an external loader hands this type its parts.

use std::path::{Path, PathBuf};

use log::{debug, info};
use nalgebra_sparse::io::load_coo_from_matrix_market_file;
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use ndarray::{Array1, Array2, Axis};

use crate::error::{FormatError, RaspError};
use crate::sparse::{MatrixColumnStats, MatrixRowStats};
use crate::RaspFloat;

/// Expression matrix plus index-aligned spatial metadata.
///
/// Rows of every member refer to the same location. `kept_locations` and
/// `kept_genes` record which indices of the originally loaded data are still
/// present, so downstream consumers can map results back after filtering.
#[derive(Debug)]
pub struct SparseMatrixStore<T: RaspFloat> {
    expression: CsrMatrix<T>,
    coordinates: Array2<T>,
    covariates: Option<Array2<T>>,
    kept_locations: Vec<usize>,
    kept_genes: Vec<usize>,
}

impl<T: RaspFloat> SparseMatrixStore<T> {
    /// Builds a store from in-memory parts, validating index alignment,
    /// coordinate dimensionality and non-negativity.
    pub fn from_parts(
        expression: CsrMatrix<T>,
        coordinates: Array2<T>,
        covariates: Option<Array2<T>>,
    ) -> Result<Self, RaspError> {
        if coordinates.nrows() != expression.nrows() {
            return Err(FormatError::RowCountMismatch {
                expression_rows: expression.nrows(),
                coordinate_rows: coordinates.nrows(),
            }
            .into());
        }
        let dim = coordinates.ncols();
        if dim != 2 && dim != 3 {
            return Err(FormatError::CoordinateDim { dim }.into());
        }
        if let Some(cov) = &covariates {
            if cov.nrows() != expression.nrows() {
                return Err(FormatError::CovariateRowMismatch {
                    covariate_rows: cov.nrows(),
                    expression_rows: expression.nrows(),
                }
                .into());
            }
        }
        for (row, col, &value) in expression.triplet_iter() {
            if value < T::zero() {
                return Err(FormatError::NegativeEntry { row, col }.into());
            }
        }
        if expression.nnz() == 0 {
            return Err(RaspError::EmptyInput { context: "at load" });
        }

        let kept_locations = (0..expression.nrows()).collect();
        let kept_genes = (0..expression.ncols()).collect();
        Ok(Self {
            expression,
            coordinates,
            covariates,
            kept_locations,
            kept_genes,
        })
    }

    /// Loads a store from a Matrix Market expression file and CSV coordinate
    /// (and optional covariate) tables.
    ///
    /// Tables may carry a single header row; every other record must be
    /// numeric. All I/O happens here, before the pipeline runs.
    pub fn load<P: AsRef<Path>>(
        matrix_path: P,
        coordinates_path: P,
        covariates_path: Option<P>,
    ) -> Result<Self, RaspError> {
        let matrix_path = matrix_path.as_ref();
        let extension = matrix_path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        if !matches!(extension.as_deref(), Some("mtx") | Some("mm")) {
            return Err(FormatError::UnsupportedFormat {
                path: matrix_path.to_path_buf(),
            }
            .into());
        }

        let coo: CooMatrix<f64> =
            load_coo_from_matrix_market_file(matrix_path).map_err(|e| FormatError::MatrixMarket {
                path: matrix_path.to_path_buf(),
                message: e.to_string(),
            })?;
        let mut converted = CooMatrix::new(coo.nrows(), coo.ncols());
        for (row, col, &value) in coo.triplet_iter() {
            converted.push(row, col, T::from_f64(value).unwrap_or_else(T::zero));
        }
        let expression = CsrMatrix::from(&converted);

        let coordinates = read_numeric_csv::<T, _>(coordinates_path.as_ref())?;
        let covariates = match covariates_path {
            Some(path) => Some(read_numeric_csv::<T, _>(path.as_ref())?),
            None => None,
        };

        info!(
            "loaded {} locations x {} genes ({} non-zeros)",
            expression.nrows(),
            expression.ncols(),
            expression.nnz()
        );
        Self::from_parts(expression, coordinates, covariates)
    }

    /// Drops locations whose total count falls below `min_counts_per_location`
    /// and genes detected in fewer than `min_locations_per_gene` locations,
    /// returning a new store with coordinates and covariates subset to match.
    pub fn filter(
        &self,
        min_counts_per_location: Option<T>,
        min_locations_per_gene: Option<usize>,
    ) -> Result<Self, RaspError> {
        let row_sums = self.expression.row_sums();
        let col_counts = self.expression.col_nonzero();

        let keep_row: Vec<bool> = row_sums
            .iter()
            .map(|&sum| min_counts_per_location.map_or(true, |min| sum >= min))
            .collect();
        let keep_col: Vec<bool> = col_counts
            .iter()
            .map(|&count| min_locations_per_gene.map_or(true, |min| count >= min))
            .collect();

        let row_map: Vec<Option<usize>> = renumber(&keep_row);
        let col_map: Vec<Option<usize>> = renumber(&keep_col);
        let n_rows = keep_row.iter().filter(|&&k| k).count();
        let n_cols = keep_col.iter().filter(|&&k| k).count();

        let mut filtered = CooMatrix::new(n_rows, n_cols);
        for (row, col, &value) in self.expression.triplet_iter() {
            if let (Some(new_row), Some(new_col)) = (row_map[row], col_map[col]) {
                filtered.push(new_row, new_col, value);
            }
        }
        if filtered.nnz() == 0 {
            return Err(RaspError::EmptyInput {
                context: "after filtering",
            });
        }

        let kept_row_indices: Vec<usize> = keep_row
            .iter()
            .enumerate()
            .filter_map(|(i, &k)| k.then_some(i))
            .collect();
        let kept_col_indices: Vec<usize> = keep_col
            .iter()
            .enumerate()
            .filter_map(|(j, &k)| k.then_some(j))
            .collect();

        debug!(
            "filtering kept {}/{} locations and {}/{} genes",
            n_rows,
            self.n_locations(),
            n_cols,
            self.n_genes()
        );

        Ok(Self {
            expression: CsrMatrix::from(&filtered),
            coordinates: self.coordinates.select(Axis(0), &kept_row_indices),
            covariates: self
                .covariates
                .as_ref()
                .map(|cov| cov.select(Axis(0), &kept_row_indices)),
            kept_locations: kept_row_indices
                .iter()
                .map(|&i| self.kept_locations[i])
                .collect(),
            kept_genes: kept_col_indices
                .iter()
                .map(|&j| self.kept_genes[j])
                .collect(),
        })
    }

    pub fn expression(&self) -> &CsrMatrix<T> {
        &self.expression
    }

    pub fn coordinates(&self) -> &Array2<T> {
        &self.coordinates
    }

    pub fn covariates(&self) -> Option<&Array2<T>> {
        self.covariates.as_ref()
    }

    pub fn n_locations(&self) -> usize {
        self.expression.nrows()
    }

    pub fn n_genes(&self) -> usize {
        self.expression.ncols()
    }

    /// Original indices of the locations still present after filtering.
    pub fn kept_locations(&self) -> &[usize] {
        &self.kept_locations
    }

    /// Original indices of the genes still present after filtering.
    pub fn kept_genes(&self) -> &[usize] {
        &self.kept_genes
    }

    /// Per-gene mean over all locations (zeros included).
    pub fn gene_means(&self) -> Array1<T> {
        Array1::from(self.expression.col_means())
    }

    /// One gene's expression as a dense vector across locations.
    pub fn gene_column(&self, gene: usize) -> Array1<T> {
        let mut column = Array1::zeros(self.n_locations());
        let offsets = self.expression.row_offsets();
        let cols = self.expression.col_indices();
        let values = self.expression.values();
        for i in 0..self.n_locations() {
            let range = offsets[i]..offsets[i + 1];
            if let Ok(pos) = cols[range.clone()].binary_search(&gene) {
                column[i] = values[range.start + pos];
            }
        }
        column
    }
}

fn renumber(keep: &[bool]) -> Vec<Option<usize>> {
    let mut next = 0usize;
    keep.iter()
        .map(|&k| {
            if k {
                let idx = next;
                next += 1;
                Some(idx)
            } else {
                None
            }
        })
        .collect()
}

/// Reads a rectangular numeric CSV table, tolerating one leading header row.
fn read_numeric_csv<T: RaspFloat, P: AsRef<Path>>(path: P) -> Result<Array2<T>, FormatError> {
    let path: PathBuf = path.as_ref().to_path_buf();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(&path)
        .map_err(|source| csv_error(&path, source))?;

    let mut rows: Vec<Vec<T>> = Vec::new();
    let mut width: Option<usize> = None;
    for (record_idx, record) in reader.records().enumerate() {
        let record = record.map_err(|source| csv_error(&path, source))?;
        let mut parsed = Vec::with_capacity(record.len());
        let mut failed: Option<String> = None;
        for field in record.iter() {
            match field.trim().parse::<f64>() {
                Ok(value) => parsed.push(T::from_f64(value).unwrap_or_else(T::zero)),
                Err(_) => {
                    failed = Some(field.to_string());
                    break;
                }
            }
        }
        if let Some(value) = failed {
            // A non-numeric first record is a header; anywhere else it is bad data.
            if record_idx == 0 && rows.is_empty() {
                continue;
            }
            return Err(FormatError::NumberParse {
                path,
                record: record_idx,
                value,
            });
        }
        if let Some(expected) = width {
            if parsed.len() != expected {
                return Err(FormatError::RaggedTable {
                    path,
                    record: record_idx,
                    found: parsed.len(),
                    expected,
                });
            }
        } else {
            width = Some(parsed.len());
        }
        rows.push(parsed);
    }

    let width = width.unwrap_or(0);
    let flat: Vec<T> = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((rows.len(), width), flat).map_err(|_| FormatError::RaggedTable {
        path,
        record: 0,
        found: 0,
        expected: width,
    })
}

fn csv_error(path: &Path, source: csv::Error) -> FormatError {
    FormatError::Csv {
        path: path.to_path_buf(),
        source,
    }
}
