//! Spatial neighbour graph construction.
//!
//! Builds the row-stochastic smoothing operator from location coordinates: a
//! k-d tree supplies k-nearest or radius neighbourhoods, a kernel turns
//! distances into weights, and each row is normalized to sum to one. The
//! operator is intentionally not symmetrized; stage 2 applies it row-wise
//! and never through its transpose.

use std::hash::{Hash, Hasher};

use ahash::AHasher;
use kiddo::{KdTree, SquaredEuclidean};
use log::{debug, warn};
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use ndarray::Array2;
use num_traits::Float;
use parking_lot::RwLock;
use rayon::prelude::*;

use crate::error::RaspError;
use crate::utils::quantile;
use crate::RaspFloat;

/// Neighbourhood definition for the spatial graph.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NeighborhoodMode<T> {
    /// Fixed number of nearest neighbours per location.
    Knn { k: usize },
    /// All neighbours within `radius`. Locations with an empty ball either
    /// fall back to their `fallback_k` nearest neighbours or fail the build.
    Radius { radius: T, fallback_k: Option<usize> },
}

/// Distance-to-weight kernel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WeightKernel<T> {
    Uniform,
    /// `exp(-d^2 / (2 sigma^2))`; `None` picks sigma as the median edge
    /// distance of the graph.
    Gaussian { bandwidth: Option<T> },
    /// `1 / d^beta`. Zero-distance edges (coincident locations) are dropped.
    InverseDistance { beta: T },
}

/// Diagonal self-weight injected before the kernel is applied, expressed as
/// a pseudo-distance derived from the smallest positive edge distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfWeight {
    /// Half the minimum positive distance (grid platforms where each spot
    /// should dominate its own neighbourhood).
    HalfMinDistance,
    MinDistance,
    None,
}

struct CachedOperator<T> {
    fingerprint: u64,
    operator: CsrMatrix<T>,
}

/// Builds [`CsrMatrix`] smoothing operators from coordinates.
///
/// The last built operator is memoized against a fingerprint of the
/// coordinates and configuration; rebuilding with the same inputs is a
/// cheap clone, and any change invalidates the entry.
pub struct SpatialGraphBuilder<T: RaspFloat> {
    mode: NeighborhoodMode<T>,
    kernel: WeightKernel<T>,
    self_weight: SelfWeight,
    trim_percentile: Option<f64>,
    cache: RwLock<Option<CachedOperator<T>>>,
}

impl<T: RaspFloat> Default for SpatialGraphBuilder<T> {
    fn default() -> Self {
        Self {
            mode: NeighborhoodMode::Knn { k: 6 },
            kernel: WeightKernel::InverseDistance {
                beta: T::from_f64(2.0).unwrap(),
            },
            self_weight: SelfWeight::HalfMinDistance,
            trim_percentile: Some(99.0),
            cache: RwLock::new(None),
        }
    }
}

impl<T: RaspFloat> SpatialGraphBuilder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn knn(mut self, k: usize) -> Self {
        self.mode = NeighborhoodMode::Knn { k };
        self
    }

    pub fn radius(mut self, radius: T, fallback_k: Option<usize>) -> Self {
        self.mode = NeighborhoodMode::Radius { radius, fallback_k };
        self
    }

    pub fn kernel(mut self, kernel: WeightKernel<T>) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn self_weight(mut self, self_weight: SelfWeight) -> Self {
        self.self_weight = self_weight;
        self
    }

    /// Drops edges longer than this percentile of all edge distances before
    /// weighting. `None` keeps every edge.
    pub fn trim_percentile(mut self, percentile: Option<f64>) -> Self {
        self.trim_percentile = percentile;
        self
    }

    /// Builds the row-normalized smoothing operator for `coordinates`
    /// (locations x 2 or locations x 3).
    pub fn build(&self, coordinates: &Array2<T>) -> Result<CsrMatrix<T>, RaspError> {
        let dim = coordinates.ncols();
        if dim != 2 && dim != 3 {
            return Err(crate::error::FormatError::CoordinateDim { dim }.into());
        }

        let fingerprint = self.fingerprint(coordinates);
        if let Some(cached) = self.cache.read().as_ref() {
            if cached.fingerprint == fingerprint {
                debug!("smoothing operator cache hit");
                return Ok(cached.operator.clone());
            }
        }

        let mut edges = match dim {
            2 => self.neighbor_edges::<2>(coordinates)?,
            _ => self.neighbor_edges::<3>(coordinates)?,
        };

        if let Some(percentile) = self.trim_percentile {
            let distances: Vec<T> = edges.iter().map(|&(_, _, d)| d).collect();
            if let Some(threshold) = quantile(&distances, percentile / 100.0) {
                let before = edges.len();
                edges.retain(|&(_, _, d)| d <= threshold);
                if edges.len() < before {
                    debug!(
                        "trimmed {} edges beyond the {percentile} percentile",
                        before - edges.len()
                    );
                }
            }
        }

        let min_positive = edges
            .iter()
            .map(|&(_, _, d)| d)
            .filter(|&d| d > T::zero())
            .fold(None, |acc: Option<T>, d| {
                Some(acc.map_or(d, |m| Float::min(m, d)))
            })
            .unwrap_or_else(T::one);
        match self.self_weight {
            SelfWeight::HalfMinDistance => {
                let diag = min_positive / T::from_f64(2.0).unwrap();
                edges.extend((0..coordinates.nrows()).map(|i| (i, i, diag)));
            }
            SelfWeight::MinDistance => {
                edges.extend((0..coordinates.nrows()).map(|i| (i, i, min_positive)));
            }
            SelfWeight::None => {}
        }

        let operator = self.weight_and_normalize(coordinates.nrows(), edges)?;
        *self.cache.write() = Some(CachedOperator {
            fingerprint,
            operator: operator.clone(),
        });
        Ok(operator)
    }

    fn neighbor_edges<const D: usize>(
        &self,
        coordinates: &Array2<T>,
    ) -> Result<Vec<(usize, usize, T)>, RaspError> {
        let n = coordinates.nrows();
        let point = |i: usize| -> [f64; D] {
            let mut buf = [0.0f64; D];
            for (dst, value) in buf.iter_mut().zip(coordinates.row(i).iter()) {
                *dst = value.to_f64().unwrap_or(0.0);
            }
            buf
        };

        let mut tree: KdTree<f64, D> = KdTree::new();
        for i in 0..n {
            tree.add(&point(i), i as u64);
        }

        let per_location: Vec<Vec<(usize, usize, T)>> = (0..n)
            .into_par_iter()
            .map(|i| {
                let query = point(i);
                let neighbours: Vec<(usize, f64)> = match self.mode {
                    NeighborhoodMode::Knn { k } => tree
                        .nearest_n::<SquaredEuclidean>(&query, k + 1)
                        .into_iter()
                        .filter(|nb| nb.item != i as u64)
                        .take(k)
                        .map(|nb| (nb.item as usize, nb.distance.sqrt()))
                        .collect(),
                    NeighborhoodMode::Radius { radius, fallback_k } => {
                        let r = radius.to_f64().unwrap_or(0.0);
                        let within: Vec<(usize, f64)> = tree
                            .within_unsorted::<SquaredEuclidean>(&query, r * r)
                            .into_iter()
                            .filter(|nb| nb.item != i as u64)
                            .map(|nb| (nb.item as usize, nb.distance.sqrt()))
                            .collect();
                        if !within.is_empty() {
                            within
                        } else if let Some(k) = fallback_k {
                            warn!("location {i} has no neighbours within {r}; falling back to {k}-nearest");
                            tree.nearest_n::<SquaredEuclidean>(&query, k + 1)
                                .into_iter()
                                .filter(|nb| nb.item != i as u64)
                                .take(k)
                                .map(|nb| (nb.item as usize, nb.distance.sqrt()))
                                .collect()
                        } else {
                            return Err(RaspError::InsufficientNeighbors {
                                location: i,
                                radius: r,
                            });
                        }
                    }
                };
                Ok(neighbours
                    .into_iter()
                    .map(|(j, d)| (i, j, T::from_f64(d).unwrap_or_else(T::zero)))
                    .collect())
            })
            .collect::<Result<_, RaspError>>()?;

        Ok(per_location.into_iter().flatten().collect())
    }

    fn weight_and_normalize(
        &self,
        n: usize,
        edges: Vec<(usize, usize, T)>,
    ) -> Result<CsrMatrix<T>, RaspError> {
        let bandwidth = match self.kernel {
            WeightKernel::Gaussian { bandwidth: None } => {
                let distances: Vec<T> = edges
                    .iter()
                    .map(|&(_, _, d)| d)
                    .filter(|&d| d > T::zero())
                    .collect();
                quantile(&distances, 0.5).filter(|&m| m > T::zero())
            }
            WeightKernel::Gaussian { bandwidth } => bandwidth,
            _ => None,
        };

        let mut coo = CooMatrix::new(n, n);
        for (i, j, d) in edges {
            let weight = match self.kernel {
                WeightKernel::Uniform => Some(T::one()),
                WeightKernel::Gaussian { .. } => {
                    let sigma = bandwidth.unwrap_or_else(T::one);
                    Some(Float::exp(
                        -(d * d) / (T::from_f64(2.0).unwrap() * sigma * sigma),
                    ))
                }
                WeightKernel::InverseDistance { beta } => {
                    if d > T::zero() {
                        Some(T::one() / Float::powf(d, beta))
                    } else {
                        None
                    }
                }
            };
            if let Some(w) = weight {
                coo.push(i, j, w);
            }
        }

        let mut operator = CsrMatrix::from(&coo);
        let offsets: Vec<usize> = operator.row_offsets().to_vec();
        let values = operator.values_mut();
        for i in 0..n {
            let row = &mut values[offsets[i]..offsets[i + 1]];
            let sum: T = row.iter().copied().sum();
            if sum > T::zero() {
                for value in row.iter_mut() {
                    *value /= sum;
                }
            }
        }
        Ok(operator)
    }

    fn fingerprint(&self, coordinates: &Array2<T>) -> u64 {
        let mut hasher = AHasher::default();
        match self.mode {
            NeighborhoodMode::Knn { k } => {
                0u8.hash(&mut hasher);
                k.hash(&mut hasher);
            }
            NeighborhoodMode::Radius { radius, fallback_k } => {
                1u8.hash(&mut hasher);
                radius.to_f64().unwrap_or(0.0).to_bits().hash(&mut hasher);
                fallback_k.hash(&mut hasher);
            }
        }
        match self.kernel {
            WeightKernel::Uniform => 0u8.hash(&mut hasher),
            WeightKernel::Gaussian { bandwidth } => {
                1u8.hash(&mut hasher);
                bandwidth
                    .map(|b| b.to_f64().unwrap_or(0.0).to_bits())
                    .hash(&mut hasher);
            }
            WeightKernel::InverseDistance { beta } => {
                2u8.hash(&mut hasher);
                beta.to_f64().unwrap_or(0.0).to_bits().hash(&mut hasher);
            }
        }
        (self.self_weight as u8).hash(&mut hasher);
        self.trim_percentile.map(f64::to_bits).hash(&mut hasher);
        coordinates.nrows().hash(&mut hasher);
        coordinates.ncols().hash(&mut hasher);
        for value in coordinates.iter() {
            value.to_f64().unwrap_or(0.0).to_bits().hash(&mut hasher);
        }
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn grid_coords() -> Array2<f64> {
        array![
            [0.0, 0.0],
            [1.0, 0.0],
            [0.0, 1.0],
            [1.0, 1.0],
            [0.5, 0.5]
        ]
    }

    fn row_sums(op: &CsrMatrix<f64>) -> Vec<f64> {
        let offsets = op.row_offsets();
        (0..op.nrows())
            .map(|i| op.values()[offsets[i]..offsets[i + 1]].iter().sum())
            .collect()
    }

    #[test]
    fn test_rows_are_stochastic() {
        let coords = grid_coords();
        let op = SpatialGraphBuilder::new().knn(3).build(&coords).unwrap();
        for sum in row_sums(&op) {
            assert_relative_eq!(sum, 1.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_inverse_distance_prefers_near_neighbours() {
        let coords = array![[0.0, 0.0], [1.0, 0.0], [4.0, 0.0]];
        let op = SpatialGraphBuilder::new()
            .knn(2)
            .self_weight(SelfWeight::None)
            .trim_percentile(None)
            .build(&coords)
            .unwrap();
        // Location 0: neighbour 1 at distance 1 outweighs neighbour 2 at 4.
        let w01 = op.get_entry(0, 1).unwrap().into_value();
        let w02 = op.get_entry(0, 2).unwrap().into_value();
        assert!(w01 > w02);
        assert_relative_eq!(w01 + w02, 1.0, epsilon = 1e-10);
    }

    #[test]
    fn test_radius_without_fallback_errors() {
        let coords = array![[0.0, 0.0], [0.1, 0.0], [100.0, 100.0]];
        let err = SpatialGraphBuilder::new()
            .radius(1.0, None)
            .build(&coords)
            .unwrap_err();
        assert!(matches!(
            err,
            RaspError::InsufficientNeighbors { location: 2, .. }
        ));
    }

    #[test]
    fn test_radius_with_fallback_recovers() {
        let coords = array![[0.0, 0.0], [0.1, 0.0], [100.0, 100.0]];
        let op = SpatialGraphBuilder::new()
            .radius(1.0, Some(1))
            .trim_percentile(None)
            .build(&coords)
            .unwrap();
        for sum in row_sums(&op) {
            assert_relative_eq!(sum, 1.0, epsilon = 1e-10);
        }
        // The isolated location received exactly its fallback neighbour plus
        // the diagonal entry.
        assert!(op.get_entry(2, 0).unwrap().into_value() > 0.0);
    }

    #[test]
    fn test_gaussian_weights_bounded() {
        let op = SpatialGraphBuilder::new()
            .knn(2)
            .kernel(WeightKernel::Gaussian { bandwidth: None })
            .build(&grid_coords())
            .unwrap();
        for &w in op.values() {
            assert!(w > 0.0 && w <= 1.0);
        }
    }

    #[test]
    fn test_cache_invalidation() {
        let builder = SpatialGraphBuilder::new().knn(2);
        let coords = grid_coords();
        let first = builder.build(&coords).unwrap();
        let second = builder.build(&coords).unwrap();
        assert_eq!(first.values(), second.values());

        let mut moved = coords.clone();
        moved[[0, 0]] = 10.0;
        let third = builder.build(&moved).unwrap();
        assert_ne!(first.values(), third.values());
    }

    #[test]
    fn test_three_dimensional_coordinates() {
        let coords = array![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0]
        ];
        let op = SpatialGraphBuilder::new().knn(2).build(&coords).unwrap();
        assert_eq!(op.nrows(), 4);
        for sum in row_sums(&op) {
            assert_relative_eq!(sum, 1.0, epsilon = 1e-10);
        }
    }
}
