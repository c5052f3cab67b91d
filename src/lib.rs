pub mod error;
pub mod export;
pub mod graph;
pub mod linalg;
pub mod pca;
pub mod projector;
pub mod reconstruct;
pub mod sparse;
pub mod store;
mod utils;

pub use error::{FormatError, RaspError, RaspWarning, Stage};
pub use graph::{NeighborhoodMode, SelfWeight, SpatialGraphBuilder, WeightKernel};
pub use pca::{PcaRun, TwoStagePca, TwoStagePcaBuilder};
pub use projector::{RandomizedProjector, RandomizedProjectorBuilder, RandomizedSvd, RankPolicy};
pub use reconstruct::{GeneRestoreOptions, Reconstructor, ThresholdMethod};
pub use store::SparseMatrixStore;
pub use utils::{CancelToken, RaspFloat};
