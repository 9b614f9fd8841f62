//! Index build and search configuration.

use crate::{Result, VamanaError};
use serde::{Deserialize, Serialize};

/// Vamana index configuration.
///
/// The defaults match the reference DiskANN parameterization; see each field
/// for its effect on the recall/latency/RAM trade-off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VamanaConfig {
    /// Maximum out-degree per vertex (R). Default: 64.
    pub max_degree: usize,

    /// Candidate list size (beam width) during search and candidate
    /// harvesting (L). Must be >= `max_degree`. Default: 128.
    pub search_list_size: usize,

    /// Robust-prune diversity multiplier (alpha). Values above 1.0 keep more
    /// diverse neighbors at the cost of graph density. Default: 1.2.
    pub alpha: f32,

    /// Product Quantization compression ratio: source bytes per code byte.
    /// Must be a multiple of 4; the derived sub-vector length
    /// (`compression / 4`) must divide the vector dimension. Default: 32.
    pub pq_compression: usize,

    /// Maximum k-means iterations when fitting PQ codebooks. Default: 25.
    pub pq_kmeans_iterations: usize,

    /// Training sample cap for PQ codebook fitting. Default: 10_000.
    pub pq_training_sample_size: usize,

    /// RNG seed. Every shuffle and k-means initialization in the build flows
    /// from this seed; PQ fitting and partition assignment are fully
    /// reproducible, graph pruning up to worker interleaving. Default: 42.
    pub seed: u64,
}

impl Default for VamanaConfig {
    fn default() -> Self {
        Self {
            max_degree: 64,
            search_list_size: 128,
            alpha: 1.2,
            pq_compression: 32,
            pq_kmeans_iterations: 25,
            pq_training_sample_size: 10_000,
            seed: 42,
        }
    }
}

impl VamanaConfig {
    /// Validate the configuration against the vector dimension.
    ///
    /// Returns the derived PQ shape `(quantizers, sub_dim)` on success.
    pub(crate) fn validate(&self, dimensions: usize) -> Result<(usize, usize)> {
        if dimensions == 0 {
            return Err(VamanaError::Config("dimensions must be positive".into()));
        }
        if self.max_degree == 0 || self.search_list_size == 0 {
            return Err(VamanaError::Config(
                "max_degree and search_list_size must be positive".into(),
            ));
        }
        if self.search_list_size < self.max_degree {
            return Err(VamanaError::Config(format!(
                "search_list_size ({}) must be >= max_degree ({})",
                self.search_list_size, self.max_degree
            )));
        }
        crate::pq::pq_parameters(dimensions, self.pq_compression)
    }
}
