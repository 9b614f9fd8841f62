//! Vector primitives for UmiDB.
//!
//! This crate provides the leaf-level building blocks consumed by the
//! disk-resident index crates:
//!
//! - **Distance kernels**: L2 (squared Euclidean) and negated dot product,
//!   in single and batched 1x4 forms
//! - **VectorReader trait**: random access to a vector source during builds
//! - **SliceVectorReader**: an in-memory reader over a flat `f32` buffer
//!
//! # Example
//!
//! ```
//! use umi_vector::{DistanceKind, SliceVectorReader, VectorReader};
//!
//! let data = [0.0f32, 0.0, 3.0, 4.0];
//! let reader = SliceVectorReader::new(&data, 2).unwrap();
//!
//! let d = DistanceKind::L2.distance(reader.read(0), reader.read(1));
//! assert!((d - 25.0).abs() < 1e-6);
//! ```

mod distance;
mod reader;

pub use distance::{l2_distance, neg_dot_distance, DistanceKind};
pub use reader::{SliceVectorReader, VectorReader};

/// Error type for vector operations.
#[derive(Debug, thiserror::Error)]
pub enum VectorError {
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Buffer of {len} floats is not a whole number of {dimensions}-dimensional vectors")]
    RaggedBuffer { len: usize, dimensions: usize },

    #[error("Vector source does not provide external ids")]
    IdsUnsupported,
}

/// Result type for vector operations.
pub type Result<T> = std::result::Result<T, VectorError>;
