//! Disk-resident Vamana (DiskANN) index with Product Quantization.
//!
//! Builds a directed proximity graph over a dataset of fixed-dimension `f32`
//! vectors, persists it as a paged memory-mapped file, and answers top-K
//! nearest-neighbor queries with a best-first beam search that scores
//! candidates by Product Quantization estimates and re-ranks promotions with
//! precise distances read from the mapped file.
//!
//! # Architecture
//!
//! The build pipeline:
//!
//! ```text
//! VectorReader --> PqCodec (fit + encode)
//!              --> partition assignment (two PQ-nearest centroids per vector)
//!              --> per-partition parallel Vamana build (PartitionGraph)
//!              --> N-way merge into the paged file (merge)
//!              --> DiskGraph (mmap-served beam search)
//! ```
//!
//! # Key Features
//!
//! - **Disk-resident graph**: one paged file, accessed via mmap
//! - **Product Quantization**: per-query lookup tables keep the hot search
//!   loop off the disk-resident full vectors
//! - **Partitioned build**: every vector lands in its two PQ-nearest
//!   partitions, bounding per-partition RAM
//! - **Lock-light construction**: per-vertex seqlock, back edges routed to a
//!   deterministic owner thread
//!
//! # Example
//!
//! ```no_run
//! use umi_vamana::{VamanaConfig, VamanaIndex};
//! use umi_vector::{DistanceKind, SliceVectorReader};
//!
//! let vectors = vec![0.0f32; 1000 * 128];
//! let reader = SliceVectorReader::new(&vectors, 128).unwrap();
//!
//! let mut index = VamanaIndex::new(
//!     "embeddings",
//!     "/var/lib/umi",
//!     128,
//!     DistanceKind::L2,
//!     VamanaConfig::default(),
//! ).unwrap();
//! index.build_index(4, &reader).unwrap();
//!
//! let query = vec![0.0f32; 128];
//! let mut out = [0u32; 10];
//! let found = index.nearest(&query, &mut out).unwrap();
//! println!("{:?}", &out[..found]);
//! ```

mod builder;
mod candidates;
mod config;
mod disk;
mod graph;
mod index;
mod kmeans;
mod merge;
mod pq;

pub use config::VamanaConfig;
pub use index::VamanaIndex;

/// Error type for Vamana operations.
#[derive(Debug, thiserror::Error)]
pub enum VamanaError {
    #[error("Vector error: {0}")]
    Vector(#[from] umi_vector::VectorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Index has not been built yet")]
    NotBuilt,
}

/// Result type for Vamana operations.
pub type Result<T> = std::result::Result<T, VamanaError>;
