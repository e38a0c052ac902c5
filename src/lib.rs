//! annex - approximate nearest neighbor search over column-major vector
//! sets.
//!
//! The crate builds and serves two index families over feature-vector sets
//! stored as column-major D x N matrices, ranking by squared Euclidean
//! distance:
//!
//! - **IVF-Flat**: k-means partitioning with exact search inside the
//!   probed partitions. Queries run either with the whole index resident
//!   (infinite-RAM) or streaming partitions from the array store in
//!   bounded blocks (finite-RAM).
//! - **Vamana**: a DiskANN-style proximity graph built with greedy search
//!   and alpha-diversified robust pruning, queried by truncated best-first
//!   search from the medoid.
//!
//! Exact brute-force kernels (qv / vq / gemm orderings) serve as the
//! partition leaves and as the correctness oracle for recall measurement.
//! Indexes persist as versioned groups of array members behind the
//! [`storage::ArrayStore`] contract.
//!
//! # IVF-Flat
//!
//! ```
//! use annex::prelude::*;
//!
//! let db = ColMajorMatrix::from_columns(&[
//!     &[0.0f32, 0.0],
//!     &[0.1, 0.0],
//!     &[5.0, 5.0],
//!     &[5.1, 5.0],
//! ]);
//!
//! let mut index = IvfFlatIndex::new(2, IvfFlatParams::new(2).with_seed(7)).unwrap();
//! index.train(&db, KMeansInit::KMeansPlusPlus).unwrap();
//! index.add(&db, None).unwrap();
//!
//! let queries = ColMajorMatrix::from_columns(&[&[5.05f32, 5.0]]);
//! let (_, ids) = index.query_infinite_ram(&queries, 2, 1).unwrap();
//! assert!(ids.col(0).contains(&2) && ids.col(0).contains(&3));
//! ```
//!
//! # Vamana
//!
//! ```
//! use annex::prelude::*;
//!
//! let db = ColMajorMatrix::from_columns(&[
//!     &[0.0f32, 0.0],
//!     &[1.0, 0.0],
//!     &[0.0, 1.0],
//!     &[1.0, 1.0],
//! ]);
//!
//! let mut index = VamanaIndex::new(
//!     VamanaParams::new().with_l_build(4).with_r_max_degree(4),
//! )
//! .unwrap();
//! index.train(&db).unwrap();
//!
//! let (scores, ids) = index.query(&db, 1, None).unwrap();
//! assert_eq!(ids.col(3)[0], 3);
//! assert_eq!(scores.col(3)[0], 0.0);
//! ```

pub mod error;
pub mod flat;
pub mod graph;
pub mod ivf;
pub mod kmeans;
pub mod matrix;
pub mod recall;
pub mod scoring;
pub mod storage;
pub mod types;
pub mod utils;


/// Convenience re-exports of the commonly used types.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::flat::{gemm_query, qv_partition, qv_query, vq_query_heap};
    pub use crate::graph::{
        greedy_search, medoid, robust_prune, AdjacencyList, VamanaIndex, VamanaParams,
    };
    pub use crate::ivf::{IvfFlatIndex, IvfFlatParams};
    pub use crate::kmeans::{KMeans, KMeansInit};
    pub use crate::matrix::{ColMajorMatrix, ColumnMajor, MatrixView, StreamingMatrix};
    pub use crate::recall::recall_at_k;
    pub use crate::scoring::{l2_squared, sum_of_squares, Metric};
    pub use crate::storage::{ArrayStore, FsStore, StorageVersion};
    pub use crate::types::{ExternalId, FeatureElement, NodeId, Score, INVALID_ID};
    pub use crate::utils::FixedMinHeap;
}
