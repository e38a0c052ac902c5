//! Exact brute-force query kernels.
//!
//! Three variants compute the exact top-k of every query column against
//! every database column under squared L2:
//!
//! - [`qv_query`]: outer loop over queries, per-query private heap.
//! - [`vq_query_heap`]: outer loop over the database with per-worker heap
//!   sets; the only variant that accepts a streaming operand.
//! - [`gemm_query`]: materializes the full score matrix through a matrix
//!   product and selects per column.
//!
//! All three are logically equivalent; result differences can arise only
//! from tie-breaking on equal distances. They double as the correctness
//! oracle for the approximate indexes.

pub mod gemm;
pub mod qv;
pub mod vq;

pub use gemm::gemm_query;
pub use qv::{qv_partition, qv_query};
pub use vq::vq_query_heap;

use crate::matrix::ColMajorMatrix;
use crate::types::{ExternalId, Score, INVALID_ID};

/// Assemble per-query sorted `(score, id)` lists into the k x Q output
/// matrices, padding short lists with `INVALID_ID` / infinity.
pub(crate) fn assemble_top_k(
    per_query: Vec<Vec<(Score, ExternalId)>>,
    k: usize,
) -> (ColMajorMatrix<Score>, ColMajorMatrix<ExternalId>) {
    let nq = per_query.len();
    let mut scores = ColMajorMatrix::from_vec(k, nq, vec![Score::INFINITY; k * nq]);
    let mut ids = ColMajorMatrix::from_vec(k, nq, vec![INVALID_ID; k * nq]);
    for (j, entries) in per_query.into_iter().enumerate() {
        for (slot, (score, id)) in entries.into_iter().take(k).enumerate() {
            scores.col_mut(j)[slot] = score;
            ids.col_mut(j)[slot] = id;
        }
    }
    (scores, ids)
}
