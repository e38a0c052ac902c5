//! qv-ordered kernels: outer loop over queries, inner over the database.
//!
//! Each query owns a private heap (or score vector for the nth-element
//! path), so parallelization over the query axis is embarrassingly
//! parallel and the merge is a no-op.

use crate::error::{Error, Result};
use crate::flat::assemble_top_k;
use crate::matrix::{ColMajorMatrix, ColumnMajor};
use crate::scoring::l2_squared;
use crate::types::{ExternalId, FeatureElement, Score};
use crate::utils::{top_k_nth, with_threads, FixedMinHeap};
use rayon::prelude::*;

/// Exact top-k of every query column against every database column.
///
/// `nth` selects the `select_nth_unstable` top-k path instead of the heap.
/// Returns k x Q score and id matrices; ids index the database columns.
pub fn qv_query<A, B, D, Q>(
    db: &D,
    q: &Q,
    k: usize,
    nth: bool,
    nthreads: usize,
) -> Result<(ColMajorMatrix<Score>, ColMajorMatrix<ExternalId>)>
where
    A: FeatureElement,
    B: FeatureElement,
    D: ColumnMajor<A>,
    Q: ColumnMajor<B>,
{
    require_resident(db, q)?;

    let nq = q.num_cols();
    let per_query: Vec<Vec<(Score, ExternalId)>> = with_threads(nthreads, || {
        (0..nq)
            .into_par_iter()
            .map(|j| scan_one(db, q.col(j), k, nth))
            .collect()
    })?;

    Ok(assemble_top_k(per_query, k))
}

/// Nearest single database column for every query column.
///
/// This is the partitioning primitive: with `db` holding centroids and `q`
/// the vectors to assign, the result is each vector's partition.
pub fn qv_partition<A, B, D, Q>(db: &D, q: &Q, nthreads: usize) -> Result<Vec<usize>>
where
    A: FeatureElement,
    B: FeatureElement,
    D: ColumnMajor<A>,
    Q: ColumnMajor<B>,
{
    require_resident(db, q)?;

    let nq = q.num_cols();
    with_threads(nthreads, || {
        (0..nq)
            .into_par_iter()
            .map(|j| {
                let qv = q.col(j);
                let mut best = 0usize;
                let mut best_score = Score::INFINITY;
                for i in 0..db.num_cols() {
                    let score = l2_squared(db.col(i), qv);
                    if score < best_score {
                        best_score = score;
                        best = i;
                    }
                }
                best
            })
            .collect()
    })
}

fn scan_one<A, B, D>(db: &D, query: &[B], k: usize, nth: bool) -> Vec<(Score, ExternalId)>
where
    A: FeatureElement,
    B: FeatureElement,
    D: ColumnMajor<A>,
{
    let n = db.num_cols();
    if nth {
        let scores: Vec<Score> = (0..n).map(|i| l2_squared(db.col(i), query)).collect();
        top_k_nth(&scores, k)
            .into_iter()
            .map(|i| (scores[i], i as ExternalId))
            .collect()
    } else {
        let mut heap = FixedMinHeap::new(k);
        for i in 0..n {
            heap.insert(l2_squared(db.col(i), query), i as ExternalId);
        }
        heap.into_sorted_vec()
    }
}

fn require_resident<A, B, D, Q>(db: &D, q: &Q) -> Result<()>
where
    A: FeatureElement,
    B: FeatureElement,
    D: ColumnMajor<A>,
    Q: ColumnMajor<B>,
{
    if db.is_blocked() || q.is_blocked() {
        return Err(Error::InvalidParameter(
            "qv kernels require in-memory operands; use vq_query_heap for streaming".to_string(),
        ));
    }
    if db.num_rows() != q.num_rows() {
        return Err(Error::DimensionMismatch {
            expected: db.num_rows(),
            got: q.num_rows(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::INVALID_ID;

    #[test]
    fn test_qv_query_exact() {
        let db = ColMajorMatrix::from_vec(1, 5, vec![0.0f32, 10.0, 2.0, 7.0, 1.0]);
        let q = ColMajorMatrix::from_vec(1, 1, vec![0.0f32]);

        let (scores, ids) = qv_query(&db, &q, 3, false, 1).unwrap();
        assert_eq!(ids.col(0), &[0, 4, 2]);
        assert_eq!(scores.col(0), &[0.0, 1.0, 4.0]);
    }

    #[test]
    fn test_qv_query_nth_matches_heap() {
        let db = ColMajorMatrix::from_vec(1, 6, vec![5.0f32, 3.0, 8.0, 0.5, 2.0, 9.0]);
        let q = ColMajorMatrix::from_vec(1, 2, vec![0.0f32, 9.0]);

        let (hs, hi) = qv_query(&db, &q, 4, false, 2).unwrap();
        let (ns, ni) = qv_query(&db, &q, 4, true, 2).unwrap();
        for j in 0..2 {
            assert_eq!(hi.col(j), ni.col(j));
            assert_eq!(hs.col(j), ns.col(j));
        }
    }

    #[test]
    fn test_qv_partition() {
        // Two centroids at 0 and 10.
        let centroids = ColMajorMatrix::from_vec(1, 2, vec![0.0f32, 10.0]);
        let vectors = ColMajorMatrix::from_vec(1, 4, vec![1.0f32, 9.0, 4.0, 6.0]);

        let parts = qv_partition(&centroids, &vectors, 1).unwrap();
        assert_eq!(parts, vec![0, 1, 0, 1]);
    }

    #[test]
    fn test_dimension_mismatch() {
        let db = ColMajorMatrix::<f32>::new(3, 2);
        let q = ColMajorMatrix::<f32>::new(4, 1);
        assert!(matches!(
            qv_query(&db, &q, 1, false, 1),
            Err(Error::DimensionMismatch { expected: 3, got: 4 })
        ));
    }

    #[test]
    fn test_empty_query_set() {
        let db = ColMajorMatrix::<f32>::new(2, 3);
        let q = ColMajorMatrix::<f32>::new(2, 0);
        let (scores, ids) = qv_query(&db, &q, 2, false, 1).unwrap();
        assert_eq!(scores.num_cols(), 0);
        assert_eq!(ids.num_cols(), 0);
    }

    #[test]
    fn test_empty_database_pads() {
        let db = ColMajorMatrix::<f32>::new(2, 0);
        let q = ColMajorMatrix::<f32>::new(2, 1);
        let (_, ids) = qv_query(&db, &q, 2, false, 1).unwrap();
        assert_eq!(ids.col(0), &[INVALID_ID, INVALID_ID]);
    }
}
