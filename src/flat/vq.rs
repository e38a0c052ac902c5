//! vq-ordered kernel: outer loop over the database, inner over queries.
//!
//! Each worker owns a private heap per query; the heaps are merged
//! sequentially after the scan, so worker boundaries fully determine the
//! merge order. Either operand (but not both) may be a streaming matrix:
//! the kernel consumes one block per pass and advances the blocked operand
//! until it is exhausted.

use crate::error::{Error, Result};
use crate::flat::assemble_top_k;
use crate::matrix::{ColMajorMatrix, ColumnMajor};
use crate::scoring::l2_squared;
use crate::types::{ExternalId, FeatureElement, Score};
use crate::utils::{with_threads, worker_ranges, FixedMinHeap};
use rayon::prelude::*;

/// Exact top-k with the database on the outer loop.
///
/// Exactly one of `db` / `q` may be blocked; both blocked fails with
/// [`Error::BothBlocked`]. Ids in the result are absolute database column
/// indices regardless of blocking.
pub fn vq_query_heap<A, B, D, Q>(
    db: &mut D,
    q: &mut Q,
    k: usize,
    nthreads: usize,
) -> Result<(ColMajorMatrix<Score>, ColMajorMatrix<ExternalId>)>
where
    A: FeatureElement,
    B: FeatureElement,
    D: ColumnMajor<A>,
    Q: ColumnMajor<B>,
{
    if db.is_blocked() && q.is_blocked() {
        return Err(Error::BothBlocked);
    }
    if db.num_rows() != q.num_rows() {
        return Err(Error::DimensionMismatch {
            expected: db.num_rows(),
            got: q.num_rows(),
        });
    }

    let total_q = q.total_cols();
    let nworkers = if nthreads == 0 {
        std::thread::available_parallelism().map_or(1, |n| n.get())
    } else {
        nthreads
    };

    // Per-worker private heaps for every query, held across blocks.
    let mut heaps: Vec<Vec<FixedMinHeap<ExternalId>>> = (0..nworkers)
        .map(|_| (0..total_q).map(|_| FixedMinHeap::new(k)).collect())
        .collect();

    loop {
        let db_ref = &*db;
        let q_ref = &*q;
        let width = db_ref.num_cols();
        let db_off = db_ref.offset();
        let q_off = q_ref.offset();
        let q_width = q_ref.num_cols();
        let ranges = worker_ranges(width, nworkers);

        with_threads(nthreads, || {
            heaps
                .par_iter_mut()
                .enumerate()
                .for_each(|(n, worker_heaps)| {
                    let Some(range) = ranges.get(n) else {
                        return;
                    };
                    for i in range.clone() {
                        let db_vec = db_ref.col(i);
                        for j in 0..q_width {
                            let score = l2_squared(q_ref.col(j), db_vec);
                            worker_heaps[j + q_off].insert(score, (i + db_off) as ExternalId);
                        }
                    }
                });
        })?;

        let done = if db.is_blocked() {
            !db.advance()?
        } else if q.is_blocked() {
            !q.advance()?
        } else {
            true
        };
        if done {
            break;
        }
    }

    // Sequential merge in worker order, then extraction.
    let mut merged = heaps.remove(0);
    for worker_heaps in heaps {
        for (j, heap) in worker_heaps.into_iter().enumerate() {
            merged[j].merge(heap);
        }
    }
    let per_query: Vec<Vec<(Score, ExternalId)>> =
        merged.into_iter().map(|h| h.into_sorted_vec()).collect();

    Ok(assemble_top_k(per_query, k))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flat::qv_query;
    use crate::matrix::StreamingMatrix;
    use crate::storage::{self, FsStore};
    use tempfile::TempDir;

    fn random_matrix(rows: usize, cols: usize, seed: u64) -> ColMajorMatrix<f32> {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..rows * cols).map(|_| rng.gen_range(-1.0..1.0)).collect();
        ColMajorMatrix::from_vec(rows, cols, data)
    }

    #[test]
    fn test_vq_matches_qv_in_memory() {
        let db = random_matrix(8, 50, 1);
        let q = random_matrix(8, 7, 2);
        let (qs, qi) = qv_query(&db, &q, 5, false, 1).unwrap();

        let mut db2 = db.clone();
        let mut q2 = q.clone();
        let (vs, vi) = vq_query_heap(&mut db2, &mut q2, 5, 3).unwrap();

        for j in 0..7 {
            assert_eq!(qi.col(j), vi.col(j));
            for s in 0..5 {
                assert!((qs.col(j)[s] - vs.col(j)[s]).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_vq_streaming_db() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path()).unwrap();
        let db = random_matrix(4, 33, 3);
        storage::write_matrix(&store, "db", &db).unwrap();

        let q = random_matrix(4, 5, 4);
        let (qs, qi) = qv_query(&db, &q, 4, false, 1).unwrap();

        let mut streamed = StreamingMatrix::<f32>::open(&store, "db", 10).unwrap();
        let mut q2 = q.clone();
        let (vs, vi) = vq_query_heap(&mut streamed, &mut q2, 4, 2).unwrap();

        for j in 0..5 {
            assert_eq!(qi.col(j), vi.col(j));
            for s in 0..4 {
                assert!((qs.col(j)[s] - vs.col(j)[s]).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_vq_streaming_queries() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path()).unwrap();
        let q = random_matrix(4, 9, 5);
        storage::write_matrix(&store, "q", &q).unwrap();

        let db = random_matrix(4, 20, 6);
        let (_, qi) = qv_query(&db, &q, 3, false, 1).unwrap();

        let mut db2 = db.clone();
        let mut streamed_q = StreamingMatrix::<f32>::open(&store, "q", 4).unwrap();
        let (_, vi) = vq_query_heap(&mut db2, &mut streamed_q, 3, 2).unwrap();

        for j in 0..9 {
            assert_eq!(qi.col(j), vi.col(j));
        }
    }

    #[test]
    fn test_both_blocked_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path()).unwrap();
        let m = random_matrix(2, 6, 7);
        storage::write_matrix(&store, "a", &m).unwrap();
        storage::write_matrix(&store, "b", &m).unwrap();

        let mut a = StreamingMatrix::<f32>::open(&store, "a", 2).unwrap();
        let mut b = StreamingMatrix::<f32>::open(&store, "b", 2).unwrap();
        assert!(matches!(
            vq_query_heap(&mut a, &mut b, 2, 1),
            Err(Error::BothBlocked)
        ));
    }
}
