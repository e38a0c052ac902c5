//! gemm kernel: score matrix through a matrix product.
//!
//! Materializes the full N x Q score matrix with `-2 * D^T Q`, corrects by
//! the column norms of both operands (the expansion of
//! `||a - b||^2 = ||a||^2 + ||b||^2 - 2 a.b`), takes the element-wise square
//! root, and selects top-k per column. Reported scores are re-squared so all
//! three kernels emit the same squared-L2 scale.

use crate::error::{Error, Result};
use crate::flat::assemble_top_k;
use crate::matrix::{ColMajorMatrix, ColumnMajor};
use crate::scoring::col_squared_norms;
use crate::types::{ExternalId, FeatureElement, Score};
use crate::utils::{top_k_nth, with_threads, FixedMinHeap};
use ndarray::{ArrayView2, ArrayViewMut2, ShapeBuilder};
use num_traits::Float;
use rayon::prelude::*;

/// Exact top-k through the matrix-product score path.
pub fn gemm_query<A, B, D, Q>(
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
    if db.is_blocked() || q.is_blocked() {
        return Err(Error::InvalidParameter(
            "gemm kernel requires in-memory operands".to_string(),
        ));
    }
    if db.num_rows() != q.num_rows() {
        return Err(Error::DimensionMismatch {
            expected: db.num_rows(),
            got: q.num_rows(),
        });
    }

    let d = db.num_rows();
    let n = db.num_cols();
    let nq = q.num_cols();

    let db_f = promote(db);
    let q_f = promote(q);

    let db_norms = col_squared_norms(&db_f);
    let q_norms = col_squared_norms(&q_f);

    // scores = -2 * D^T Q, computed in place on the output buffer.
    let mut scores = ColMajorMatrix::<f32>::new(n, nq);
    {
        let a = ArrayView2::from_shape((d, n).f(), db_f.data()).expect("db shape matches buffer");
        let b = ArrayView2::from_shape((d, nq).f(), q_f.data()).expect("query shape matches buffer");
        let mut c = ArrayViewMut2::from_shape((n, nq).f(), scores.data_mut())
            .expect("score shape matches buffer");
        ndarray::linalg::general_mat_mul(-2.0, &a.t(), &b, 0.0, &mut c);
    }

    let per_query: Vec<Vec<(Score, ExternalId)>> = with_threads(nthreads, || {
        (0..nq)
            .into_par_iter()
            .map(|j| {
                let col = scores.col(j);
                let distances: Vec<Score> = (0..n)
                    .map(|i| {
                        let s = (col[i] + db_norms[i] + q_norms[j]).max(0.0);
                        Float::sqrt(s)
                    })
                    .collect();
                let selected: Vec<(Score, ExternalId)> = if nth {
                    top_k_nth(&distances, k)
                        .into_iter()
                        .map(|i| (distances[i], i as ExternalId))
                        .collect()
                } else {
                    let mut heap = FixedMinHeap::new(k);
                    for (i, &dist) in distances.iter().enumerate() {
                        heap.insert(dist, i as ExternalId);
                    }
                    heap.into_sorted_vec()
                };
                selected.into_iter().map(|(s, i)| (s * s, i)).collect()
            })
            .collect()
    })?;

    Ok(assemble_top_k(per_query, k))
}

fn promote<T: FeatureElement, M: ColumnMajor<T>>(m: &M) -> ColMajorMatrix<f32> {
    let mut out = ColMajorMatrix::<f32>::new(m.num_rows(), m.num_cols());
    for j in 0..m.num_cols() {
        let dst = out.col_mut(j);
        for (d, s) in dst.iter_mut().zip(m.col(j)) {
            *d = s.to_f32();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flat::qv_query;

    fn random_matrix(rows: usize, cols: usize, seed: u64) -> ColMajorMatrix<f32> {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..rows * cols).map(|_| rng.gen_range(-1.0..1.0)).collect();
        ColMajorMatrix::from_vec(rows, cols, data)
    }

    #[test]
    fn test_gemm_matches_qv() {
        let db = random_matrix(16, 40, 11);
        let q = random_matrix(16, 6, 12);

        let (qs, qi) = qv_query(&db, &q, 5, false, 1).unwrap();
        let (gs, gi) = gemm_query(&db, &q, 5, false, 2).unwrap();

        for j in 0..6 {
            assert_eq!(qi.col(j), gi.col(j));
            for s in 0..5 {
                assert!(
                    (qs.col(j)[s] - gs.col(j)[s]).abs() < 1e-3,
                    "score drift at ({j}, {s})"
                );
            }
        }
    }

    #[test]
    fn test_gemm_nth_path() {
        let db = random_matrix(8, 20, 13);
        let q = random_matrix(8, 3, 14);
        let (_, heap_ids) = gemm_query(&db, &q, 4, false, 1).unwrap();
        let (_, nth_ids) = gemm_query(&db, &q, 4, true, 1).unwrap();
        for j in 0..3 {
            assert_eq!(heap_ids.col(j), nth_ids.col(j));
        }
    }

    #[test]
    fn test_gemm_u8_database() {
        let db = ColMajorMatrix::from_vec(2, 3, vec![0u8, 0, 10, 0, 0, 10]);
        let q = ColMajorMatrix::from_vec(2, 1, vec![9.0f32, 0.0]);
        let (scores, ids) = gemm_query(&db, &q, 1, false, 1).unwrap();
        assert_eq!(ids.col(0)[0], 1);
        assert!((scores.col(0)[0] - 1.0).abs() < 1e-3);
    }
}
