//! Recall reporting against ground truth.

use crate::matrix::ColMajorMatrix;
use crate::types::{ExternalId, INVALID_ID};

/// R@k: mean size of the intersection between each result column and the
/// corresponding ground-truth column, over `k * nqueries`.
///
/// Rows are sorted (set semantics) before intersecting, so kernels that
/// break distance ties differently still score identically. `INVALID_ID`
/// padding never matches.
pub fn recall_at_k(
    results: &ColMajorMatrix<ExternalId>,
    groundtruth: &ColMajorMatrix<ExternalId>,
    k: usize,
) -> f64 {
    let nq = results.num_cols();
    assert_eq!(
        nq,
        groundtruth.num_cols(),
        "result and ground-truth query counts differ"
    );
    if nq == 0 || k == 0 {
        return 0.0;
    }

    let mut intersected = 0usize;
    for j in 0..nq {
        let mut got: Vec<ExternalId> = results
            .col(j)
            .iter()
            .take(k)
            .copied()
            .filter(|&id| id != INVALID_ID)
            .collect();
        let mut truth: Vec<ExternalId> = groundtruth
            .col(j)
            .iter()
            .take(k)
            .copied()
            .filter(|&id| id != INVALID_ID)
            .collect();
        got.sort_unstable();
        truth.sort_unstable();

        let (mut a, mut b) = (0usize, 0usize);
        while a < got.len() && b < truth.len() {
            match got[a].cmp(&truth[b]) {
                std::cmp::Ordering::Less => a += 1,
                std::cmp::Ordering::Greater => b += 1,
                std::cmp::Ordering::Equal => {
                    intersected += 1;
                    a += 1;
                    b += 1;
                }
            }
        }
    }
    intersected as f64 / (k * nq) as f64
}
