//! Distance kernels and column reductions.
//!
//! Everything ranks by squared Euclidean distance; the square root is taken
//! only by the gemm query variant, which needs the expanded identity
//! `||a - b||^2 = ||a||^2 + ||b||^2 - 2 a.b`.

use crate::error::{Error, Result};
use crate::matrix::ColumnMajor;
use crate::types::{FeatureElement, Score};

/// Distance metrics. Only `L2` is implemented; `Cosine` is reserved and
/// rejected at index construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Metric {
    #[default]
    L2,
    Cosine,
}

impl Metric {
    /// Fail unless the metric is implemented.
    pub fn require_supported(self) -> Result<()> {
        match self {
            Metric::L2 => Ok(()),
            Metric::Cosine => Err(Error::UnsupportedMetric("cosine")),
        }
    }
}

/// Squared Euclidean distance between two equal-length vectors.
///
/// Elements may differ in storage type (e.g. u8 database columns against
/// f32 centroids); both are promoted to f32 on the fly.
#[inline]
pub fn l2_squared<A: FeatureElement, B: FeatureElement>(a: &[A], b: &[B]) -> Score {
    debug_assert_eq!(a.len(), b.len());
    let mut sum = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        let d = x.to_f32() - y.to_f32();
        sum += d * d;
    }
    sum
}

/// Sum of squared elements.
#[inline]
pub fn sum_of_squares<T: FeatureElement>(v: &[T]) -> Score {
    let mut sum = 0.0f32;
    for x in v {
        let f = x.to_f32();
        sum += f * f;
    }
    sum
}

/// Per-column squared norms of a column set.
pub fn col_squared_norms<T: FeatureElement, M: ColumnMajor<T>>(m: &M) -> Vec<Score> {
    (0..m.num_cols()).map(|j| sum_of_squares(m.col(j))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::ColMajorMatrix;

    #[test]
    fn test_l2_squared_basic() {
        let a = [1.0f32, 2.0, 3.0];
        let b = [1.0f32, 0.0, 0.0];
        assert_eq!(l2_squared(&a, &b), 4.0 + 9.0);
    }

    #[test]
    fn test_l2_squared_identical() {
        let a = [0.5f32, -0.5, 2.0];
        assert_eq!(l2_squared(&a, &a), 0.0);
    }

    #[test]
    fn test_l2_squared_mixed_types() {
        let a: [u8; 3] = [3, 0, 4];
        let b = [0.0f32, 0.0, 0.0];
        assert_eq!(l2_squared(&a, &b), 25.0);
    }

    #[test]
    fn test_sum_of_squares() {
        assert_eq!(sum_of_squares(&[3.0f32, 4.0]), 25.0);
        assert_eq!(sum_of_squares::<f32>(&[]), 0.0);
    }

    #[test]
    fn test_col_squared_norms() {
        let m = ColMajorMatrix::from_vec(2, 3, vec![1.0f32, 0.0, 0.0, 2.0, 3.0, 4.0]);
        assert_eq!(col_squared_norms(&m), vec![1.0, 4.0, 25.0]);
    }

    #[test]
    fn test_metric_support() {
        assert!(Metric::L2.require_supported().is_ok());
        assert!(matches!(
            Metric::Cosine.require_supported(),
            Err(Error::UnsupportedMetric(_))
        ));
    }
}
