//! Lloyd's k-means trainer with random and k-means++ seeding.
//!
//! Centroids accumulate in f32 regardless of the training element type.
//! The assignment step reuses the qv partitioning primitive, parallel over
//! the training vectors.

use crate::error::{Error, Result};
use crate::flat::qv_partition;
use crate::matrix::{ColMajorMatrix, ColumnMajor};
use crate::scoring::l2_squared;
use crate::types::FeatureElement;
use crate::utils::with_threads;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::debug;

/// Centroid seeding strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KMeansInit {
    /// Sample nlist training columns uniformly with replacement.
    Random,
    /// k-means++: subsequent centroids sampled proportional to squared
    /// distance from the nearest already-chosen centroid.
    #[default]
    KMeansPlusPlus,
    /// Centroids were supplied through [`KMeans::set_centroids`].
    None,
}

/// Lloyd's algorithm over a column-major training set.
pub struct KMeans {
    dimension: usize,
    nlist: usize,
    max_iters: usize,
    /// Convergence tolerance. Carried for callers that inspect it; the
    /// trainer runs exactly `max_iters` iterations without short-circuit.
    tolerance: f64,
    nthreads: usize,
    rng: StdRng,
    centroids: ColMajorMatrix<f32>,
    initialized: bool,
}

impl KMeans {
    pub fn new(
        dimension: usize,
        nlist: usize,
        max_iters: usize,
        tolerance: f64,
        nthreads: usize,
        seed: u64,
    ) -> Result<Self> {
        if dimension == 0 || nlist == 0 {
            return Err(Error::InvalidParameter(
                "dimension and nlist must be nonzero".to_string(),
            ));
        }
        Ok(Self {
            dimension,
            nlist,
            max_iters,
            tolerance,
            nthreads,
            rng: StdRng::seed_from_u64(seed),
            centroids: ColMajorMatrix::new(dimension, nlist),
            initialized: false,
        })
    }

    pub fn nlist(&self) -> usize {
        self.nlist
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// The current D x nlist centroid matrix.
    pub fn centroids(&self) -> &ColMajorMatrix<f32> {
        &self.centroids
    }

    /// Consume the trainer, yielding the centroid matrix.
    pub fn into_centroids(self) -> ColMajorMatrix<f32> {
        self.centroids
    }

    /// Install externally trained centroids (for [`KMeansInit::None`]).
    pub fn set_centroids(&mut self, centroids: ColMajorMatrix<f32>) -> Result<()> {
        if centroids.num_rows() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                got: centroids.num_rows(),
            });
        }
        if centroids.num_cols() != self.nlist {
            return Err(Error::InvalidParameter(format!(
                "expected {} centroids, got {}",
                self.nlist,
                centroids.num_cols()
            )));
        }
        self.centroids = centroids;
        self.initialized = true;
        Ok(())
    }

    /// Seed centroids by uniform sampling (with replacement).
    pub fn random_init<T, M>(&mut self, training_set: &M) -> Result<()>
    where
        T: FeatureElement,
        M: ColumnMajor<T>,
    {
        self.check_training(training_set)?;
        let n = training_set.num_cols();
        for i in 0..self.nlist {
            let choice = self.rng.gen_range(0..n);
            copy_column(training_set, choice, self.centroids.col_mut(i));
        }
        self.initialized = true;
        Ok(())
    }

    /// Seed centroids with the k-means++ procedure.
    ///
    /// A chosen point's weight drops to zero so it cannot be chosen twice.
    pub fn kmeans_pp<T, M>(&mut self, training_set: &M) -> Result<()>
    where
        T: FeatureElement,
        M: ColumnMajor<T>,
    {
        self.check_training(training_set)?;
        let n = training_set.num_cols();

        let choice = self.rng.gen_range(0..n);
        copy_column(training_set, choice, self.centroids.col_mut(0));

        let mut distances = vec![f64::MAX / 8.0; n];
        distances[choice] = 0.0;

        for i in 1..self.nlist {
            // The newest centroid is the only one that can lower D(x).
            let newest = self.centroids.col(i - 1).to_vec();
            with_threads(self.nthreads, || {
                distances.par_iter_mut().enumerate().for_each(|(j, d)| {
                    let score = l2_squared(training_set.col(j), &newest) as f64;
                    if score < *d {
                        *d = score;
                    }
                });
            })?;

            let total: f64 = distances.iter().sum();
            let next = if total > 0.0 {
                let threshold = self.rng.gen::<f64>() * total;
                let mut cumulative = 0.0;
                let mut picked = n - 1;
                for (j, &d) in distances.iter().enumerate() {
                    cumulative += d;
                    if cumulative >= threshold {
                        picked = j;
                        break;
                    }
                }
                picked
            } else {
                // Every candidate is at distance zero; fall back to uniform.
                self.rng.gen_range(0..n)
            };

            copy_column(training_set, next, self.centroids.col_mut(i));
            distances[next] = 0.0;
        }
        self.initialized = true;
        Ok(())
    }

    /// Lloyd iterations over already-seeded centroids.
    ///
    /// Runs exactly `max_iters` iterations. An empty partition is left at
    /// its zero accumulator for that iteration (no re-seeding).
    pub fn train_no_init<T, M>(&mut self, training_set: &M) -> Result<()>
    where
        T: FeatureElement,
        M: ColumnMajor<T>,
    {
        self.check_training(training_set)?;
        if !self.initialized {
            return Err(Error::InvalidParameter(
                "centroids not initialized; seed them or call set_centroids".to_string(),
            ));
        }

        let n = training_set.num_cols();
        let mut degrees = vec![0usize; self.nlist];

        for iter in 0..self.max_iters {
            let parts = qv_partition(&self.centroids, training_set, self.nthreads)?;

            self.centroids.data_mut().fill(0.0);
            degrees.fill(0);

            for (i, &part) in parts.iter().enumerate().take(n) {
                let centroid = self.centroids.col_mut(part);
                for (c, x) in centroid.iter_mut().zip(training_set.col(i)) {
                    *c += x.to_f32();
                }
                degrees[part] += 1;
            }

            for (j, &degree) in degrees.iter().enumerate() {
                if degree != 0 {
                    let centroid = self.centroids.col_mut(j);
                    for c in centroid.iter_mut() {
                        *c /= degree as f32;
                    }
                }
            }

            let min = degrees.iter().min().copied().unwrap_or(0);
            let max = degrees.iter().max().copied().unwrap_or(0);
            debug!(
                iter,
                avg = n as f64 / self.nlist as f64,
                min,
                max,
                empty = degrees.iter().filter(|&&d| d == 0).count(),
                "kmeans iteration"
            );
        }
        Ok(())
    }

    /// Seed (per `init`) and run Lloyd iterations.
    pub fn train<T, M>(&mut self, training_set: &M, init: KMeansInit) -> Result<()>
    where
        T: FeatureElement,
        M: ColumnMajor<T>,
    {
        match init {
            KMeansInit::Random => self.random_init(training_set)?,
            KMeansInit::KMeansPlusPlus => self.kmeans_pp(training_set)?,
            KMeansInit::None => {
                if !self.initialized {
                    return Err(Error::InvalidParameter(
                        "init = none requires set_centroids".to_string(),
                    ));
                }
            }
        }
        self.train_no_init(training_set)
    }

    fn check_training<T, M>(&self, training_set: &M) -> Result<()>
    where
        T: FeatureElement,
        M: ColumnMajor<T>,
    {
        if training_set.num_rows() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                got: training_set.num_rows(),
            });
        }
        if training_set.num_cols() == 0 {
            return Err(Error::InvalidParameter(
                "empty training set".to_string(),
            ));
        }
        Ok(())
    }
}

fn copy_column<T, M>(m: &M, j: usize, dst: &mut [f32])
where
    T: FeatureElement,
    M: ColumnMajor<T>,
{
    for (d, s) in dst.iter_mut().zip(m.col(j)) {
        *d = s.to_f32();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The 4 x 8 training set exercised by the seeding tests.
    fn training_data() -> ColMajorMatrix<f32> {
        ColMajorMatrix::from_vec(
            4,
            8,
            vec![
                8.0, 6.0, 7.0, 5.0, 3.0, 3.0, 7.0, 2.0, 1.0, 4.0, 1.0, 3.0, 0.0, 5.0, 1.0, 2.0,
                9.0, 9.0, 5.0, 9.0, 2.0, 0.0, 2.0, 7.0, 7.0, 9.0, 8.0, 6.0, 7.0, 9.0, 6.0, 6.0,
            ],
        )
    }

    fn is_training_column(centroid: &[f32], training: &ColMajorMatrix<f32>) -> usize {
        (0..training.num_cols())
            .filter(|&j| training.col(j) == centroid)
            .count()
    }

    #[test]
    fn test_kmeans_pp_picks_distinct_training_columns() {
        let training = training_data();
        let mut km = KMeans::new(4, 3, 10, 1e-4, 1, 42).unwrap();
        km.kmeans_pp(&training).unwrap();

        let centroids = km.centroids();
        assert_eq!(centroids.num_rows(), 4);
        assert_eq!(centroids.num_cols(), 3);

        // Every centroid is a training column, and no column repeats.
        for i in 0..3 {
            assert_eq!(is_training_column(centroids.col(i), &training), 1);
        }
        for i in 0..2 {
            for j in (i + 1)..3 {
                assert_ne!(centroids.col(i), centroids.col(j));
            }
        }
    }

    #[test]
    fn test_random_init_copies_training_columns() {
        let training = training_data();
        let mut km = KMeans::new(4, 3, 10, 1e-4, 1, 7).unwrap();
        km.random_init(&training).unwrap();

        for i in 0..3 {
            assert_eq!(is_training_column(km.centroids().col(i), &training), 1);
        }
    }

    #[test]
    fn test_train_converges_to_separated_clusters() {
        // Two tight clusters far apart; starting from off-center seeds the
        // trained centroids must land on the cluster means.
        let training = ColMajorMatrix::from_vec(
            2,
            6,
            vec![
                0.0, 0.0, 0.1, 0.0, 0.0, 0.1, 10.0, 10.0, 10.1, 10.0, 10.0, 10.1,
            ],
        );
        let mut km = KMeans::new(2, 2, 10, 1e-4, 1, 3).unwrap();
        km.set_centroids(ColMajorMatrix::from_columns(&[
            &[1.0f32, 1.0],
            &[8.0, 9.0],
        ]))
        .unwrap();
        km.train(&training, KMeansInit::None).unwrap();

        let mut near_origin = 0;
        let mut near_ten = 0;
        for i in 0..2 {
            let c = km.centroids().col(i);
            if l2_squared(c, &[0.0f32, 0.0]) < 1.0 {
                near_origin += 1;
            }
            if l2_squared(c, &[10.0f32, 10.0]) < 1.0 {
                near_ten += 1;
            }
        }
        assert_eq!(near_origin, 1);
        assert_eq!(near_ten, 1);
    }

    #[test]
    fn test_seeded_runs_reproduce() {
        let training = training_data();
        let centroids = |seed: u64| {
            let mut km = KMeans::new(4, 3, 5, 1e-4, 1, seed).unwrap();
            km.train(&training, KMeansInit::KMeansPlusPlus).unwrap();
            km.into_centroids()
        };
        assert_eq!(centroids(9).data(), centroids(9).data());
    }

    #[test]
    fn test_external_centroids_one_iteration() {
        // sklearn cross-check data: one Lloyd iteration from the reference
        // centroids must keep them near their fixed point.
        let training = ColMajorMatrix::from_columns(&[
            &[1.0573647f32, 5.082087],
            &[-6.229642, -1.3590931],
            &[0.7446737, 6.3828287],
            &[-7.698864, -3.0493321],
            &[2.1362762, -4.4448104],
            &[1.04019, -4.0389647],
            &[0.38996044, 5.7235265],
            &[1.7470839, -4.717076],
        ]);
        let reference = ColMajorMatrix::from_columns(&[
            &[-6.964253f32, -2.2042127],
            &[1.6411834, -4.400284],
            &[0.7306664, 5.7294807],
        ]);

        let mut km = KMeans::new(2, 3, 1, 1e-4, 1, 0).unwrap();
        km.set_centroids(reference.clone()).unwrap();
        km.train(&training, KMeansInit::None).unwrap();

        for i in 0..3 {
            assert!(l2_squared(km.centroids().col(i), reference.col(i)) < 1e-6);
        }
    }

    #[test]
    fn test_init_none_without_centroids() {
        let training = training_data();
        let mut km = KMeans::new(4, 3, 1, 1e-4, 1, 0).unwrap();
        assert!(matches!(
            km.train(&training, KMeansInit::None),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_empty_cluster_left_at_zero() {
        // Two identical points, three centroids: at least one partition is
        // empty every iteration and its centroid stays at the zero sum.
        let training = ColMajorMatrix::from_vec(1, 2, vec![5.0f32, 5.0]);
        let mut km = KMeans::new(1, 3, 2, 1e-4, 1, 1).unwrap();
        km.train(&training, KMeansInit::Random).unwrap();

        let zeros = (0..3)
            .filter(|&i| km.centroids().col(i) == [0.0f32])
            .count();
        assert!(zeros >= 1);
    }

    #[test]
    fn test_dimension_mismatch() {
        let training = ColMajorMatrix::<f32>::new(3, 4);
        let mut km = KMeans::new(4, 2, 1, 1e-4, 1, 0).unwrap();
        assert!(matches!(
            km.kmeans_pp(&training),
            Err(Error::DimensionMismatch { .. })
        ));
    }
}
