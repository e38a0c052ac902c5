//! IVF-Flat query execution: infinite-RAM and finite-RAM modes.
//!
//! Both modes probe the same partitions and return the same id sets up to
//! ties on score; they differ only in how the shuffled vectors reach the
//! scoring loop. Finite-RAM execution bounds resident memory by centroids
//! + offsets + ids + one block of the shuffled matrix + per-query heaps.

use crate::error::{Error, Result};
use crate::flat::{self, qv_query};
use crate::ivf::IvfFlatIndex;
use crate::matrix::{ColMajorMatrix, ColumnMajor, StreamingMatrix};
use crate::scoring::l2_squared;
use crate::storage::ArrayStore;
use crate::types::{ExternalId, FeatureElement, Score};
use crate::utils::{with_threads, FixedMinHeap};
use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::debug;

impl<T: FeatureElement> IvfFlatIndex<T> {
    /// Exact top-k inside the probed partitions, whole index resident.
    ///
    /// For each query: find the top-`nprobe` centroids, materialize the
    /// union of those partitions into a contiguous scratch matrix with a
    /// parallel id slab, brute-force the scratch, and translate back to
    /// external ids.
    pub fn query_infinite_ram<Q: ColumnMajor<T>>(
        &self,
        q: &Q,
        k: usize,
        nprobe: usize,
    ) -> Result<(ColMajorMatrix<Score>, ColMajorMatrix<ExternalId>)> {
        let shuffled_db = self.shuffled_db().ok_or_else(|| {
            Error::InvalidParameter(
                "index opened in finite-RAM mode; use query_finite_ram".to_string(),
            )
        })?;
        let probed = self.probe_centroids(q, nprobe)?;
        let nq = q.num_cols();

        let per_query: Vec<Vec<(Score, ExternalId)>> = with_threads(self.nthreads(), || {
            (0..nq)
                .into_par_iter()
                .map(|j| {
                    let partitions: Vec<usize> =
                        probed.col(j).iter().map(|&p| p as usize).collect();

                    // Gather the probed partitions into contiguous scratch.
                    let total: usize = partitions
                        .iter()
                        .map(|&p| (self.indices()[p + 1] - self.indices()[p]) as usize)
                        .sum();
                    let mut all_results = ColMajorMatrix::<T>::new(self.dimension(), total);
                    let mut all_ids = vec![0 as ExternalId; total];
                    let mut ctr = 0usize;
                    for &p in &partitions {
                        let start = self.indices()[p] as usize;
                        let stop = self.indices()[p + 1] as usize;
                        for i in start..stop {
                            all_results.col_mut(ctr).copy_from_slice(shuffled_db.col(i));
                            all_ids[ctr] = self.shuffled_ids()[i];
                            ctr += 1;
                        }
                    }

                    let query = q.col(j);
                    let mut heap = FixedMinHeap::new(k);
                    for i in 0..total {
                        heap.insert(l2_squared(all_results.col(i), query), i as u64);
                    }
                    heap.into_sorted_vec()
                        .into_iter()
                        .map(|(score, i)| (score, all_ids[i as usize]))
                        .collect()
                })
                .collect()
        })?;

        Ok(flat::assemble_top_k(per_query, k))
    }

    /// Exact top-k inside the probed partitions with bounded memory.
    ///
    /// The shuffled matrix streams from the array store in `blocksize`
    /// column blocks; each block only feeds the (query, partition) ranges
    /// that overlap it, updating per-query heaps in place.
    pub fn query_finite_ram<Q: ColumnMajor<T>>(
        &self,
        store: &dyn ArrayStore,
        q: &Q,
        k: usize,
        nprobe: usize,
        blocksize: usize,
    ) -> Result<(ColMajorMatrix<Score>, ColMajorMatrix<ExternalId>)> {
        let parts_member = self.parts_member().ok_or_else(|| {
            Error::InvalidParameter(
                "index was not opened from a group; finite-RAM query needs stored vectors"
                    .to_string(),
            )
        })?;
        let probed = self.probe_centroids(q, nprobe)?;
        let nq = q.num_cols();

        // Invert the probe lists: which queries probe partition p.
        let mut active_queries: Vec<Vec<usize>> = vec![Vec::new(); self.nlist()];
        for j in 0..nq {
            for &p in probed.col(j) {
                active_queries[p as usize].push(j);
            }
        }

        let heaps: Vec<Mutex<FixedMinHeap<ExternalId>>> =
            (0..nq).map(|_| Mutex::new(FixedMinHeap::new(k))).collect();

        let mut stream = StreamingMatrix::<T>::open(store, parts_member, blocksize)?;
        loop {
            let block_start = stream.offset();
            let block_stop = block_start + stream.num_cols();

            // (query, column range) pairs overlapping this block.
            let mut work: Vec<(usize, usize, usize)> = Vec::new();
            for (p, queries) in active_queries.iter().enumerate() {
                if queries.is_empty() {
                    continue;
                }
                let lo = (self.indices()[p] as usize).max(block_start);
                let hi = (self.indices()[p + 1] as usize).min(block_stop);
                if lo >= hi {
                    continue;
                }
                for &j in queries {
                    work.push((j, lo, hi));
                }
            }
            debug!(
                block_start,
                block_stop,
                pairs = work.len(),
                "finite-ram block"
            );

            let stream_ref = &stream;
            with_threads(self.nthreads(), || {
                work.par_iter().for_each(|&(j, lo, hi)| {
                    let query = q.col(j);
                    let mut heap = heaps[j].lock();
                    for i in lo..hi {
                        let score = l2_squared(stream_ref.col(i - block_start), query);
                        heap.insert(score, self.shuffled_ids()[i]);
                    }
                });
            })?;

            if !stream.advance()? {
                break;
            }
        }

        let per_query: Vec<Vec<(Score, ExternalId)>> = heaps
            .into_iter()
            .map(|h| h.into_inner().into_sorted_vec())
            .collect();
        Ok(flat::assemble_top_k(per_query, k))
    }

    /// Top-`nprobe` centroid ids per query, nprobe clamped to nlist.
    fn probe_centroids<Q: ColumnMajor<T>>(
        &self,
        q: &Q,
        nprobe: usize,
    ) -> Result<ColMajorMatrix<ExternalId>> {
        if q.is_blocked() {
            return Err(Error::InvalidParameter(
                "query set must be resident".to_string(),
            ));
        }
        if q.num_rows() != self.dimension() {
            return Err(Error::DimensionMismatch {
                expected: self.dimension(),
                got: q.num_rows(),
            });
        }
        let nprobe = nprobe.clamp(1, self.nlist());
        let (_, probed) = qv_query(self.centroids(), q, nprobe, false, self.nthreads())?;
        Ok(probed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ivf::IvfFlatParams;
    use crate::kmeans::KMeansInit;
    use crate::storage::FsStore;
    use crate::types::INVALID_ID;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use tempfile::TempDir;

    fn random_db(dim: usize, n: usize, seed: u64) -> ColMajorMatrix<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..dim * n).map(|_| rng.gen_range(0.0..1.0)).collect();
        ColMajorMatrix::from_vec(dim, n, data)
    }

    fn build(db: &ColMajorMatrix<f32>, nlist: usize) -> IvfFlatIndex<f32> {
        let mut index = IvfFlatIndex::new(
            db.num_rows(),
            IvfFlatParams::new(nlist).with_max_iters(4).with_seed(2),
        )
        .unwrap();
        index.train(db, KMeansInit::KMeansPlusPlus).unwrap();
        index.add(db, None).unwrap();
        index
    }

    #[test]
    fn test_full_probe_matches_brute_force() {
        let db = random_db(6, 80, 21);
        let q = random_db(6, 5, 22);
        let index = build(&db, 4);

        // Probing every partition makes the search exact.
        let (_, ivf_ids) = index.query_infinite_ram(&q, 3, 4).unwrap();
        let (_, flat_ids) = qv_query(&db, &q, 3, false, 1).unwrap();
        for j in 0..5 {
            assert_eq!(ivf_ids.col(j), flat_ids.col(j));
        }
    }

    #[test]
    fn test_single_partition_is_exact() {
        let db = random_db(4, 8, 31);
        let q = random_db(4, 2, 32);
        let index = build(&db, 1);
        assert_eq!(index.indices(), &[0, 8]);

        let (ivf_s, ivf_ids) = index.query_infinite_ram(&q, 4, 1).unwrap();
        let (flat_s, flat_ids) = qv_query(&db, &q, 4, false, 1).unwrap();
        for j in 0..2 {
            assert_eq!(ivf_ids.col(j), flat_ids.col(j));
            for s in 0..4 {
                assert!((ivf_s.col(j)[s] - flat_s.col(j)[s]).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_nprobe_clamped() {
        let db = random_db(4, 30, 41);
        let q = random_db(4, 2, 42);
        let index = build(&db, 3);

        let (_, a) = index.query_infinite_ram(&q, 5, 3).unwrap();
        let (_, b) = index.query_infinite_ram(&q, 5, 50).unwrap();
        for j in 0..2 {
            assert_eq!(a.col(j), b.col(j));
        }
    }

    #[test]
    fn test_finite_matches_infinite() {
        let db = random_db(8, 120, 51);
        let q = random_db(8, 6, 52);
        let index = build(&db, 5);

        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path()).unwrap();
        index.write(&store, "ivf").unwrap();
        let finite = IvfFlatIndex::<f32>::open_finite(&store, "ivf").unwrap();

        let (inf_s, inf_ids) = index.query_infinite_ram(&q, 4, 2).unwrap();
        for blocksize in [1, 7, 50, 1000] {
            let (fin_s, fin_ids) = finite
                .query_finite_ram(&store, &q, 4, 2, blocksize)
                .unwrap();
            for j in 0..6 {
                assert_eq!(inf_ids.col(j), fin_ids.col(j), "blocksize {blocksize}");
                for s in 0..4 {
                    assert!((inf_s.col(j)[s] - fin_s.col(j)[s]).abs() < 1e-5);
                }
            }
        }
    }

    #[test]
    fn test_finite_mode_rejects_in_memory_only_index() {
        let db = random_db(4, 10, 61);
        let index = build(&db, 2);
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path()).unwrap();
        let q = random_db(4, 1, 62);
        assert!(matches!(
            index.query_finite_ram(&store, &q, 2, 1, 4),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_query_dimension_mismatch() {
        let db = random_db(4, 10, 71);
        let index = build(&db, 2);
        let q = random_db(3, 1, 72);
        assert!(matches!(
            index.query_infinite_ram(&q, 2, 1),
            Err(Error::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_empty_query_set() {
        let db = random_db(4, 10, 81);
        let index = build(&db, 2);
        let q = ColMajorMatrix::<f32>::new(4, 0);
        let (scores, ids) = index.query_infinite_ram(&q, 2, 1).unwrap();
        assert_eq!(scores.num_cols(), 0);
        assert_eq!(ids.num_cols(), 0);
    }

    #[test]
    fn test_narrow_probe_pads_when_partition_small() {
        // One tight cluster plus one outlier: probing a single partition
        // can surface fewer than k candidates.
        let db = ColMajorMatrix::from_columns(&[
            &[0.0f32, 0.0],
            &[0.1, 0.0],
            &[0.0, 0.1],
            &[100.0, 100.0],
        ]);
        let mut index = IvfFlatIndex::new(
            2,
            IvfFlatParams::new(2).with_max_iters(4).with_seed(5),
        )
        .unwrap();
        index.train(&db, KMeansInit::KMeansPlusPlus).unwrap();
        index.add(&db, None).unwrap();

        let q = ColMajorMatrix::from_columns(&[&[99.0f32, 99.0]]);
        let (_, ids) = index.query_infinite_ram(&q, 3, 1).unwrap();
        assert_eq!(ids.col(0)[0], 3);
        // The outlier partition holds a single vector.
        assert_eq!(ids.col(0)[1], INVALID_ID);
        assert_eq!(ids.col(0)[2], INVALID_ID);
    }
}
