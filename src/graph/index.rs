//! Vamana proximity-graph index.
//!
//! Build runs greedy search + robust prune over the nodes in natural
//! order, then patches backlinks so bidirectional reachability survives
//! the degree bound. Query is truncated best-first search from the medoid.

use crate::error::{Error, Result};
use crate::flat;
use crate::graph::search::{greedy_search, medoid, robust_prune};
use crate::graph::{AdjacencyList, VamanaParams};
use crate::matrix::{ColMajorMatrix, ColumnMajor};
use crate::scoring::l2_squared;
use crate::storage::{
    self, group::vamana_members, ArrayStore, Group, CURRENT_STORAGE_VERSION,
};
use crate::types::{ExternalId, FeatureElement, NodeId, Score};
use crate::utils::with_threads;
use rayon::prelude::*;
use tracing::{debug, info};

/// DiskANN-style graph index over an owned copy of the feature vectors.
pub struct VamanaIndex<T: FeatureElement> {
    feature_vectors: ColMajorMatrix<T>,
    dimension: u64,
    num_vectors: u64,
    l_build: u64,
    r_max_degree: u64,
    b_backtrack: u64,
    alpha_min: f32,
    alpha_max: f32,
    two_pass: bool,
    nthreads: usize,
    graph: AdjacencyList,
    medoid: NodeId,
}

impl<T: FeatureElement> VamanaIndex<T> {
    pub fn new(params: VamanaParams) -> Result<Self> {
        params.metric.require_supported()?;
        if params.l_build == 0 || params.r_max_degree == 0 {
            return Err(Error::InvalidParameter(
                "l_build and r_max_degree must be nonzero".to_string(),
            ));
        }
        let b_backtrack = if params.b_backtrack == 0 {
            params.l_build
        } else {
            params.b_backtrack
        };
        Ok(Self {
            feature_vectors: ColMajorMatrix::new(0, 0),
            dimension: 0,
            num_vectors: 0,
            l_build: params.l_build as u64,
            r_max_degree: params.r_max_degree as u64,
            b_backtrack: b_backtrack as u64,
            alpha_min: params.alpha_min,
            alpha_max: params.alpha_max,
            two_pass: params.two_pass,
            nthreads: params.nthreads,
            graph: AdjacencyList::new(0),
            medoid: 0,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension as usize
    }

    pub fn ntotal(&self) -> usize {
        self.num_vectors as usize
    }

    pub fn l_build(&self) -> usize {
        self.l_build as usize
    }

    pub fn r_max_degree(&self) -> usize {
        self.r_max_degree as usize
    }

    pub fn alpha_max(&self) -> f32 {
        self.alpha_max
    }

    /// Entry node: the vector nearest the centroid of the set.
    pub fn medoid(&self) -> NodeId {
        self.medoid
    }

    pub fn graph(&self) -> &AdjacencyList {
        &self.graph
    }

    pub fn feature_vectors(&self) -> &ColMajorMatrix<T> {
        &self.feature_vectors
    }

    /// Build the graph over a copy of `training_set`.
    ///
    /// One pass at `alpha_max` over the nodes in natural order; a
    /// two-pass build adds a first pass at `alpha_min`. After pruning a
    /// node, its new neighbors receive backlinks, re-pruned when the
    /// degree bound would overflow.
    pub fn train<M: ColumnMajor<T>>(&mut self, training_set: &M) -> Result<()> {
        let n = training_set.num_cols();
        if n > NodeId::MAX as usize {
            return Err(Error::IdOverflow { ntotal: n });
        }

        let dim = training_set.num_rows();
        let mut fv = ColMajorMatrix::<T>::new(dim, n);
        for j in 0..n {
            fv.col_mut(j).copy_from_slice(training_set.col(j));
        }
        self.feature_vectors = fv;
        self.dimension = dim as u64;
        self.num_vectors = n as u64;
        self.graph = AdjacencyList::new(n);

        if n == 0 {
            return Ok(());
        }
        self.medoid = medoid(&self.feature_vectors).expect("nonempty set has a medoid");

        let alphas: Vec<f32> = if self.two_pass {
            vec![self.alpha_min, self.alpha_max]
        } else {
            vec![self.alpha_max]
        };

        let l_build = self.l_build as usize;
        let r_max = self.r_max_degree as usize;

        for alpha in alphas {
            let mut total_visited = 0usize;
            for p in 0..n as NodeId {
                let outcome = greedy_search(
                    &self.graph,
                    &self.feature_vectors,
                    self.medoid,
                    self.feature_vectors.col(p as usize),
                    1,
                    l_build,
                )?;
                total_visited += outcome.visited.len();

                robust_prune(
                    &mut self.graph,
                    &self.feature_vectors,
                    p,
                    outcome.visited,
                    alpha,
                    r_max,
                )?;

                // Backlink pass: every new neighbor j learns about p.
                let neighbors = self.graph.out_edges(p).to_vec();
                for (_, j) in neighbors {
                    if self.graph.out_degree(j) + 1 > r_max {
                        let mut pool: Vec<NodeId> = Vec::with_capacity(r_max + 1);
                        pool.push(p);
                        pool.extend(self.graph.out_edges(j).iter().map(|&(_, q)| q));
                        robust_prune(
                            &mut self.graph,
                            &self.feature_vectors,
                            j,
                            pool,
                            alpha,
                            r_max,
                        )?;
                    } else {
                        let score = l2_squared(
                            self.feature_vectors.col(p as usize),
                            self.feature_vectors.col(j as usize),
                        );
                        self.graph.add_edge(j, p, score)?;
                    }
                }

                if (p + 1) % 1024 == 0 {
                    debug!(node = p + 1, total = n, alpha, "vamana build progress");
                }
            }
            info!(
                alpha,
                total_visited,
                edges = self.graph.num_edges(),
                avg_degree = self.graph.average_degree(),
                max_degree = self.graph.max_degree(),
                "vamana pass complete"
            );
        }
        Ok(())
    }

    /// Top-k for every query column via greedy search from the medoid.
    ///
    /// `opt_l` overrides the search list size (default `l_build`);
    /// `opt_l < k` is a fatal precondition. An empty index returns padded
    /// empty results.
    pub fn query<Q: ColumnMajor<T>>(
        &self,
        q: &Q,
        k: usize,
        opt_l: Option<usize>,
    ) -> Result<(ColMajorMatrix<Score>, ColMajorMatrix<ExternalId>)> {
        if self.num_vectors > 0 && q.num_rows() != self.dimension() {
            return Err(Error::DimensionMismatch {
                expected: self.dimension(),
                got: q.num_rows(),
            });
        }
        let l = opt_l.unwrap_or(self.l_build as usize);
        if l < k {
            return Err(Error::SearchListTooSmall { l, k });
        }

        let nq = q.num_cols();
        let per_query: Vec<Result<Vec<(Score, ExternalId)>>> = with_threads(self.nthreads, || {
            (0..nq)
                .into_par_iter()
                .map(|j| {
                    let outcome = greedy_search(
                        &self.graph,
                        &self.feature_vectors,
                        self.medoid,
                        q.col(j),
                        k,
                        l,
                    )?;
                    Ok(outcome
                        .scores
                        .into_iter()
                        .zip(outcome.ids.into_iter().map(|id| id as ExternalId))
                        .collect())
                })
                .collect()
        })?;
        let per_query = per_query.into_iter().collect::<Result<Vec<_>>>()?;

        Ok(flat::assemble_top_k(per_query, k))
    }

    /// Persist the index as a storage group: feature vectors, the CSR
    /// adjacency arrays, and the hyperparameter metadata record.
    pub fn write_index(&self, store: &dyn ArrayStore, uri: &str) -> Result<()> {
        let mut group = Group::create(store, uri, CURRENT_STORAGE_VERSION);

        storage::write_matrix(
            store,
            &group.member(vamana_members::FEATURE_VECTORS),
            &self.feature_vectors,
        )?;
        let (adj_scores, adj_ids, adj_index) = self.graph.to_csr();
        storage::write_vector(store, &group.member(vamana_members::ADJ_SCORES), &adj_scores)?;
        storage::write_vector(store, &group.member(vamana_members::ADJ_IDS), &adj_ids)?;
        storage::write_vector(store, &group.member(vamana_members::ADJ_INDEX), &adj_index)?;

        let meta = group.metadata_mut();
        meta.put_u64("dimension", self.dimension);
        meta.put_u64("ntotal", self.num_vectors);
        meta.put_u64("L", self.l_build);
        meta.put_u64("R", self.r_max_degree);
        meta.put_u64("B", self.b_backtrack);
        meta.put_f32("alpha_min", self.alpha_min);
        meta.put_f32("alpha_max", self.alpha_max);
        meta.put_u64("medioid", self.medoid as u64);
        group.write_metadata()?;
        info!(uri, ntotal = self.num_vectors, "vamana group written");
        Ok(())
    }

    /// Re-hydrate an index from a storage group.
    pub fn open(store: &dyn ArrayStore, uri: &str) -> Result<Self> {
        let group = Group::open(store, uri)?;
        let meta = group.metadata();

        let dimension = meta.get_u64("dimension")?;
        let num_vectors = meta.get_u64("ntotal")?;

        let feature_vectors =
            storage::read_matrix::<T>(store, &group.member(vamana_members::FEATURE_VECTORS))?;
        if feature_vectors.num_rows() as u64 != dimension
            || feature_vectors.num_cols() as u64 != num_vectors
        {
            return Err(Error::Corruption {
                name: group.member(vamana_members::FEATURE_VECTORS),
                reason: "feature matrix disagrees with metadata".to_string(),
            });
        }

        let adj_scores =
            storage::read_vector::<f32>(store, &group.member(vamana_members::ADJ_SCORES))?;
        let adj_ids = storage::read_vector::<u64>(store, &group.member(vamana_members::ADJ_IDS))?;
        let adj_index =
            storage::read_vector::<u64>(store, &group.member(vamana_members::ADJ_INDEX))?;
        if adj_index.len() as u64 != num_vectors + 1 {
            return Err(Error::Corruption {
                name: group.member(vamana_members::ADJ_INDEX),
                reason: "offset vector disagrees with ntotal".to_string(),
            });
        }
        let graph = AdjacencyList::from_csr(&adj_scores, &adj_ids, &adj_index)?;

        Ok(Self {
            feature_vectors,
            dimension,
            num_vectors,
            l_build: meta.get_u64("L")?,
            r_max_degree: meta.get_u64("R")?,
            b_backtrack: meta.get_u64("B")?,
            alpha_min: meta.get_f32("alpha_min")?,
            alpha_max: meta.get_f32("alpha_max")?,
            two_pass: false,
            nthreads: 0,
            graph,
            medoid: meta.get_u64("medioid")? as NodeId,
        })
    }

    /// Set the worker count used by subsequent queries.
    pub fn set_nthreads(&mut self, nthreads: usize) {
        self.nthreads = nthreads;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsStore;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use tempfile::TempDir;

    fn random_matrix(rows: usize, cols: usize, seed: u64) -> ColMajorMatrix<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..rows * cols).map(|_| rng.gen_range(0.0..1.0)).collect();
        ColMajorMatrix::from_vec(rows, cols, data)
    }

    fn built_index(db: &ColMajorMatrix<f32>, l: usize, r: usize) -> VamanaIndex<f32> {
        let mut index = VamanaIndex::new(
            VamanaParams::new()
                .with_l_build(l)
                .with_r_max_degree(r),
        )
        .unwrap();
        index.train(db).unwrap();
        index
    }

    #[test]
    fn test_degree_bound_and_no_self_loops() {
        let db = random_matrix(8, 100, 17);
        let index = built_index(&db, 20, 8);

        for p in 0..100u32 {
            let edges = index.graph().out_edges(p);
            assert!(edges.len() <= 8, "degree overflow at {p}");
            assert!(edges.iter().all(|&(_, q)| q != p), "self loop at {p}");
            let mut targets: Vec<NodeId> = edges.iter().map(|&(_, q)| q).collect();
            targets.sort_unstable();
            targets.dedup();
            assert_eq!(targets.len(), edges.len(), "duplicate target at {p}");
        }
    }

    #[test]
    fn test_edge_scores_are_distances() {
        let db = random_matrix(4, 40, 19);
        let index = built_index(&db, 10, 6);
        for p in 0..40u32 {
            for &(score, q) in index.graph().out_edges(p) {
                let expected = l2_squared(db.col(p as usize), db.col(q as usize));
                assert!((score - expected).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_self_recall() {
        let db = random_matrix(16, 120, 23);
        let index = built_index(&db, 30, 16);

        let (scores, ids) = index.query(&db, 1, None).unwrap();
        for j in 0..120 {
            assert_eq!(ids.col(j)[0], j as u64, "self lookup failed for {j}");
            assert_eq!(scores.col(j)[0], 0.0);
        }
    }

    #[test]
    fn test_query_l_smaller_than_k() {
        let db = random_matrix(4, 20, 29);
        let index = built_index(&db, 10, 6);
        assert!(matches!(
            index.query(&db, 5, Some(3)),
            Err(Error::SearchListTooSmall { l: 3, k: 5 })
        ));
    }

    #[test]
    fn test_empty_index_query() {
        let index = VamanaIndex::<f32>::new(VamanaParams::new()).unwrap();
        let q = ColMajorMatrix::<f32>::new(4, 2);
        let (_, ids) = index.query(&q, 3, None).unwrap();
        assert_eq!(ids.num_cols(), 2);
        assert!(ids.col(0).iter().all(|&id| id == crate::types::INVALID_ID));
    }

    #[test]
    fn test_id_overflow_guard() {
        // A matrix with zero rows keeps the allocation tiny while the
        // column count exceeds the node id range.
        let db = ColMajorMatrix::<f32>::new(0, NodeId::MAX as usize + 2);
        let mut index = VamanaIndex::<f32>::new(VamanaParams::new()).unwrap();
        assert!(matches!(
            index.train(&db),
            Err(Error::IdOverflow { .. })
        ));
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path()).unwrap();
        let db = random_matrix(8, 60, 31);
        let index = built_index(&db, 15, 8);
        index.write_index(&store, "vamana").unwrap();

        let back = VamanaIndex::<f32>::open(&store, "vamana").unwrap();
        assert_eq!(back.dimension(), index.dimension());
        assert_eq!(back.ntotal(), index.ntotal());
        assert_eq!(back.l_build(), index.l_build());
        assert_eq!(back.r_max_degree(), index.r_max_degree());
        assert_eq!(back.alpha_max(), index.alpha_max());
        assert_eq!(back.medoid(), index.medoid());
        assert_eq!(back.feature_vectors(), index.feature_vectors());
        // Adjacency equality covers per-node neighbor order.
        assert_eq!(back.graph(), index.graph());

        // Queries against the re-hydrated index behave identically.
        let q = random_matrix(8, 5, 32);
        let (_, a) = index.query(&q, 3, None).unwrap();
        let (_, b) = back.query(&q, 3, None).unwrap();
        for j in 0..5 {
            assert_eq!(a.col(j), b.col(j));
        }
    }

    #[test]
    fn test_two_pass_build_keeps_invariants() {
        let db = random_matrix(6, 50, 37);
        let mut index = VamanaIndex::new(
            VamanaParams::new()
                .with_l_build(12)
                .with_r_max_degree(6)
                .with_two_pass(true),
        )
        .unwrap();
        index.train(&db).unwrap();

        for p in 0..50u32 {
            assert!(index.graph().out_degree(p) <= 6);
        }
        let (_, ids) = index.query(&db, 1, None).unwrap();
        let hits = (0..50).filter(|&j| ids.col(j)[0] == j as u64).count();
        assert!(hits >= 48, "self recall degraded: {hits}/50");
    }
}
