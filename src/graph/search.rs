//! Graph traversal and construction primitives: greedy truncated
//! best-first search, alpha-diversified robust pruning, and medoid
//! selection.

use crate::error::{Error, Result};
use crate::graph::AdjacencyList;
use crate::matrix::ColumnMajor;
use crate::scoring::l2_squared;
use crate::types::{FeatureElement, NodeId, Score};
use crate::utils::FixedMinHeap;
use std::collections::{HashMap, HashSet};

/// Result of a greedy search: the k best `(score, id)` pairs in ascending
/// score order, plus every node visited along the way. During build the
/// visited set is the candidate pool consumed by [`robust_prune`].
#[derive(Debug)]
pub struct SearchOutcome {
    pub scores: Vec<Score>,
    pub ids: Vec<NodeId>,
    pub visited: HashSet<NodeId>,
}

/// Truncated best-first search from `source` toward `query`.
///
/// Maintains a result set R of capacity `l` (deduplicated by id), a visited
/// set V, and a frontier R \ V. Each round expands the frontier node
/// closest to the query; the frontier is rebuilt from R \ V after every
/// expansion. Requires `l >= k`; an empty graph yields an empty outcome.
pub fn greedy_search<T, M>(
    graph: &AdjacencyList,
    db: &M,
    source: NodeId,
    query: &[T],
    k: usize,
    l: usize,
) -> Result<SearchOutcome>
where
    T: FeatureElement,
    M: ColumnMajor<T>,
{
    if l < k {
        return Err(Error::SearchListTooSmall { l, k });
    }
    if graph.num_vertices() == 0 {
        return Ok(SearchOutcome {
            scores: Vec::new(),
            ids: Vec::new(),
            visited: HashSet::new(),
        });
    }

    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut result = FixedMinHeap::<NodeId>::new(l);

    let source_score = l2_squared(db.col(source as usize), query);
    result.insert_unique(source_score, source);
    let mut frontier: Vec<(Score, NodeId)> = vec![(source_score, source)];

    while !frontier.is_empty() {
        // p* = argmin over the frontier.
        let mut best = 0;
        for i in 1..frontier.len() {
            if frontier[i].0 < frontier[best].0 {
                best = i;
            }
        }
        let (_, p_star) = frontier.swap_remove(best);
        if visited.contains(&p_star) {
            continue;
        }
        visited.insert(p_star);

        // Rebuild the frontier from R \ V before expanding, so evictions
        // from R during expansion cannot resurrect stale candidates.
        let mut next = FixedMinHeap::<NodeId>::new(l);
        for (score, p) in result.iter() {
            if !visited.contains(&p) {
                next.insert(score, p);
            }
        }

        for &(_, p) in graph.out_edges(p_star) {
            if visited.contains(&p) {
                continue;
            }
            let score = l2_squared(db.col(p as usize), query);
            if result.insert_unique(score, p) {
                next.insert(score, p);
            }
        }

        frontier = next.into_sorted_vec();
    }

    let sorted = result.into_sorted_vec();
    let take = k.min(sorted.len());
    Ok(SearchOutcome {
        scores: sorted[..take].iter().map(|&(s, _)| s).collect(),
        ids: sorted[..take].iter().map(|&(_, p)| p).collect(),
        visited,
    })
}

/// Rewrite `N_out(p)` from the candidate pool with alpha-diversification.
///
/// The working set starts as the candidates united with the current
/// out-neighbors, annotated with distance to `p`. Rounds pick the closest
/// survivor, emit the edge, and drop every candidate that an already-picked
/// neighbor covers within factor `alpha`. Survivors are copied to a fresh
/// list each round. Idempotent on identical inputs.
pub fn robust_prune<T, M, C>(
    graph: &mut AdjacencyList,
    db: &M,
    p: NodeId,
    candidates: C,
    alpha: f32,
    r_max: usize,
) -> Result<()>
where
    T: FeatureElement,
    M: ColumnMajor<T>,
    C: IntoIterator<Item = NodeId>,
{
    let p_vec = db.col(p as usize);

    let mut pool: HashMap<NodeId, Score> = HashMap::new();
    for v in candidates {
        if v != p {
            pool.entry(v)
                .or_insert_with(|| l2_squared(db.col(v as usize), p_vec));
        }
    }
    for &(score, q) in graph.out_edges(p) {
        pool.entry(q).or_insert(score);
    }

    let mut working: Vec<(Score, NodeId)> = pool.into_iter().map(|(q, s)| (s, q)).collect();
    graph.clear_edges(p);

    if r_max == 0 {
        return Ok(());
    }

    while !working.is_empty() {
        let &(star_score, p_star) = working
            .iter()
            .min_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
            .expect("working set is nonempty");

        graph.add_edge(p, p_star, star_score)?;
        if graph.out_degree(p) == r_max {
            break;
        }

        let p_star_vec = db.col(p_star as usize);
        let mut survivors = Vec::with_capacity(working.len());
        for &(score, q) in &working {
            // q is covered when an already-picked neighbor sits alpha
            // times closer to it than p does.
            if alpha * l2_squared(db.col(q as usize), p_star_vec) <= score {
                continue;
            }
            survivors.push((score, q));
        }
        working = survivors;
    }
    Ok(())
}

/// Index of the vector nearest the arithmetic centroid of the set.
pub fn medoid<T, M>(db: &M) -> Option<NodeId>
where
    T: FeatureElement,
    M: ColumnMajor<T>,
{
    let n = db.num_cols();
    if n == 0 {
        return None;
    }
    let dim = db.num_rows();

    let mut centroid = vec![0.0f32; dim];
    for j in 0..n {
        for (c, x) in centroid.iter_mut().zip(db.col(j)) {
            *c += x.to_f32();
        }
    }
    for c in centroid.iter_mut() {
        *c /= n as f32;
    }

    let mut best = 0;
    let mut best_score = Score::INFINITY;
    for j in 0..n {
        let score = l2_squared(db.col(j), &centroid);
        if score < best_score {
            best_score = score;
            best = j;
        }
    }
    Some(best as NodeId)
}
