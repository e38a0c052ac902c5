//! Shared helpers: top-k selection and worker-pool scaffolding.

pub mod heap;

pub use heap::{top_k_nth, FixedMinHeap, HeapEntry};

use crate::error::{Error, Result};

/// Run `f` on a rayon pool with `nthreads` workers.
///
/// `nthreads == 0` runs on the global pool, i.e. available hardware
/// parallelism. Every parallel kernel in the crate funnels through this so
/// the thread count knob behaves uniformly.
pub fn with_threads<R: Send>(nthreads: usize, f: impl FnOnce() -> R + Send) -> Result<R> {
    if nthreads == 0 {
        return Ok(f());
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(nthreads)
        .build()
        .map_err(|e| Error::ThreadPool(e.to_string()))?;
    Ok(pool.install(f))
}

/// Split `0..len` into at most `nworkers` contiguous ranges.
///
/// Worker boundaries are a pure function of `(len, nworkers)`, which keeps
/// per-worker partial results and their merge order deterministic.
pub fn worker_ranges(len: usize, nworkers: usize) -> Vec<std::ops::Range<usize>> {
    let nworkers = nworkers.max(1);
    let block = len.div_ceil(nworkers);
    if block == 0 {
        return Vec::new();
    }
    (0..nworkers)
        .map(|n| (n * block).min(len)..((n + 1) * block).min(len))
        .filter(|r| !r.is_empty())
        .collect()
}
