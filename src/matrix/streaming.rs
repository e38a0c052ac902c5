//! Streaming column-major matrix backed by the array store.
//!
//! Holds a window of `block_cols` columns of a persisted matrix; exactly one
//! block is resident at a time. Advancing blocks on I/O, which is the only
//! suspension point in the query kernels.

use crate::error::Result;
use crate::matrix::{ColMajorMatrix, ColumnMajor};
use crate::storage::{self, ArrayStore};
use crate::types::FeatureElement;

/// A cursor over successive column blocks of a stored matrix.
pub struct StreamingMatrix<'s, T: FeatureElement> {
    store: &'s dyn ArrayStore,
    name: String,
    rows: usize,
    total_cols: usize,
    block_cols: usize,
    window: ColMajorMatrix<T>,
    offset: usize,
}

impl<'s, T: FeatureElement> StreamingMatrix<'s, T> {
    /// Open `name` and load the first block of up to `block_cols` columns.
    pub fn open(store: &'s dyn ArrayStore, name: &str, block_cols: usize) -> Result<Self> {
        let (rows, total_cols) = storage::read_shape::<T>(store, name)?;
        let block_cols = block_cols.max(1).min(total_cols.max(1));
        let first_stop = block_cols.min(total_cols);
        let window = storage::read_matrix_columns(store, name, 0, first_stop)?;
        Ok(Self {
            store,
            name: name.to_string(),
            rows,
            total_cols,
            block_cols,
            window,
            offset: 0,
        })
    }

    /// Width of the configured block (the final block may be narrower).
    pub fn block_cols(&self) -> usize {
        self.block_cols
    }
}

impl<T: FeatureElement> ColumnMajor<T> for StreamingMatrix<'_, T> {
    fn num_rows(&self) -> usize {
        self.rows
    }

    fn num_cols(&self) -> usize {
        self.window.num_cols()
    }

    fn total_cols(&self) -> usize {
        self.total_cols
    }

    fn col(&self, j: usize) -> &[T] {
        self.window.col(j)
    }

    fn offset(&self) -> usize {
        self.offset
    }

    fn advance(&mut self) -> Result<bool> {
        let next = self.offset + self.window.num_cols();
        if next >= self.total_cols {
            return Ok(false);
        }
        let stop = (next + self.block_cols).min(self.total_cols);
        self.window = storage::read_matrix_columns(self.store, &self.name, next, stop)?;
        self.offset = next;
        Ok(true)
    }

    fn is_blocked(&self) -> bool {
        true
    }
}
