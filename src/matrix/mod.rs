//! Column-major dense matrix primitives.
//!
//! Everywhere in this crate "column j" means "the j-th vector": a feature
//! vector set of N vectors with dimension D is a D x N matrix whose columns
//! are contiguous in memory. All index builders and query kernels consume
//! this layout.

pub mod streaming;

pub use streaming::StreamingMatrix;

use crate::error::Result;
use crate::types::FeatureElement;
use std::ops::{Index, IndexMut};

/// Uniform "column set" capability shared by owned, borrowed, and streaming
/// matrices. Kernels are written against this trait so the same code serves
/// in-memory and out-of-core execution.
///
/// Non-streaming implementations report `offset() = 0`, `is_blocked() =
/// false`, and advance exactly once, returning `false`.
pub trait ColumnMajor<T: FeatureElement>: Send + Sync {
    /// Vector dimension.
    fn num_rows(&self) -> usize;

    /// Number of resident columns (the current block width for a streaming
    /// matrix, the full width otherwise).
    fn num_cols(&self) -> usize;

    /// Total number of columns across all blocks.
    fn total_cols(&self) -> usize {
        self.num_cols()
    }

    /// Contiguous slab of resident column `j`, `j < num_cols()`.
    fn col(&self, j: usize) -> &[T];

    /// Absolute column offset of the resident block.
    fn offset(&self) -> usize {
        0
    }

    /// Load the next block. Returns `false` when no further block exists.
    fn advance(&mut self) -> Result<bool> {
        Ok(false)
    }

    /// `true` if this column set streams blocks from storage.
    fn is_blocked(&self) -> bool {
        false
    }
}

/// Owned column-major D x N matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct ColMajorMatrix<T> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

impl<T: FeatureElement> ColMajorMatrix<T> {
    /// Allocate a zero-filled D x N matrix.
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![T::zero(); rows * cols],
        }
    }

    /// Wrap an existing column-major buffer. `data.len()` must equal
    /// `rows * cols`.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<T>) -> Self {
        assert_eq!(data.len(), rows * cols, "buffer does not match shape");
        Self { rows, cols, data }
    }

    /// Build from column slices, all of equal length.
    pub fn from_columns(columns: &[&[T]]) -> Self {
        let cols = columns.len();
        let rows = columns.first().map_or(0, |c| c.len());
        let mut data = Vec::with_capacity(rows * cols);
        for c in columns {
            assert_eq!(c.len(), rows, "ragged column");
            data.extend_from_slice(c);
        }
        Self { rows, cols, data }
    }

    #[inline]
    pub fn num_rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn num_cols(&self) -> usize {
        self.cols
    }

    /// Contiguous slab of column `j`.
    #[inline]
    pub fn col(&self, j: usize) -> &[T] {
        &self.data[j * self.rows..(j + 1) * self.rows]
    }

    /// Mutable slab of column `j`.
    #[inline]
    pub fn col_mut(&mut self, j: usize) -> &mut [T] {
        &mut self.data[j * self.rows..(j + 1) * self.rows]
    }

    /// The raw column-major buffer.
    #[inline]
    pub fn data(&self) -> &[T] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Borrow as a view.
    pub fn view(&self) -> MatrixView<'_, T> {
        MatrixView {
            rows: self.rows,
            cols: self.cols,
            data: &self.data,
        }
    }

    /// Copy with every element promoted to f32.
    pub fn to_f32(&self) -> ColMajorMatrix<f32> {
        ColMajorMatrix {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().map(|x| x.to_f32()).collect(),
        }
    }
}

impl<T: FeatureElement> Index<(usize, usize)> for ColMajorMatrix<T> {
    type Output = T;

    #[inline]
    fn index(&self, (row, col): (usize, usize)) -> &T {
        &self.data[col * self.rows + row]
    }
}

impl<T: FeatureElement> IndexMut<(usize, usize)> for ColMajorMatrix<T> {
    #[inline]
    fn index_mut(&mut self, (row, col): (usize, usize)) -> &mut T {
        &mut self.data[col * self.rows + row]
    }
}

impl<T: FeatureElement> ColumnMajor<T> for ColMajorMatrix<T> {
    fn num_rows(&self) -> usize {
        self.rows
    }

    fn num_cols(&self) -> usize {
        self.cols
    }

    fn col(&self, j: usize) -> &[T] {
        ColMajorMatrix::col(self, j)
    }
}

/// Non-owning column-major view over a slab of `T`.
#[derive(Debug, Clone, Copy)]
pub struct MatrixView<'a, T> {
    rows: usize,
    cols: usize,
    data: &'a [T],
}

impl<'a, T: FeatureElement> MatrixView<'a, T> {
    /// View over a column-major buffer. `data.len()` must equal
    /// `rows * cols`.
    pub fn new(rows: usize, cols: usize, data: &'a [T]) -> Self {
        assert_eq!(data.len(), rows * cols, "buffer does not match shape");
        Self { rows, cols, data }
    }

    #[inline]
    pub fn num_rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn num_cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn col(&self, j: usize) -> &[T] {
        &self.data[j * self.rows..(j + 1) * self.rows]
    }

    #[inline]
    pub fn data(&self) -> &[T] {
        self.data
    }
}

impl<T: FeatureElement> ColumnMajor<T> for MatrixView<'_, T> {
    fn num_rows(&self) -> usize {
        self.rows
    }

    fn num_cols(&self) -> usize {
        self.cols
    }

    fn col(&self, j: usize) -> &[T] {
        MatrixView::col(self, j)
    }
}
