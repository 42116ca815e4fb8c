//! This module contains the numeric containers consumed by the neighbor search.
//!
//! The search only ever reads rows; `set` and `eliminate_zeros` exist for the
//! callers that assemble the data.

use std::borrow::Cow;

use crate::error::{Result, SearchError};

/// Read/write access to a rectangular grid of `f32` values, one data point per row.
pub trait Matrix: Send + Sync {
    fn rows(&self) -> usize;
    fn cols(&self) -> usize;
    fn get(&self, row: usize, col: usize) -> f32;
    fn set(&mut self, row: usize, col: usize, value: f32);

    /// Returns the full (dense) row. Dense storage borrows, sparse storage densifies.
    fn row(&self, row: usize) -> Cow<'_, [f32]>;

    /// Columns holding stored values for `row`, or `None` when storage is dense.
    fn row_support(&self, _row: usize) -> Option<Vec<usize>> {
        None
    }

    /// `true` when no entry is NaN or infinite.
    fn is_finite(&self) -> bool;

    fn copy(&self) -> Self
    where
        Self: Sized;

    fn to_dense(&self) -> DenseMatrix;

    /// Drops explicitly stored zeros. Dense storage has nothing to drop.
    fn eliminate_zeros(&mut self) {}

    fn shape(&self) -> (usize, usize) {
        (self.rows(), self.cols())
    }
}

/// Row-major dense matrix.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "RawDenseMatrix"))]
pub struct DenseMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

/// Wire form of [`DenseMatrix`]; the shape is checked before it becomes one.
#[cfg(feature = "serde")]
#[derive(serde::Deserialize)]
struct RawDenseMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

#[cfg(feature = "serde")]
impl TryFrom<RawDenseMatrix> for DenseMatrix {
    type Error = SearchError;

    fn try_from(raw: RawDenseMatrix) -> Result<Self> {
        DenseMatrix::from_vec(raw.rows, raw.cols, raw.data)
    }
}

impl DenseMatrix {
    /// Builds a matrix from one `Vec` per row. Every row must have the same length.
    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self> {
        let n_cols = match rows.first() {
            Some(first) if !first.is_empty() => first.len(),
            _ => return Err(SearchError::EmptyMatrix),
        };

        let mut data = Vec::with_capacity(rows.len() * n_cols);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != n_cols {
                return Err(SearchError::RaggedRows { row: i, expected: n_cols, found: row.len() });
            }
            data.extend_from_slice(row);
        }

        Ok(DenseMatrix { rows: rows.len(), cols: n_cols, data })
    }

    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        if rows == 0 || cols == 0 {
            return Err(SearchError::EmptyMatrix);
        }
        if data.len() != rows * cols {
            return Err(SearchError::ShapeMismatch { rows, cols, len: data.len() });
        }
        Ok(DenseMatrix { rows, cols, data })
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        DenseMatrix { rows, cols, data: vec![0.0; rows * cols] }
    }

    /// Borrowed row slice without going through `Cow`.
    pub fn row_slice(&self, row: usize) -> &[f32] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn to_rows(&self) -> Vec<Vec<f32>> {
        self.data.chunks(self.cols).map(|r| r.to_vec()).collect()
    }
}

impl Matrix for DenseMatrix {
    fn rows(&self) -> usize {
        self.rows
    }

    fn cols(&self) -> usize {
        self.cols
    }

    fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols + col]
    }

    fn set(&mut self, row: usize, col: usize, value: f32) {
        self.data[row * self.cols + col] = value;
    }

    fn row(&self, row: usize) -> Cow<'_, [f32]> {
        Cow::Borrowed(self.row_slice(row))
    }

    fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    fn copy(&self) -> Self {
        self.clone()
    }

    fn to_dense(&self) -> DenseMatrix {
        self.clone()
    }
}

/// Compressed sparse row matrix. Column indices within a row are kept sorted.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix {
    rows: usize,
    cols: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    values: Vec<f32>,
}

impl CsrMatrix {
    /// Stores every non-zero entry of `dense`.
    pub fn from_dense(dense: &DenseMatrix) -> Self {
        let mut indptr = Vec::with_capacity(dense.rows + 1);
        let mut indices = Vec::new();
        let mut values = Vec::new();
        indptr.push(0);
        for r in 0..dense.rows {
            for (c, &v) in dense.row_slice(r).iter().enumerate() {
                if v != 0.0 {
                    indices.push(c);
                    values.push(v);
                }
            }
            indptr.push(indices.len());
        }
        CsrMatrix { rows: dense.rows, cols: dense.cols, indptr, indices, values }
    }

    /// Number of explicitly stored entries (including stored zeros).
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    fn row_range(&self, row: usize) -> std::ops::Range<usize> {
        self.indptr[row]..self.indptr[row + 1]
    }
}

impl Matrix for CsrMatrix {
    fn rows(&self) -> usize {
        self.rows
    }

    fn cols(&self) -> usize {
        self.cols
    }

    fn get(&self, row: usize, col: usize) -> f32 {
        let range = self.row_range(row);
        match self.indices[range.clone()].binary_search(&col) {
            Ok(pos) => self.values[range.start + pos],
            Err(_) => 0.0,
        }
    }

    fn set(&mut self, row: usize, col: usize, value: f32) {
        let range = self.row_range(row);
        match self.indices[range.clone()].binary_search(&col) {
            Ok(pos) => self.values[range.start + pos] = value,
            Err(pos) => {
                // New entry: shift everything after it and bump the row pointers.
                let at = range.start + pos;
                self.indices.insert(at, col);
                self.values.insert(at, value);
                for ptr in self.indptr[row + 1..].iter_mut() {
                    *ptr += 1;
                }
            }
        }
    }

    fn row(&self, row: usize) -> Cow<'_, [f32]> {
        let mut dense = vec![0.0; self.cols];
        for pos in self.row_range(row) {
            dense[self.indices[pos]] = self.values[pos];
        }
        Cow::Owned(dense)
    }

    fn row_support(&self, row: usize) -> Option<Vec<usize>> {
        Some(self.indices[self.row_range(row)].to_vec())
    }

    fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    fn copy(&self) -> Self {
        self.clone()
    }

    fn to_dense(&self) -> DenseMatrix {
        let mut dense = DenseMatrix::zeros(self.rows, self.cols);
        for r in 0..self.rows {
            for pos in self.row_range(r) {
                dense.set(r, self.indices[pos], self.values[pos]);
            }
        }
        dense
    }

    fn eliminate_zeros(&mut self) {
        let mut indptr = Vec::with_capacity(self.rows + 1);
        let mut indices = Vec::with_capacity(self.indices.len());
        let mut values = Vec::with_capacity(self.values.len());
        indptr.push(0);
        for r in 0..self.rows {
            for pos in self.row_range(r) {
                if self.values[pos] != 0.0 {
                    indices.push(self.indices[pos]);
                    values.push(self.values[pos]);
                }
            }
            indptr.push(indices.len());
        }
        self.indptr = indptr;
        self.indices = indices;
        self.values = values;
    }
}
