//! Dense and sparse matrices addressed by index positions

use std::collections::BTreeMap;

use nalgebra::DMatrix;

use crate::error::{CalcError, Result};

/// Compressed sparse column storage.
#[derive(Debug, Clone, PartialEq)]
pub struct CscMatrix {
    rows: usize,
    cols: usize,
    col_ptr: Vec<usize>,
    row_idx: Vec<usize>,
    values: Vec<f64>,
}

impl CscMatrix {
    /// Non-zero entries `(row, value)` of column `j`, ordered by row.
    pub fn column_entries(&self, j: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let range = self.col_ptr[j]..self.col_ptr[j + 1];
        self.row_idx[range.clone()]
            .iter()
            .copied()
            .zip(self.values[range].iter().copied())
    }

    pub fn non_zeros(&self) -> usize {
        self.values.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Matrix {
    Dense(DMatrix<f64>),
    Sparse(CscMatrix),
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Matrix::Dense(DMatrix::zeros(rows, cols))
    }

    /// From row-major nested arrays; handy for small literal matrices.
    pub fn from_rows(rows: &[Vec<f64>]) -> Self {
        let n = rows.len();
        let m = rows.first().map_or(0, |r| r.len());
        Matrix::Dense(DMatrix::from_fn(n, m, |i, j| rows[i][j]))
    }

    pub fn rows(&self) -> usize {
        match self {
            Matrix::Dense(m) => m.nrows(),
            Matrix::Sparse(m) => m.rows,
        }
    }

    pub fn cols(&self) -> usize {
        match self {
            Matrix::Dense(m) => m.ncols(),
            Matrix::Sparse(m) => m.cols,
        }
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        match self {
            Matrix::Dense(m) => m[(row, col)],
            Matrix::Sparse(m) => m
                .column_entries(col)
                .find(|(r, _)| *r == row)
                .map_or(0.0, |(_, v)| v),
        }
    }

    pub fn column(&self, col: usize) -> Vec<f64> {
        match self {
            Matrix::Dense(m) => m.column(col).iter().copied().collect(),
            Matrix::Sparse(m) => {
                let mut v = vec![0.0; m.rows];
                for (r, value) in m.column_entries(col) {
                    v[r] = value;
                }
                v
            }
        }
    }

    pub fn row(&self, row: usize) -> Vec<f64> {
        (0..self.cols()).map(|j| self.get(row, j)).collect()
    }

    /// Non-zero entries of a column as `(row, value)`.
    pub fn column_entries(&self, col: usize) -> Vec<(usize, f64)> {
        match self {
            Matrix::Dense(m) => m
                .column(col)
                .iter()
                .enumerate()
                .filter(|(_, v)| **v != 0.0)
                .map(|(i, v)| (i, *v))
                .collect(),
            Matrix::Sparse(m) => m.column_entries(col).collect(),
        }
    }

    pub fn diagonal(&self) -> Vec<f64> {
        (0..self.rows().min(self.cols())).map(|i| self.get(i, i)).collect()
    }

    /// Share of non-zero entries.
    pub fn density(&self) -> f64 {
        let size = (self.rows() * self.cols()) as f64;
        if size == 0.0 {
            return 0.0;
        }
        let non_zeros = match self {
            Matrix::Dense(m) => m.iter().filter(|v| **v != 0.0).count(),
            Matrix::Sparse(m) => m.non_zeros(),
        };
        non_zeros as f64 / size
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        match self {
            Matrix::Dense(m) => m.clone(),
            Matrix::Sparse(m) => {
                let mut dense = DMatrix::zeros(m.rows, m.cols);
                for j in 0..m.cols {
                    for (i, v) in m.column_entries(j) {
                        dense[(i, j)] = v;
                    }
                }
                dense
            }
        }
    }

    pub fn transpose(&self) -> Matrix {
        match self {
            Matrix::Dense(m) => Matrix::Dense(m.transpose()),
            Matrix::Sparse(m) => {
                let mut builder = MatrixBuilder::new(m.cols, m.rows);
                for j in 0..m.cols {
                    for (i, v) in m.column_entries(j) {
                        builder.set(j, i, v);
                    }
                }
                builder.finish()
            }
        }
    }

    /// `self * v`
    pub fn multiply(&self, v: &[f64]) -> Result<Vec<f64>> {
        if v.len() != self.cols() {
            return Err(CalcError::DimensionMismatch {
                expected: self.cols(),
                actual: v.len(),
            });
        }
        let mut result = vec![0.0; self.rows()];
        match self {
            Matrix::Dense(m) => {
                for (j, x) in v.iter().enumerate() {
                    if *x == 0.0 {
                        continue;
                    }
                    for (i, a) in m.column(j).iter().enumerate() {
                        result[i] += a * x;
                    }
                }
            }
            Matrix::Sparse(m) => {
                for (j, x) in v.iter().enumerate() {
                    if *x == 0.0 {
                        continue;
                    }
                    for (i, a) in m.column_entries(j) {
                        result[i] += a * x;
                    }
                }
            }
        }
        Ok(result)
    }

    /// Scales every column `j` by `factors[j]`.
    pub fn scale_columns(&self, factors: &[f64]) -> Result<Matrix> {
        if factors.len() != self.cols() {
            return Err(CalcError::DimensionMismatch {
                expected: self.cols(),
                actual: factors.len(),
            });
        }
        let mut builder = MatrixBuilder::new(self.rows(), self.cols());
        for (j, f) in factors.iter().enumerate() {
            for (i, v) in self.column_entries(j) {
                builder.set(i, j, v * f);
            }
        }
        Ok(builder.finish())
    }
}

/// Collects entries by `(row, column)` and compresses them once assembly is done.
#[derive(Debug, Clone)]
pub struct MatrixBuilder {
    rows: usize,
    cols: usize,
    entries: BTreeMap<(usize, usize), f64>,
}

impl MatrixBuilder {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols, entries: BTreeMap::new() }
    }

    pub fn add(&mut self, row: usize, col: usize, value: f64) {
        *self.entries.entry((col, row)).or_insert(0.0) += value;
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.entries.insert((col, row), value);
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.entries.get(&(col, row)).copied().unwrap_or(0.0)
    }

    /// Removes all entries of a column.
    pub fn clear_column(&mut self, col: usize) {
        self.entries.retain(|(c, _), _| *c != col);
    }

    pub fn finish(self) -> Matrix {
        let mut col_ptr = vec![0; self.cols + 1];
        let mut row_idx = Vec::with_capacity(self.entries.len());
        let mut values = Vec::with_capacity(self.entries.len());
        // keys are ordered by column, then row
        for ((col, row), value) in self.entries {
            if value == 0.0 {
                continue;
            }
            row_idx.push(row);
            values.push(value);
            col_ptr[col + 1] += 1;
        }
        for j in 0..self.cols {
            col_ptr[j + 1] += col_ptr[j];
        }
        Matrix::Sparse(CscMatrix {
            rows: self.rows,
            cols: self.cols,
            col_ptr,
            row_idx,
            values,
        })
    }
}
