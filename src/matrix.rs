//! Dense row-major matrices
//!
//! Used for host-side operands, for tiles gathered from word streams and for
//! the partial-sum tiles that flow between stages. Also provides the
//! packing into word layout and the schoolbook reference product.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{GemmError, GemmResult};
use crate::memory::Word;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<i64>,
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0; rows * cols],
        }
    }

    pub fn from_vec(rows: usize, cols: usize, data: Vec<i64>) -> GemmResult<Self> {
        if data.len() != rows * cols {
            return Err(GemmError::config(format!(
                "{} values cannot fill a {}x{} matrix",
                data.len(),
                rows,
                cols
            )));
        }
        Ok(Self { rows, cols, data })
    }

    pub fn identity(n: usize) -> Self {
        let mut m = Self::zeros(n, n);
        for i in 0..n {
            m.set(i, i, 1);
        }
        m
    }

    /// Uniform integers in `low..=high` from a seeded generator
    pub fn random(rows: usize, cols: usize, low: i64, high: i64, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..rows * cols).map(|_| rng.gen_range(low..=high)).collect();
        Self { rows, cols, data }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn data(&self) -> &[i64] {
        &self.data
    }

    pub fn get(&self, row: usize, col: usize) -> i64 {
        self.data[row * self.cols + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: i64) {
        self.data[row * self.cols + col] = value;
    }

    pub fn row(&self, row: usize) -> &[i64] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    /// Every element lies in `min..=max`
    pub fn check_range(&self, min: i64, max: i64) -> GemmResult<()> {
        match self.data.iter().find(|&&v| v < min || v > max) {
            Some(v) => Err(GemmError::range(format!(
                "element {} outside {}..={}",
                v, min, max
            ))),
            None => Ok(()),
        }
    }

    /// Element-wise sum, accumulating into `self`
    pub fn add_assign(&mut self, other: &Matrix) -> GemmResult<()> {
        self.check_same_shape(other)?;
        for (dst, src) in self.data.iter_mut().zip(&other.data) {
            let sum = dst.checked_add(*src).ok_or_else(|| {
                GemmError::range(format!("{} + {} overflows the accumulator", dst, src))
            })?;
            *dst = sum;
        }
        Ok(())
    }

    pub fn add(&self, other: &Matrix) -> Matrix {
        self.zip_with(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &Matrix) -> Matrix {
        self.zip_with(other, |a, b| a - b)
    }

    fn zip_with(&self, other: &Matrix, f: impl Fn(i64, i64) -> i64) -> Matrix {
        debug_assert_eq!(self.shape(), other.shape());
        let data = self.data.iter().zip(&other.data).map(|(&a, &b)| f(a, b)).collect();
        Matrix {
            rows: self.rows,
            cols: self.cols,
            data,
        }
    }

    fn check_same_shape(&self, other: &Matrix) -> GemmResult<()> {
        if self.shape() != other.shape() {
            return Err(GemmError::config(format!(
                "shape {:?} cannot combine with {:?}",
                self.shape(),
                other.shape()
            )));
        }
        Ok(())
    }

    /// Copy out the `rows x cols` sub-matrix starting at (`row`, `col`)
    pub fn block(&self, row: usize, col: usize, rows: usize, cols: usize) -> Matrix {
        let mut out = Matrix::zeros(rows, cols);
        for i in 0..rows {
            let src = (row + i) * self.cols + col;
            out.data[i * cols..(i + 1) * cols].copy_from_slice(&self.data[src..src + cols]);
        }
        out
    }

    /// Write `block` into `self` with its top-left corner at (`row`, `col`)
    pub fn place(&mut self, row: usize, col: usize, block: &Matrix) {
        for i in 0..block.rows {
            let dst = (row + i) * self.cols + col;
            self.data[dst..dst + block.cols].copy_from_slice(block.row(i));
        }
    }

    /// Split into quadrants `[11, 12, 21, 22]`
    pub fn quadrants(&self) -> [Matrix; 4] {
        let (h, w) = (self.rows / 2, self.cols / 2);
        [
            self.block(0, 0, h, w),
            self.block(0, w, h, w),
            self.block(h, 0, h, w),
            self.block(h, w, h, w),
        ]
    }

    /// Inverse of [`Matrix::quadrants`]
    pub fn from_quadrants(quadrants: &[Matrix; 4]) -> Matrix {
        let (h, w) = quadrants[0].shape();
        let mut out = Matrix::zeros(2 * h, 2 * w);
        out.place(0, 0, &quadrants[0]);
        out.place(0, w, &quadrants[1]);
        out.place(h, 0, &quadrants[2]);
        out.place(h, w, &quadrants[3]);
        out
    }

    /// Schoolbook triple-loop product
    pub fn reference_multiply(&self, other: &Matrix) -> GemmResult<Matrix> {
        if self.cols != other.rows {
            return Err(GemmError::config(format!(
                "inner dimensions must match: {} != {}",
                self.cols, other.rows
            )));
        }
        let mut out = Matrix::zeros(self.rows, other.cols);
        for k in 0..self.cols {
            for i in 0..self.rows {
                let a = self.get(i, k);
                for j in 0..other.cols {
                    out.data[i * other.cols + j] += a * other.get(k, j);
                }
            }
        }
        Ok(out)
    }

    /// Pack rows into words of `width` lanes, row-major
    pub fn pack(&self, width: usize) -> GemmResult<Vec<Word>> {
        if width == 0 || self.cols % width != 0 {
            return Err(GemmError::config(format!(
                "{} columns do not pack into {}-lane words",
                self.cols, width
            )));
        }
        Ok(self
            .data
            .chunks_exact(width)
            .map(|lanes| Word::from_lanes(lanes.to_vec()))
            .collect())
    }

    /// Inverse of [`Matrix::pack`]
    pub fn unpack(words: &[Word], rows: usize, cols: usize) -> GemmResult<Self> {
        let mut data = Vec::with_capacity(rows * cols);
        for word in words {
            data.extend_from_slice(word.lanes());
        }
        Self::from_vec(rows, cols, data)
    }
}

impl std::fmt::Display for Matrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for i in 0..self.rows {
            let row: Vec<String> = self.row(i).iter().map(|v| v.to_string()).collect();
            writeln!(f, "| {} |", row.join(" "))?;
        }
        Ok(())
    }
}
