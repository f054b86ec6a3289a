//! Systolic multiply-accumulate array
//!
//! Each step the array takes one column of an A block (one value per array
//! row) and one row of a B block (one value per array column). Operands
//! enter a diagonally skewed staging window: processing element (r, c)
//! sees the values that entered `r + c` steps earlier, so A lane `r` and
//! B lane `c` always meet with the same K index.
//!
//! Accumulation is scoped to one K-block. The first step of every block
//! carries a flush marker; when the marker reaches a processing element, the
//! element retires its running sum into the previous block's partial tile
//! and restarts from zero. A block's partial tile is therefore emitted while
//! the following block streams in, and [`SystolicMacArray::drain`] pushes a
//! final marker through to retire the last one.

use std::collections::VecDeque;

use serde::Serialize;

use crate::channel::{Sink, Source, StageTraffic};
use crate::error::{GemmError, GemmResult};
use crate::matrix::Matrix;
use crate::memory::Word;
use crate::reader::TileAssembler;

/// A streamed operand tagged with the start-of-block marker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaggedValue {
    pub value: i64,
    pub flush: bool,
}

impl TaggedValue {
    pub fn new(value: i64, flush: bool) -> Self {
        Self { value, flush }
    }
}

/// Operands entering the array on one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeVector {
    /// One value per array row
    pub a: Vec<TaggedValue>,
    /// One value per array column
    pub b: Vec<TaggedValue>,
}

impl EdgeVector {
    pub fn new(a: &[i64], b: &[i64], flush: bool) -> Self {
        Self {
            a: a.iter().map(|&v| TaggedValue::new(v, flush)).collect(),
            b: b.iter().map(|&v| TaggedValue::new(v, flush)).collect(),
        }
    }

    /// Zero operands carrying only a flush marker
    fn marker(rows: usize, cols: usize) -> Self {
        Self::new(&vec![0; rows], &vec![0; cols], true)
    }
}

/// Steps between an operand entering the array and reaching element (row, col)
pub fn skew_delay(row: usize, col: usize) -> usize {
    row + col
}

/// Counters reported by an array over a pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArrayStats {
    pub steps: u64,
    pub multiplies: u64,
    pub blocks: u64,
}

struct PendingTile {
    tile: Matrix,
    missing: usize,
}

pub struct SystolicMacArray {
    rows: usize,
    cols: usize,
    /// Recent inputs, newest first; `None` is a bubble
    staging: VecDeque<Option<EdgeVector>>,
    acc: Vec<i64>,
    /// Flush markers seen by each element
    epochs: Vec<usize>,
    /// Partial tiles still being retired, oldest first
    pending: VecDeque<PendingTile>,
    first_pending: usize,
    stats: ArrayStats,
}

impl SystolicMacArray {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            staging: VecDeque::with_capacity(rows + cols),
            acc: vec![0; rows * cols],
            epochs: vec![0; rows * cols],
            pending: VecDeque::new(),
            first_pending: 0,
            stats: ArrayStats::default(),
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn stats(&self) -> ArrayStats {
        self.stats
    }

    /// Depth of the staging window
    fn depth(&self) -> usize {
        skew_delay(self.rows - 1, self.cols - 1) + 1
    }

    /// Advance one step. Returns the partial tile of a K-block whose last
    /// element retired on this step.
    pub fn step(&mut self, input: Option<EdgeVector>) -> Option<Matrix> {
        if let Some(edge) = &input {
            debug_assert_eq!(edge.a.len(), self.rows);
            debug_assert_eq!(edge.b.len(), self.cols);
        }
        self.staging.push_front(input);
        self.staging.truncate(self.depth());
        self.stats.steps += 1;

        for r in 0..self.rows {
            for c in 0..self.cols {
                let (a, b) = match self.staging.get(skew_delay(r, c)) {
                    Some(Some(edge)) => (edge.a[r], edge.b[c]),
                    _ => continue,
                };
                debug_assert_eq!(a.flush, b.flush, "operands misaligned at ({}, {})", r, c);

                let pe = r * self.cols + c;
                if a.flush {
                    if self.epochs[pe] > 0 {
                        self.retire(self.epochs[pe] - 1, r, c);
                    }
                    self.acc[pe] = 0;
                    self.epochs[pe] += 1;
                }
                debug_assert!(self.epochs[pe] > 0, "operand arrived before any flush marker");
                self.acc[pe] += a.value * b.value;
            }
        }

        // Element (rows-1, cols-1) retires at most one epoch per step, so at
        // most one tile completes here.
        match self.pending.front() {
            Some(front) if front.missing == 0 => {
                self.first_pending += 1;
                self.pending.pop_front().map(|p| p.tile)
            }
            _ => None,
        }
    }

    fn retire(&mut self, epoch: usize, r: usize, c: usize) {
        let slot = epoch - self.first_pending;
        while self.pending.len() <= slot {
            self.pending.push_back(PendingTile {
                tile: Matrix::zeros(self.rows, self.cols),
                missing: self.rows * self.cols,
            });
        }
        let value = self.acc[r * self.cols + c];
        let pending = &mut self.pending[slot];
        pending.tile.set(r, c, value);
        pending.missing -= 1;
    }

    /// Stream one K-block: `a` is rows x K, `b` is K x cols. Returns the
    /// partial tiles completed meanwhile (those of earlier blocks).
    pub fn feed_block(&mut self, a: &Matrix, b: &Matrix) -> GemmResult<Vec<Matrix>> {
        if a.rows() != self.rows || b.cols() != self.cols || a.cols() != b.rows() || a.cols() == 0 {
            return Err(GemmError::config(format!(
                "{:?} x {:?} block does not fit a {}x{} array",
                a.shape(),
                b.shape(),
                self.rows,
                self.cols
            )));
        }

        let mut done = Vec::new();
        let mut column = vec![0; self.rows];
        for k in 0..a.cols() {
            for (r, slot) in column.iter_mut().enumerate() {
                *slot = a.get(r, k);
            }
            let edge = EdgeVector::new(&column, b.row(k), k == 0);
            done.extend(self.step(Some(edge)));
        }

        self.stats.blocks += 1;
        self.stats.multiplies += (a.cols() * self.rows * self.cols) as u64;
        log::trace!("array: block {} streamed ({} steps)", self.stats.blocks, a.cols());
        Ok(done)
    }

    /// Push a final flush marker through the window, retiring the last
    /// block, and return the array to its initial state
    pub fn drain(&mut self) -> Vec<Matrix> {
        let mut done = Vec::new();
        if self.epochs[0] > 0 {
            done.extend(self.step(Some(EdgeVector::marker(self.rows, self.cols))));
            for _ in 1..self.depth() {
                done.extend(self.step(None));
            }
        }
        debug_assert!(self.pending.is_empty());
        self.staging.clear();
        self.acc.fill(0);
        self.epochs.fill(0);
        self.pending.clear();
        self.first_pending = 0;
        done
    }
}

/// Array stage: one partial tile out per block product in
pub struct ArrayStage {
    array: SystolicMacArray,
    blocks: usize,
}

impl ArrayStage {
    pub fn new(rows: usize, cols: usize, blocks: usize) -> Self {
        Self {
            array: SystolicMacArray::new(rows, cols),
            blocks,
        }
    }

    /// Block products consumed, and partial tiles produced
    pub fn traffic(&self) -> StageTraffic {
        StageTraffic::new("array", self.blocks)
    }

    /// Words pulled from one operand stream on the tiled path
    pub fn word_traffic(&self, words_per_block: usize) -> StageTraffic {
        StageTraffic::new("array", self.blocks * words_per_block)
    }

    /// Tiled path: operand tiles arrive as the reader's word streams
    pub fn run_words(
        self,
        assembler: TileAssembler,
        a_in: Source<Word>,
        b_in: Source<Word>,
        out: Sink<Matrix>,
    ) -> GemmResult<ArrayStats> {
        self.run_with(|| assembler.next_pair(&a_in, &b_in), out)
    }

    /// Strassen path: leaf operand pairs arrive ready-made
    pub fn run_pairs(self, input: Source<(Matrix, Matrix)>, out: Sink<Matrix>) -> GemmResult<ArrayStats> {
        self.run_with(|| input.recv(), out)
    }

    fn run_with(
        mut self,
        mut next: impl FnMut() -> GemmResult<(Matrix, Matrix)>,
        out: Sink<Matrix>,
    ) -> GemmResult<ArrayStats> {
        log::debug!(
            "array: {}x{} elements, {} block products",
            self.array.rows(),
            self.array.cols(),
            self.blocks
        );
        for _ in 0..self.blocks {
            let (a, b) = next()?;
            for tile in self.array.feed_block(&a, &b)? {
                out.send(tile)?;
            }
        }
        for tile in self.array.drain() {
            out.send(tile)?;
        }
        let stats = self.array.stats();
        log::debug!("array: done, {} steps", stats.steps);
        Ok(stats)
    }
}
