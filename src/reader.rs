//! Tile reader stage
//!
//! Walks the block triples of a pass (row blocks outermost, K blocks
//! innermost) and, for each triple, streams one B tile followed by one A
//! tile out of memory, word by word in row-major order.

use crate::address::{BlockAddressGenerator, BlockGrid};
use crate::channel::{Sink, Source, StageTraffic};
use crate::config::GemmConfig;
use crate::error::{GemmError, GemmResult};
use crate::matrix::Matrix;
use crate::memory::{ReadView, Word};

pub struct TileReader<'a> {
    view: ReadView<'a>,
    addr: BlockAddressGenerator,
    grid: BlockGrid,
    a_base: usize,
    b_base: usize,
    min_value: i64,
    max_value: i64,
}

impl<'a> TileReader<'a> {
    pub fn new(
        config: &GemmConfig,
        view: ReadView<'a>,
        addr: BlockAddressGenerator,
        grid: BlockGrid,
        a_base: usize,
        b_base: usize,
    ) -> Self {
        Self {
            view,
            addr,
            grid,
            a_base,
            b_base,
            min_value: config.min_value(),
            max_value: config.max_value(),
        }
    }

    pub fn a_traffic(&self) -> StageTraffic {
        let per_tile = self.addr.block_rows() * self.addr.a_row_words();
        StageTraffic::new("reader", self.grid.triples() * per_tile)
    }

    pub fn b_traffic(&self) -> StageTraffic {
        let per_tile = self.addr.block_k() * self.addr.b_row_words();
        StageTraffic::new("reader", self.grid.triples() * per_tile)
    }

    /// Stream every tile of the pass; returns the number of words read
    pub fn run(self, a_out: Sink<Word>, b_out: Sink<Word>) -> GemmResult<usize> {
        log::debug!("reader: streaming {} block triples", self.grid.triples());
        let mut words = 0;

        for (row_block, col_block, k_block) in self.grid.triple_order() {
            for i in 0..self.addr.block_k() {
                for j in 0..self.addr.b_row_words() {
                    let offset = self.b_base + self.addr.b_offset(col_block, k_block, i, j);
                    b_out.send(self.fetch(offset)?)?;
                    words += 1;
                }
            }
            for i in 0..self.addr.block_rows() {
                for j in 0..self.addr.a_row_words() {
                    let offset = self.a_base + self.addr.a_offset(row_block, k_block, i, j);
                    a_out.send(self.fetch(offset)?)?;
                    words += 1;
                }
            }
        }

        log::debug!("reader: done, {} words", words);
        Ok(words)
    }

    fn fetch(&self, offset: usize) -> GemmResult<Word> {
        let word = self.view.word(offset).ok_or_else(|| {
            GemmError::config(format!("read of word {} outside the input regions", offset))
        })?;
        if let Some(v) = word
            .lanes()
            .iter()
            .find(|&&v| v < self.min_value || v > self.max_value)
        {
            return Err(GemmError::range(format!(
                "element {} at word {} outside {}..={}",
                v, offset, self.min_value, self.max_value
            )));
        }
        Ok(word.clone())
    }
}

/// Rebuilds tiles from the reader's word streams
#[derive(Debug, Clone, Copy)]
pub struct TileAssembler {
    block_rows: usize,
    block_k: usize,
    block_cols: usize,
}

impl TileAssembler {
    pub fn new(config: &GemmConfig) -> Self {
        Self {
            block_rows: config.block_rows(),
            block_k: config.block_k(),
            block_cols: config.block_cols(),
        }
    }

    /// Words consumed per A tile
    pub fn a_words(&self, width: usize) -> usize {
        self.block_rows * self.block_k / width
    }

    /// Words consumed per B tile
    pub fn b_words(&self, width: usize) -> usize {
        self.block_k * self.block_cols / width
    }

    /// Pull the next B tile, then the next A tile; returns `(a, b)`
    pub fn next_pair(&self, a_in: &Source<Word>, b_in: &Source<Word>) -> GemmResult<(Matrix, Matrix)> {
        let b = Self::gather(b_in, self.block_k, self.block_cols)?;
        let a = Self::gather(a_in, self.block_rows, self.block_k)?;
        Ok((a, b))
    }

    fn gather(source: &Source<Word>, rows: usize, cols: usize) -> GemmResult<Matrix> {
        let mut data = Vec::with_capacity(rows * cols);
        while data.len() < rows * cols {
            data.extend_from_slice(source.recv()?.lanes());
        }
        Matrix::from_vec(rows, cols, data)
    }
}
