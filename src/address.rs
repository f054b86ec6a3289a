//! Block address generation
//!
//! Maps (block indices, element indices) to linear word offsets for the
//! three operands. `i` always indexes rows inside a block and `j` indexes
//! words inside a block row. All offsets are relative to the operand's base
//! address; strides are leading dimensions measured in words.

use crate::config::GemmConfig;

/// Stateless word-offset mapping for A, B and C blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAddressGenerator {
    block_rows: usize,
    block_k: usize,
    a_col_words: usize,
    b_col_words: usize,
    a_stride: usize,
    b_stride: usize,
    c_stride: usize,
}

impl BlockAddressGenerator {
    pub fn new(config: &GemmConfig, a_stride: usize, b_stride: usize, c_stride: usize) -> Self {
        Self {
            block_rows: config.block_rows(),
            block_k: config.block_k(),
            a_col_words: config.k_words,
            b_col_words: config.col_words,
            a_stride,
            b_stride,
            c_stride,
        }
    }

    /// Word `j` of row `i` of A block (`row_block`, `k_block`)
    pub fn a_offset(&self, row_block: usize, k_block: usize, i: usize, j: usize) -> usize {
        self.a_stride * self.block_rows * row_block + k_block * self.a_col_words + i * self.a_stride + j
    }

    /// Word `j` of row `i` of B block (`k_block`, `col_block`)
    pub fn b_offset(&self, col_block: usize, k_block: usize, i: usize, j: usize) -> usize {
        (col_block * self.b_col_words + j) + (i + k_block * self.block_k) * self.b_stride
    }

    /// Word `j` of row `i` of C block (`row_block`, `col_block`)
    pub fn c_offset(&self, row_block: usize, col_block: usize, i: usize, j: usize) -> usize {
        self.c_stride * self.block_rows * row_block + col_block * self.b_col_words + i * self.c_stride + j
    }

    /// Words per row of an A block
    pub fn a_row_words(&self) -> usize {
        self.a_col_words
    }

    /// Words per row of a B or C block
    pub fn b_row_words(&self) -> usize {
        self.b_col_words
    }

    pub fn block_rows(&self) -> usize {
        self.block_rows
    }

    pub fn block_k(&self) -> usize {
        self.block_k
    }
}

/// Block counts along each axis of a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGrid {
    pub row_blocks: usize,
    pub col_blocks: usize,
    pub k_blocks: usize,
}

impl BlockGrid {
    pub fn new(row_blocks: usize, col_blocks: usize, k_blocks: usize) -> Self {
        Self {
            row_blocks,
            col_blocks,
            k_blocks,
        }
    }

    /// Output tiles of C
    pub fn tiles(&self) -> usize {
        self.row_blocks * self.col_blocks
    }

    /// (row, col, k) block triples of the pass
    pub fn triples(&self) -> usize {
        self.tiles() * self.k_blocks
    }

    /// Output tiles in write order: row blocks outermost
    pub fn tile_order(&self) -> impl Iterator<Item = (usize, usize)> {
        let cols = self.col_blocks;
        (0..self.row_blocks).flat_map(move |r| (0..cols).map(move |c| (r, c)))
    }

    /// Block triples in read order: K blocks innermost
    pub fn triple_order(&self) -> impl Iterator<Item = (usize, usize, usize)> {
        let ks = self.k_blocks;
        self.tile_order()
            .flat_map(move |(r, c)| (0..ks).map(move |k| (r, c, k)))
    }
}
