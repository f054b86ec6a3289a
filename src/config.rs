//! Engine configuration
//!
//! Block geometry is expressed in memory words: a block of A is
//! `row_words * mem_width` rows by `k_words * mem_width` columns, a block
//! of B is `k_words * mem_width` rows by `col_words * mem_width` columns.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GemmError, GemmResult};

/// Configuration for the blocked GEMM engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GemmConfig {
    /// Elements packed in one memory word (W)
    pub mem_width: usize,
    /// Words per block along the rows of A / C
    pub row_words: usize,
    /// Words per block along the shared K dimension
    pub k_words: usize,
    /// Words per block along the columns of B / C
    pub col_words: usize,
    /// Bit width of input matrix elements
    pub data_width: u32,
    /// Bit width of accumulator/result
    pub acc_width: u32,
    /// Recursive Strassen levels applied to each block product (0 = direct)
    #[serde(default)]
    pub strassen_levels: u32,
}

impl GemmConfig {
    pub fn new(
        mem_width: usize,
        row_words: usize,
        k_words: usize,
        col_words: usize,
        data_width: u32,
        acc_width: u32,
    ) -> Self {
        Self {
            mem_width,
            row_words,
            k_words,
            col_words,
            data_width,
            acc_width,
            strassen_levels: 0,
        }
    }

    pub fn with_strassen(mut self, levels: u32) -> Self {
        self.strassen_levels = levels;
        self
    }

    /// Rows of an A / C block, in elements
    pub fn block_rows(&self) -> usize {
        self.mem_width * self.row_words
    }

    /// Depth of a block along K, in elements
    pub fn block_k(&self) -> usize {
        self.mem_width * self.k_words
    }

    /// Columns of a B / C block, in elements
    pub fn block_cols(&self) -> usize {
        self.mem_width * self.col_words
    }

    /// Leaf multiplies issued to the array per (row, col, k) block triple
    pub fn leaves_per_block(&self) -> usize {
        7usize.pow(self.strassen_levels)
    }

    /// Get the maximum value that can be represented
    pub fn max_value(&self) -> i64 {
        (1i64 << (self.data_width - 1)) - 1
    }

    /// Get the minimum value that can be represented
    pub fn min_value(&self) -> i64 {
        -(1i64 << (self.data_width - 1))
    }

    /// Largest value the accumulator can hold
    pub fn acc_capacity(&self) -> u128 {
        (1u128 << (self.acc_width - 1)) - 1
    }

    /// Worst-case magnitude produced inside one block product.
    ///
    /// Each Strassen level doubles the operand magnitude on both sides while
    /// halving K, and a recombination adds up to four sub-products.
    pub fn block_partial_bound(&self) -> u128 {
        let mag = 1u128 << (self.data_width - 1);
        let direct = mag * mag * self.block_k() as u128;
        if self.strassen_levels == 0 {
            direct
        } else {
            direct << (self.strassen_levels + 2)
        }
    }

    /// Worst-case magnitude of a finished output element over `k_blocks`
    pub fn pass_bound(&self, k_blocks: usize) -> u128 {
        let mag = 1u128 << (self.data_width - 1);
        let total = (mag * mag * self.block_k() as u128).saturating_mul(k_blocks as u128);
        total.max(self.block_partial_bound())
    }

    /// Check the geometry and the per-block accumulator headroom
    pub fn validate(&self) -> GemmResult<()> {
        if self.mem_width == 0 || !self.mem_width.is_power_of_two() {
            return Err(GemmError::config(format!(
                "mem_width must be a power of two, got {}",
                self.mem_width
            )));
        }
        if self.row_words == 0 || self.k_words == 0 || self.col_words == 0 {
            return Err(GemmError::config(format!(
                "block words must be non-zero, got {}x{}x{}",
                self.row_words, self.k_words, self.col_words
            )));
        }
        if [self.row_words, self.k_words, self.col_words]
            .iter()
            .any(|&words| self.mem_width.checked_mul(words).is_none())
        {
            return Err(GemmError::config(format!(
                "{}x{}x{} blocks of {}-lane words overflow the address space",
                self.row_words, self.k_words, self.col_words, self.mem_width
            )));
        }
        if !(2..=32).contains(&self.data_width) {
            return Err(GemmError::config(format!(
                "data_width must be within 2..=32 bits, got {}",
                self.data_width
            )));
        }
        if self.acc_width < self.data_width || self.acc_width > 64 {
            return Err(GemmError::config(format!(
                "acc_width must be within {}..=64 bits, got {}",
                self.data_width, self.acc_width
            )));
        }
        if self.strassen_levels >= usize::BITS {
            return Err(GemmError::config(format!(
                "strassen_levels = {} cannot split any block",
                self.strassen_levels
            )));
        }
        if self.strassen_levels > 0 {
            let split = 1usize << self.strassen_levels;
            for (name, dim) in [
                ("block_rows", self.block_rows()),
                ("block_k", self.block_k()),
                ("block_cols", self.block_cols()),
            ] {
                if dim % split != 0 {
                    return Err(GemmError::config(format!(
                        "{} = {} cannot be split {} times",
                        name, dim, self.strassen_levels
                    )));
                }
            }
        }
        self.check_capacity(self.block_partial_bound())
    }

    /// Check that a worst-case magnitude fits the accumulator
    pub fn check_capacity(&self, bound: u128) -> GemmResult<()> {
        if bound > self.acc_capacity() {
            return Err(GemmError::range(format!(
                "worst-case partial sum {} exceeds the {}-bit accumulator",
                bound, self.acc_width
            )));
        }
        Ok(())
    }

    /// Load from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> GemmResult<Self> {
        let text = fs::read_to_string(path)?;
        let config: GemmConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Export to JSON format
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl Default for GemmConfig {
    /// 8x8x8 blocks of 4-lane words, 8-bit data, 32-bit accumulator
    fn default() -> Self {
        Self::new(4, 2, 2, 2, 8, 32)
    }
}

impl std::fmt::Display for GemmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{}x{} blocks, {}-lane words, {}-bit data, {}-bit accumulator",
            self.block_rows(),
            self.block_k(),
            self.block_cols(),
            self.mem_width,
            self.data_width,
            self.acc_width
        )?;
        if self.strassen_levels > 0 {
            write!(f, ", Strassen x{}", self.strassen_levels)?;
        }
        Ok(())
    }
}
