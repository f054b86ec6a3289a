//! Block accumulator stage
//!
//! Sums the per-K-block partial tiles of one output tile in arrival order,
//! then emits the finished tile as row-major words and starts over from a
//! cleared buffer.

use crate::channel::{Sink, Source, StageTraffic};
use crate::config::GemmConfig;
use crate::error::{GemmError, GemmResult};
use crate::matrix::Matrix;
use crate::memory::Word;

pub struct BlockAccumulator {
    buffer: Matrix,
    k_blocks: usize,
    tiles: usize,
    received: usize,
    mem_width: usize,
}

impl BlockAccumulator {
    pub fn new(config: &GemmConfig, k_blocks: usize, tiles: usize) -> GemmResult<Self> {
        if k_blocks == 0 {
            return Err(GemmError::config("accumulator needs at least one K block per tile"));
        }
        Ok(Self {
            buffer: Matrix::zeros(config.block_rows(), config.block_cols()),
            k_blocks,
            tiles,
            received: 0,
            mem_width: config.mem_width,
        })
    }

    /// Partial tiles pulled from the array side
    pub fn input_traffic(&self) -> StageTraffic {
        StageTraffic::new("accumulator", self.tiles * self.k_blocks)
    }

    /// Words pushed to the writer
    pub fn output_traffic(&self) -> StageTraffic {
        let words = self.buffer.rows() * self.buffer.cols() / self.mem_width;
        StageTraffic::new("accumulator", self.tiles * words)
    }

    /// Fold one partial tile in; returns the finished tile after the last
    /// K block and clears the buffer
    pub fn absorb(&mut self, partial: &Matrix) -> GemmResult<Option<Matrix>> {
        self.buffer.add_assign(partial)?;
        self.received += 1;
        if self.received < self.k_blocks {
            return Ok(None);
        }
        self.received = 0;
        let (rows, cols) = self.buffer.shape();
        Ok(Some(std::mem::replace(&mut self.buffer, Matrix::zeros(rows, cols))))
    }

    pub fn run(mut self, input: Source<Matrix>, out: Sink<Word>) -> GemmResult<usize> {
        log::debug!(
            "accumulator: {} tiles of {} K blocks",
            self.tiles,
            self.k_blocks
        );
        for tile_index in 0..self.tiles {
            let mut finished = None;
            while finished.is_none() {
                let partial = input.recv()?;
                finished = self.absorb(&partial)?;
            }
            if let Some(tile) = finished {
                for lanes in tile.data().chunks_exact(self.mem_width) {
                    out.send(Word::from_lanes(lanes.to_vec()))?;
                }
                log::debug!("accumulator: tile {} finished", tile_index);
            }
        }
        Ok(self.tiles)
    }
}
