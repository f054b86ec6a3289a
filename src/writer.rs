//! Tile writer stage
//!
//! Stores finished tiles into the C region, visiting output tiles in the
//! same order the reader produced them.

use crate::address::{BlockAddressGenerator, BlockGrid};
use crate::channel::{Source, StageTraffic};
use crate::error::{GemmError, GemmResult};
use crate::memory::Word;

pub struct TileWriter<'a> {
    /// Exclusive slice of memory starting at the C base address
    region: &'a mut [Word],
    addr: BlockAddressGenerator,
    grid: BlockGrid,
}

impl<'a> TileWriter<'a> {
    pub fn new(region: &'a mut [Word], addr: BlockAddressGenerator, grid: BlockGrid) -> Self {
        Self { region, addr, grid }
    }

    pub fn traffic(&self) -> StageTraffic {
        let per_tile = self.addr.block_rows() * self.addr.b_row_words();
        StageTraffic::new("writer", self.grid.tiles() * per_tile)
    }

    /// Store every output tile; returns the number of words written
    pub fn run(self, input: Source<Word>) -> GemmResult<usize> {
        log::debug!("writer: expecting {} tiles", self.grid.tiles());
        let mut words = 0;

        for (row_block, col_block) in self.grid.tile_order() {
            for i in 0..self.addr.block_rows() {
                for j in 0..self.addr.b_row_words() {
                    let offset = self.addr.c_offset(row_block, col_block, i, j);
                    let word = input.recv()?;
                    let slot = self.region.get_mut(offset).ok_or_else(|| {
                        GemmError::config(format!("write of word {} outside the C region", offset))
                    })?;
                    *slot = word;
                    words += 1;
                }
            }
            log::debug!("writer: tile ({}, {}) stored", row_block, col_block);
        }

        Ok(words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::channel;
    use crate::config::GemmConfig;
    use crate::matrix::Matrix;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_tiles_land_at_mapped_addresses() {
        // 4x4 C of 2-lane words in 2x2 tiles
        let config = GemmConfig::new(2, 1, 1, 1, 8, 32);
        let addr = BlockAddressGenerator::new(&config, 2, 2, 2);
        let grid = BlockGrid::new(2, 2, 1);
        let mut region = vec![Word::zeroed(2); 8];

        let (tx, rx) = channel("c-words", 8);
        // Tile t holds 4t..4t+3 in row-major order
        for v in (0..16).step_by(2) {
            tx.send(Word::from_lanes(vec![v, v + 1])).unwrap();
        }

        let writer = TileWriter::new(&mut region, addr, grid);
        assert_eq!(writer.traffic().items, 8);
        assert_eq!(writer.run(rx).unwrap(), 8);

        let c = Matrix::unpack(&region, 4, 4).unwrap();
        let expected = Matrix::from_vec(
            4,
            4,
            vec![0, 1, 4, 5, 2, 3, 6, 7, 8, 9, 12, 13, 10, 11, 14, 15],
        )
        .unwrap();
        assert_eq!(c, expected);
    }

    #[test]
    fn test_short_tile_is_reported() {
        let config = GemmConfig::new(2, 1, 1, 1, 8, 32);
        let addr = BlockAddressGenerator::new(&config, 2, 2, 2);
        let mut region = vec![Word::zeroed(2); 8];
        let (tx, rx) = channel("c-words", 8);
        tx.send(Word::zeroed(2)).unwrap();
        drop(tx);

        let writer = TileWriter::new(&mut region, addr, BlockGrid::new(1, 1, 1));
        assert!(matches!(writer.run(rx), Err(GemmError::ChannelClosed { .. })));
    }
}
