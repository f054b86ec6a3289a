//! Strassen block decomposition
//!
//! A block product is split into quadrants and replaced by seven products of
//! sums and differences; applying the split `L` times turns one block
//! product into `7^L` leaf products (49 for two levels instead of the 64 a
//! plain 4x4 partition needs). Leaves are listed depth-first, so leaf
//! `p * 7 + q` is the `q`-th sub-product of the `p`-th top-level product.
//!
//! ```text
//! M1 = (A11 + A22)(B11 + B22)    C11 = M1 + M4 - M5 + M7
//! M2 = (A21 + A22) B11           C12 = M3 + M5
//! M3 = A11 (B12 - B22)           C21 = M2 + M4
//! M4 = A22 (B21 - B11)           C22 = M1 - M2 + M3 + M6
//! M5 = (A11 + A12) B22
//! M6 = (A21 - A11)(B11 + B12)
//! M7 = (A12 - A22)(B21 + B22)
//! ```
//!
//! In the pipeline a splitter stage sits between the reader and the array
//! and a merger stage sits between the array and the accumulator.

use crate::channel::{Sink, Source, StageTraffic};
use crate::config::GemmConfig;
use crate::error::{GemmError, GemmResult};
use crate::matrix::Matrix;
use crate::memory::Word;
use crate::reader::TileAssembler;

/// Operand pairs of M1..M7 for one level
pub fn strassen_operands(a: &Matrix, b: &Matrix) -> [(Matrix, Matrix); 7] {
    let [a11, a12, a21, a22] = a.quadrants();
    let [b11, b12, b21, b22] = b.quadrants();
    [
        (a11.add(&a22), b11.add(&b22)),
        (a21.add(&a22), b11.clone()),
        (a11.clone(), b12.sub(&b22)),
        (a22.clone(), b21.sub(&b11)),
        (a11.add(&a12), b22.clone()),
        (a21.sub(&a11), b11.add(&b12)),
        (a12.sub(&a22), b21.add(&b22)),
    ]
}

/// Rebuild the four output quadrants from M1..M7
pub fn recombine(m: &[Matrix; 7]) -> Matrix {
    let c11 = m[0].add(&m[3]).sub(&m[4]).add(&m[6]);
    let c12 = m[2].add(&m[4]);
    let c21 = m[1].add(&m[3]);
    let c22 = m[0].sub(&m[1]).add(&m[2]).add(&m[5]);
    Matrix::from_quadrants(&[c11, c12, c21, c22])
}

/// Leaf operand pairs after `levels` recursive splits
pub fn leaf_operands(a: &Matrix, b: &Matrix, levels: u32) -> Vec<(Matrix, Matrix)> {
    if levels == 0 {
        return vec![(a.clone(), b.clone())];
    }
    strassen_operands(a, b)
        .iter()
        .flat_map(|(x, y)| leaf_operands(x, y, levels - 1))
        .collect()
}

/// Rebuild a block product from leaf products given in [`leaf_operands`] order
pub fn recombine_leaves<I>(leaves: &mut I, levels: u32) -> GemmResult<Matrix>
where
    I: Iterator<Item = Matrix>,
{
    if levels == 0 {
        return leaves
            .next()
            .ok_or_else(|| GemmError::config("ran out of leaf products while recombining"));
    }
    let mut products = Vec::with_capacity(7);
    for _ in 0..7 {
        products.push(recombine_leaves(leaves, levels - 1)?);
    }
    let m: [Matrix; 7] = products
        .try_into()
        .map_err(|_| GemmError::config("expected seven sub-products"))?;
    Ok(recombine(&m))
}

/// Splitter stage: block tiles in, leaf operand pairs out
pub struct StrassenSplitter {
    assembler: TileAssembler,
    levels: u32,
    leaves: usize,
    triples: usize,
}

impl StrassenSplitter {
    pub fn new(config: &GemmConfig, triples: usize) -> Self {
        Self {
            assembler: TileAssembler::new(config),
            levels: config.strassen_levels,
            leaves: config.leaves_per_block(),
            triples,
        }
    }

    /// Words pulled from the reader per operand stream
    pub fn a_traffic(&self, width: usize) -> StageTraffic {
        StageTraffic::new("strassen-split", self.triples * self.assembler.a_words(width))
    }

    pub fn b_traffic(&self, width: usize) -> StageTraffic {
        StageTraffic::new("strassen-split", self.triples * self.assembler.b_words(width))
    }

    /// Leaf pairs pushed to the array
    pub fn output_traffic(&self) -> StageTraffic {
        StageTraffic::new("strassen-split", self.triples * self.leaves)
    }

    pub fn run(
        self,
        a_in: Source<Word>,
        b_in: Source<Word>,
        out: Sink<(Matrix, Matrix)>,
    ) -> GemmResult<usize> {
        log::debug!(
            "strassen-split: {} blocks into {} leaves each",
            self.triples,
            self.leaves
        );
        let mut sent = 0;
        for _ in 0..self.triples {
            let (a, b) = self.assembler.next_pair(&a_in, &b_in)?;
            for pair in leaf_operands(&a, &b, self.levels) {
                out.send(pair)?;
                sent += 1;
            }
        }
        Ok(sent)
    }
}

/// Merger stage: leaf products in, one partial tile per block out
pub struct StrassenMerger {
    levels: u32,
    leaves: usize,
    triples: usize,
}

impl StrassenMerger {
    pub fn new(config: &GemmConfig, triples: usize) -> Self {
        Self {
            levels: config.strassen_levels,
            leaves: config.leaves_per_block(),
            triples,
        }
    }

    pub fn input_traffic(&self) -> StageTraffic {
        StageTraffic::new("strassen-merge", self.triples * self.leaves)
    }

    pub fn output_traffic(&self) -> StageTraffic {
        StageTraffic::new("strassen-merge", self.triples)
    }

    pub fn run(self, input: Source<Matrix>, out: Sink<Matrix>) -> GemmResult<usize> {
        for _ in 0..self.triples {
            let leaves = (0..self.leaves)
                .map(|_| input.recv())
                .collect::<GemmResult<Vec<_>>>()?;
            let partial = recombine_leaves(&mut leaves.into_iter(), self.levels)?;
            out.send(partial)?;
        }
        log::debug!("strassen-merge: {} partial tiles rebuilt", self.triples);
        Ok(self.triples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::channel;
    use pretty_assertions::assert_eq;

    fn strassen_product(a: &Matrix, b: &Matrix, levels: u32) -> Matrix {
        let leaves: Vec<Matrix> = leaf_operands(a, b, levels)
            .iter()
            .map(|(x, y)| x.reference_multiply(y).unwrap())
            .collect();
        recombine_leaves(&mut leaves.into_iter(), levels).unwrap()
    }

    #[test]
    fn test_one_level_matches_schoolbook() {
        let a = Matrix::random(4, 6, -128, 127, 1);
        let b = Matrix::random(6, 2, -128, 127, 2);
        assert_eq!(leaf_operands(&a, &b, 1).len(), 7);
        assert_eq!(strassen_product(&a, &b, 1), a.reference_multiply(&b).unwrap());
    }

    #[test]
    fn test_two_levels_use_49_leaves() {
        let a = Matrix::random(8, 8, -128, 127, 3);
        let b = Matrix::random(8, 8, -128, 127, 4);
        let leaves = leaf_operands(&a, &b, 2);
        assert_eq!(leaves.len(), 49);
        assert_eq!(leaves[0].0.shape(), (2, 2));
        assert_eq!(strassen_product(&a, &b, 2), a.reference_multiply(&b).unwrap());
    }

    #[test]
    fn test_precombination_grows_magnitude() {
        let a = Matrix::from_vec(2, 2, vec![-128; 4]).unwrap();
        let ops = strassen_operands(&a, &a);
        assert_eq!(ops[0].0.get(0, 0), -256);
        assert_eq!(ops[0].1.get(0, 0), -256);
    }

    #[test]
    fn test_missing_leaf_is_an_error() {
        let leaves = vec![Matrix::zeros(1, 1); 6];
        assert!(recombine_leaves(&mut leaves.into_iter(), 1).is_err());
    }

    #[test]
    fn test_split_and_merge_stages() {
        let config = GemmConfig::new(2, 1, 1, 1, 8, 32).with_strassen(1);
        let splitter = StrassenSplitter::new(&config, 1);
        assert_eq!(splitter.a_traffic(2).items, 2);
        assert_eq!(splitter.output_traffic().items, 7);

        let (a_tx, a_rx) = channel("a", 2);
        let (b_tx, b_rx) = channel("b", 2);
        let (leaf_tx, leaf_rx) = channel("leaves", 7);
        a_tx.send(Word::from_lanes(vec![1, 2])).unwrap();
        a_tx.send(Word::from_lanes(vec![3, 4])).unwrap();
        b_tx.send(Word::from_lanes(vec![5, 6])).unwrap();
        b_tx.send(Word::from_lanes(vec![7, 8])).unwrap();
        assert_eq!(splitter.run(a_rx, b_rx, leaf_tx).unwrap(), 7);

        let (prod_tx, prod_rx) = channel("leaf-products", 7);
        for _ in 0..7 {
            let (x, y) = leaf_rx.recv().unwrap();
            prod_tx.send(x.reference_multiply(&y).unwrap()).unwrap();
        }

        let merger = StrassenMerger::new(&config, 1);
        assert_eq!(merger.input_traffic().items, 7);
        let (out_tx, out_rx) = channel("partials", 1);
        merger.run(prod_rx, out_tx).unwrap();
        assert_eq!(out_rx.recv().unwrap().data(), &[19, 22, 43, 50]);
    }
}
