//! Blocked, pipelined matrix multiplication on a systolic array
//!
//! This library computes C = A x B for matrices stored in a word-addressed
//! linear memory. Operands are cut into blocks, streamed through a
//! multiply-accumulate array and summed along K, with every stage running
//! concurrently and connected by bounded channels. Block products may
//! optionally go through one or two levels of Strassen decomposition.
//!
//! # Example
//!
//! ```rust
//! use systolic_gemm::{multiply_matrices, GemmConfig, Matrix};
//!
//! let config = GemmConfig::new(2, 1, 1, 1, 8, 32); // 2x2x2 blocks, 8-bit data, 32-bit accum
//! let a = Matrix::from_vec(4, 4, (1..=16).collect()).unwrap();
//! let (c, report) = multiply_matrices(&a, &Matrix::identity(4), &config).unwrap();
//! assert_eq!(c, a);
//! println!("{}", report);
//! ```

pub mod accumulator;
pub mod address;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod matrix;
pub mod memory;
pub mod reader;
pub mod strassen;
pub mod systolic;
pub mod writer;

pub use accumulator::BlockAccumulator;
pub use address::{BlockAddressGenerator, BlockGrid};
pub use config::GemmConfig;
pub use engine::{GemmEngine, MultiplyArgs, PassMode, PassReport};
pub use error::{GemmError, GemmResult};
pub use matrix::Matrix;
pub use memory::{LinearMemory, Word};
pub use reader::TileReader;
pub use systolic::{ArrayStats, SystolicMacArray};
pub use writer::TileWriter;

/// Multiply two host matrices on a fresh engine.
///
/// A, B and C are laid out back to back in a scratch memory (A at word 0)
/// with row strides equal to their row lengths. Every dimension must be a
/// non-zero multiple of the matching block size.
pub fn multiply_matrices(a: &Matrix, b: &Matrix, config: &GemmConfig) -> GemmResult<(Matrix, PassReport)> {
    let engine = GemmEngine::new(config.clone())?;
    let (m, k) = a.shape();
    let (k_b, n) = b.shape();
    if k != k_b {
        return Err(GemmError::config(format!(
            "cannot multiply {:?} by {:?}",
            a.shape(),
            b.shape()
        )));
    }
    for (name, dim, block) in [
        ("M", m, config.block_rows()),
        ("K", k, config.block_k()),
        ("N", n, config.block_cols()),
    ] {
        if dim == 0 || dim % block != 0 {
            return Err(GemmError::config(format!(
                "{} = {} is not a multiple of the block size {}",
                name, dim, block
            )));
        }
    }
    a.check_range(config.min_value(), config.max_value())?;
    b.check_range(config.min_value(), config.max_value())?;

    let width = config.mem_width;
    let a_words = a.pack(width)?;
    let b_words = b.pack(width)?;
    let a_base = 0;
    let b_base = a_words.len();
    let c_base = b_base + b_words.len();
    let c_len = m * n / width;

    let mut memory = LinearMemory::new(c_base + c_len, width);
    memory.store(a_base, &a_words)?;
    memory.store(b_base, &b_words)?;

    let args = MultiplyArgs {
        a_base,
        b_base,
        c_base,
        row_blocks: m / config.block_rows(),
        col_blocks: n / config.block_cols(),
        k_blocks: k / config.block_k(),
        a_stride: k / width,
        b_stride: n / width,
        c_stride: n / width,
    };
    let report = engine.multiply(&mut memory, &args)?;
    let c = Matrix::unpack(&memory.load(c_base, c_len)?, m, n)?;
    Ok((c, report))
}
