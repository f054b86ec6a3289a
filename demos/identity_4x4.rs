//! Example: 4x4 identity product
//!
//! Multiplies a 4x4 matrix by the identity using 2x2x2 blocks, so the
//! pipeline runs four output tiles of two K blocks each.
//!
//! Run with: cargo run --example identity_4x4

use systolic_gemm::{multiply_matrices, GemmConfig, GemmEngine, LinearMemory, Matrix, MultiplyArgs};

fn main() {
    println!("=== 4x4 Identity Product Example ===\n");

    // 2-lane words, one word per block side: 2x2x2 blocks
    let config = GemmConfig::new(2, 1, 1, 1, 8, 32);

    // Example 1: Host matrices in, host matrix out
    println!("Example 1: multiply_matrices");
    let a = Matrix::from_vec(4, 4, (1..=16).collect()).unwrap();
    let (c, report) = multiply_matrices(&a, &Matrix::identity(4), &config).unwrap();
    println!("A @ I =\n{}", c);
    println!("{}", report);

    // Example 2: Operands placed in memory by hand
    // A at word 0, B at word 8, C at word 16; every row is two words
    println!("Example 2: explicit memory layout");
    let mut memory = LinearMemory::new(24, 2);
    memory.store(0, &a.pack(2).unwrap()).unwrap();
    memory.store(8, &Matrix::identity(4).pack(2).unwrap()).unwrap();

    let engine = GemmEngine::new(config.with_strassen(1)).unwrap();
    let args = MultiplyArgs {
        a_base: 0,
        b_base: 8,
        c_base: 16,
        row_blocks: 2,
        col_blocks: 2,
        k_blocks: 2,
        a_stride: 2,
        b_stride: 2,
        c_stride: 2,
    };
    let report = engine.multiply(&mut memory, &args).unwrap();
    let c = Matrix::unpack(&memory.load(16, 8).unwrap(), 4, 4).unwrap();
    println!("A @ I (Strassen, 1 level) =\n{}", c);
    println!("Array steps: {}", report.array.steps);

    println!("\nJSON report:");
    println!("{}", report.to_json().unwrap());
}
