//! Pipeline orchestration
//!
//! A pass wires the stages together with bounded channels and runs each
//! stage on its own scoped thread:
//!
//! ```text
//! direct:    reader -> array -> accumulator -> writer
//! strassen:  reader -> split -> array -> merge -> accumulator -> writer
//! ```
//!
//! Everything that can be checked up front (geometry, regions, stage
//! traffic, accumulator headroom) is checked before any channel exists.

use std::thread::{self, ScopedJoinHandle};

use serde::{Deserialize, Serialize};

use crate::accumulator::BlockAccumulator;
use crate::address::{BlockAddressGenerator, BlockGrid};
use crate::channel::{channel, link};
use crate::config::GemmConfig;
use crate::error::{GemmError, GemmResult};
use crate::matrix::Matrix;
use crate::memory::{LinearMemory, Region, Word};
use crate::reader::{TileAssembler, TileReader};
use crate::strassen::{StrassenMerger, StrassenSplitter};
use crate::systolic::{ArrayStage, ArrayStats};
use crate::writer::TileWriter;

/// Operands of one pass. Addresses and strides are in words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiplyArgs {
    pub a_base: usize,
    pub b_base: usize,
    pub c_base: usize,
    pub row_blocks: usize,
    pub col_blocks: usize,
    pub k_blocks: usize,
    pub a_stride: usize,
    pub b_stride: usize,
    pub c_stride: usize,
}

/// How block products are computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PassMode {
    Direct,
    Strassen { levels: u32 },
}

impl std::fmt::Display for PassMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PassMode::Direct => write!(f, "direct"),
            PassMode::Strassen { levels } => write!(f, "strassen ({} levels)", levels),
        }
    }
}

/// What a completed pass did
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub config: GemmConfig,
    pub mode: PassMode,
    /// Output shape in elements
    pub output_shape: (usize, usize),
    pub tiles_written: usize,
    pub k_blocks: usize,
    pub words_read: usize,
    pub words_written: usize,
    pub array: ArrayStats,
}

impl PassReport {
    /// Export to JSON format
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl std::fmt::Display for PassReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "GEMM Pass")?;
        writeln!(f, "=========")?;
        writeln!(f, "Config: {}", self.config)?;
        writeln!(f, "Mode: {}", self.mode)?;
        writeln!(f, "Output shape: {:?}", self.output_shape)?;
        writeln!(f, "Tiles written: {} ({} K blocks each)", self.tiles_written, self.k_blocks)?;
        writeln!(f, "Words read: {}", self.words_read)?;
        writeln!(f, "Words written: {}", self.words_written)?;
        writeln!(f, "Array blocks: {}", self.array.blocks)?;
        writeln!(f, "Array multiplies: {}", self.array.multiplies)?;
        writeln!(f, "Array steps: {}", self.array.steps)?;
        Ok(())
    }
}

/// Stage failures collected after a pass
#[derive(Default)]
struct Failures(Vec<GemmError>);

impl Failures {
    fn take<T: Default>(&mut self, result: GemmResult<T>) -> T {
        result.unwrap_or_else(|err| {
            self.0.push(err);
            T::default()
        })
    }

    /// Report the failure that started the cascade, not the closed
    /// channels it left behind
    fn into_result(mut self) -> GemmResult<()> {
        if self.0.is_empty() {
            return Ok(());
        }
        let root = self.0.iter().position(|e| !e.is_induced()).unwrap_or(0);
        Err(self.0.swap_remove(root))
    }
}

fn join<T>(stage: &'static str, handle: ScopedJoinHandle<'_, GemmResult<T>>) -> GemmResult<T> {
    handle
        .join()
        .unwrap_or_else(|_| Err(GemmError::StagePanic { stage }))
}

/// Size of `count` blocks of `per_block` each
fn extent(axis: &str, count: usize, per_block: usize) -> GemmResult<usize> {
    count.checked_mul(per_block).ok_or_else(|| {
        GemmError::config(format!(
            "{} {} blocks of {} overflow the address space",
            count, axis, per_block
        ))
    })
}

/// Counters gathered from the stages of one pass
#[derive(Debug, Default)]
struct StageCounts {
    words_read: usize,
    words_written: usize,
    array: ArrayStats,
}

/// The blocked GEMM engine
#[derive(Debug, Clone)]
pub struct GemmEngine {
    config: GemmConfig,
}

impl GemmEngine {
    pub fn new(config: GemmConfig) -> GemmResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &GemmConfig {
        &self.config
    }

    pub fn mode(&self) -> PassMode {
        match self.config.strassen_levels {
            0 => PassMode::Direct,
            levels => PassMode::Strassen { levels },
        }
    }

    /// Check a pass against the configuration and memory; returns the C region
    pub fn check_args(&self, memory: &LinearMemory, args: &MultiplyArgs) -> GemmResult<Region> {
        let cfg = &self.config;
        for (name, count) in [
            ("row_blocks", args.row_blocks),
            ("col_blocks", args.col_blocks),
            ("k_blocks", args.k_blocks),
        ] {
            if count == 0 {
                return Err(GemmError::config(format!("{} must be non-zero", name)));
            }
        }
        if memory.width() != cfg.mem_width {
            return Err(GemmError::config(format!(
                "memory words hold {} lanes, engine expects {}",
                memory.width(),
                cfg.mem_width
            )));
        }

        let a = Region::strided(
            "A",
            args.a_base,
            extent("row", args.row_blocks, cfg.block_rows())?,
            extent("k", args.k_blocks, cfg.k_words)?,
            args.a_stride,
        )?;
        let b = Region::strided(
            "B",
            args.b_base,
            extent("k", args.k_blocks, cfg.block_k())?,
            extent("col", args.col_blocks, cfg.col_words)?,
            args.b_stride,
        )?;
        let c = Region::strided(
            "C",
            args.c_base,
            extent("row", args.row_blocks, cfg.block_rows())?,
            extent("col", args.col_blocks, cfg.col_words)?,
            args.c_stride,
        )?;

        for region in [&a, &b, &c] {
            if region.span.end > memory.len() {
                return Err(GemmError::config(format!(
                    "{} spans words {:?} beyond memory of {} words",
                    region.name,
                    region.span,
                    memory.len()
                )));
            }
        }
        for (x, y) in [(&a, &b), (&a, &c), (&b, &c)] {
            if x.overlaps(y) {
                return Err(GemmError::config(format!(
                    "{} {:?} overlaps {} {:?}",
                    x.name, x.span, y.name, y.span
                )));
            }
        }

        cfg.check_capacity(cfg.pass_bound(args.k_blocks))?;
        Ok(c)
    }

    /// Compute C = A x B for the operands described by `args`, writing C
    /// tile by tile. On error the C region is left partially written.
    pub fn multiply(&self, memory: &mut LinearMemory, args: &MultiplyArgs) -> GemmResult<PassReport> {
        let c_region = self.check_args(memory, args)?;
        let cfg = &self.config;
        let addr = BlockAddressGenerator::new(cfg, args.a_stride, args.b_stride, args.c_stride);
        let grid = BlockGrid::new(args.row_blocks, args.col_blocks, args.k_blocks);

        log::info!(
            "gemm: {}x{}x{} blocks of {}, {}",
            grid.row_blocks,
            grid.k_blocks,
            grid.col_blocks,
            cfg,
            self.mode()
        );

        let (view, c_words) = memory.split_region(c_region.span);
        let reader = TileReader::new(cfg, view, addr, grid, args.a_base, args.b_base);
        let writer = TileWriter::new(c_words, addr, grid);
        let accumulator = BlockAccumulator::new(cfg, grid.k_blocks, grid.tiles())?;

        let counts = match self.mode() {
            PassMode::Direct => self.run_direct(grid, reader, accumulator, writer)?,
            PassMode::Strassen { levels } => {
                self.run_strassen(levels, grid, reader, accumulator, writer)?
            }
        };

        let report = PassReport {
            config: cfg.clone(),
            mode: self.mode(),
            output_shape: (
                grid.row_blocks * cfg.block_rows(),
                grid.col_blocks * cfg.block_cols(),
            ),
            tiles_written: grid.tiles(),
            k_blocks: grid.k_blocks,
            words_read: counts.words_read,
            words_written: counts.words_written,
            array: counts.array,
        };
        log::info!(
            "gemm: {} tiles written, {} array steps",
            report.tiles_written,
            report.array.steps
        );
        Ok(report)
    }

    fn run_direct(
        &self,
        grid: BlockGrid,
        reader: TileReader<'_>,
        accumulator: BlockAccumulator,
        writer: TileWriter<'_>,
    ) -> GemmResult<StageCounts> {
        let cfg = &self.config;
        let width = cfg.mem_width;
        let assembler = TileAssembler::new(cfg);
        let array = ArrayStage::new(cfg.block_rows(), cfg.block_cols(), grid.triples());

        link("a-words", reader.a_traffic(), array.word_traffic(assembler.a_words(width)))?;
        link("b-words", reader.b_traffic(), array.word_traffic(assembler.b_words(width)))?;
        link("partials", array.traffic(), accumulator.input_traffic())?;
        link("c-words", accumulator.output_traffic(), writer.traffic())?;

        let (a_tx, a_rx) = channel::<Word>("a-words", assembler.a_words(width));
        let (b_tx, b_rx) = channel::<Word>("b-words", assembler.b_words(width));
        let (p_tx, p_rx) = channel::<Matrix>("partials", 1);
        let (c_tx, c_rx) = channel::<Word>("c-words", cfg.block_rows() * cfg.col_words);

        let mut failures = Failures::default();
        let counts = thread::scope(|s| {
            let reader = s.spawn(move || reader.run(a_tx, b_tx));
            let array = s.spawn(move || array.run_words(assembler, a_rx, b_rx, p_tx));
            let accumulator = s.spawn(move || accumulator.run(p_rx, c_tx));
            let writer = s.spawn(move || writer.run(c_rx));

            let words_read = failures.take(join("reader", reader));
            let array = failures.take(join("array", array));
            failures.take(join("accumulator", accumulator));
            StageCounts {
                words_read,
                words_written: failures.take(join("writer", writer)),
                array,
            }
        });
        failures.into_result()?;
        Ok(counts)
    }

    fn run_strassen(
        &self,
        levels: u32,
        grid: BlockGrid,
        reader: TileReader<'_>,
        accumulator: BlockAccumulator,
        writer: TileWriter<'_>,
    ) -> GemmResult<StageCounts> {
        let cfg = &self.config;
        let width = cfg.mem_width;
        let assembler = TileAssembler::new(cfg);
        let leaves = cfg.leaves_per_block();
        let split = 1usize << levels;

        let splitter = StrassenSplitter::new(cfg, grid.triples());
        let array = ArrayStage::new(
            cfg.block_rows() / split,
            cfg.block_cols() / split,
            grid.triples() * leaves,
        );
        let merger = StrassenMerger::new(cfg, grid.triples());

        link("a-words", reader.a_traffic(), splitter.a_traffic(width))?;
        link("b-words", reader.b_traffic(), splitter.b_traffic(width))?;
        link("leaves", splitter.output_traffic(), array.traffic())?;
        link("leaf-products", array.traffic(), merger.input_traffic())?;
        link("partials", merger.output_traffic(), accumulator.input_traffic())?;
        link("c-words", accumulator.output_traffic(), writer.traffic())?;

        let (a_tx, a_rx) = channel::<Word>("a-words", assembler.a_words(width));
        let (b_tx, b_rx) = channel::<Word>("b-words", assembler.b_words(width));
        let (l_tx, l_rx) = channel::<(Matrix, Matrix)>("leaves", leaves);
        let (m_tx, m_rx) = channel::<Matrix>("leaf-products", leaves);
        let (p_tx, p_rx) = channel::<Matrix>("partials", 1);
        let (c_tx, c_rx) = channel::<Word>("c-words", cfg.block_rows() * cfg.col_words);

        let mut failures = Failures::default();
        let counts = thread::scope(|s| {
            let reader = s.spawn(move || reader.run(a_tx, b_tx));
            let splitter = s.spawn(move || splitter.run(a_rx, b_rx, l_tx));
            let array = s.spawn(move || array.run_pairs(l_rx, m_tx));
            let merger = s.spawn(move || merger.run(m_rx, p_tx));
            let accumulator = s.spawn(move || accumulator.run(p_rx, c_tx));
            let writer = s.spawn(move || writer.run(c_rx));

            let words_read = failures.take(join("reader", reader));
            failures.take(join("strassen-split", splitter));
            let array = failures.take(join("array", array));
            failures.take(join("strassen-merge", merger));
            failures.take(join("accumulator", accumulator));
            StageCounts {
                words_read,
                words_written: failures.take(join("writer", writer)),
                array,
            }
        });
        failures.into_result()?;
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiply_matrices;
    use pretty_assertions::assert_eq;

    fn direct(mem_width: usize, row_words: usize, k_words: usize, col_words: usize) -> GemmConfig {
        GemmConfig::new(mem_width, row_words, k_words, col_words, 8, 32)
    }

    #[test]
    fn test_identity_4x4() {
        let a = Matrix::from_vec(4, 4, (1..=16).collect()).unwrap();
        let (c, report) = multiply_matrices(&a, &Matrix::identity(4), &direct(2, 1, 1, 1)).unwrap();
        assert_eq!(c, a);
        assert_eq!(report.tiles_written, 4);
        assert_eq!(report.k_blocks, 2);
    }

    #[test]
    fn test_zero_k_blocks_is_config_error() {
        let engine = GemmEngine::new(direct(2, 1, 1, 1)).unwrap();
        let mut memory = LinearMemory::new(24, 2);
        let args = MultiplyArgs {
            a_base: 0,
            b_base: 8,
            c_base: 16,
            row_blocks: 2,
            col_blocks: 2,
            k_blocks: 0,
            a_stride: 2,
            b_stride: 2,
            c_stride: 2,
        };
        let result = engine.multiply(&mut memory, &args);
        assert!(matches!(result, Err(GemmError::Config { .. })));
    }

    #[test]
    fn test_matches_schoolbook() {
        let a = Matrix::random(8, 16, -128, 127, 11);
        let b = Matrix::random(16, 12, -128, 127, 12);
        let expected = a.reference_multiply(&b).unwrap();
        let (c, report) = multiply_matrices(&a, &b, &direct(4, 1, 2, 1)).unwrap();
        assert_eq!(c, expected);
        assert_eq!(report.array.multiplies, 8 * 16 * 12);
        assert_eq!(report.words_written, 8 * 12 / 4);
        assert_eq!(report.words_read, report.tiles_written * 2 * (4 * 8 + 8 * 4) / 4);
    }

    #[test]
    fn test_tiling_invariance() {
        let a = Matrix::random(8, 16, -128, 127, 21);
        let b = Matrix::random(16, 8, -128, 127, 22);
        let expected = a.reference_multiply(&b).unwrap();

        for config in [
            direct(1, 1, 1, 1),
            direct(2, 1, 1, 1),
            direct(2, 2, 4, 1),
            direct(4, 2, 2, 2),
            direct(8, 1, 2, 1),
            direct(4, 1, 4, 2),
        ] {
            let (c, _) = multiply_matrices(&a, &b, &config).unwrap();
            assert_eq!(c, expected, "config {}", config);
        }
    }

    #[test]
    fn test_strassen_matches_direct() {
        let a = Matrix::random(16, 8, -128, 127, 31);
        let b = Matrix::random(8, 16, -128, 127, 32);
        let (direct_c, _) = multiply_matrices(&a, &b, &direct(4, 1, 1, 1)).unwrap();

        for config in [
            direct(4, 1, 1, 1).with_strassen(1),
            direct(4, 1, 1, 1).with_strassen(2),
            direct(2, 2, 2, 2).with_strassen(2),
            direct(4, 2, 1, 1).with_strassen(1),
        ] {
            let (c, report) = multiply_matrices(&a, &b, &config).unwrap();
            assert_eq!(c, direct_c, "config {}", config);
            let triples = report.tiles_written * report.k_blocks;
            assert_eq!(report.array.blocks as usize, triples * config.leaves_per_block());
        }
    }

    #[test]
    fn test_two_level_strassen_uses_49_leaves_per_block() {
        let a = Matrix::random(4, 4, -128, 127, 41);
        let b = Matrix::random(4, 4, -128, 127, 42);
        let config = direct(4, 1, 1, 1).with_strassen(2);
        let (c, report) = multiply_matrices(&a, &b, &config).unwrap();
        assert_eq!(c, a.reference_multiply(&b).unwrap());
        assert_eq!(report.array.blocks, 49);
        assert_eq!(report.array.multiplies, 49);
        assert_eq!(report.mode, PassMode::Strassen { levels: 2 });
    }

    #[test]
    fn test_strided_operands_leave_padding_untouched() {
        // 4x4 operands stored with a 3-word stride (one padding word per row)
        let config = direct(2, 1, 1, 1);
        let engine = GemmEngine::new(config).unwrap();
        let a = Matrix::random(4, 4, -10, 10, 51);
        let b = Matrix::random(4, 4, -10, 10, 52);
        let sentinel = Word::from_lanes(vec![99, 99]);

        let mut memory = LinearMemory::new(40, 2);
        let fill: Vec<Word> = vec![sentinel.clone(); 40];
        memory.store(0, &fill).unwrap();
        for (base, m) in [(0, &a), (12, &b)] {
            let words = m.pack(2).unwrap();
            for row in 0..4 {
                memory.store(base + row * 3, &words[row * 2..row * 2 + 2]).unwrap();
            }
        }
        let args = MultiplyArgs {
            a_base: 0,
            b_base: 12,
            c_base: 25,
            row_blocks: 2,
            col_blocks: 2,
            k_blocks: 2,
            a_stride: 3,
            b_stride: 3,
            c_stride: 3,
        };
        engine.multiply(&mut memory, &args).unwrap();

        let expected = a.reference_multiply(&b).unwrap().pack(2).unwrap();
        for row in 0..4 {
            let base = 25 + row * 3;
            assert_eq!(memory.load(base, 2).unwrap(), &expected[row * 2..row * 2 + 2]);
            if row < 3 {
                assert_eq!(memory.word(base + 2), Some(&sentinel));
            }
        }
        assert_eq!(memory.word(24), Some(&sentinel));
        assert_eq!(memory.word(36), Some(&sentinel));
    }

    #[test]
    fn test_rejects_overlapping_regions() {
        let engine = GemmEngine::new(direct(2, 1, 1, 1)).unwrap();
        let mut memory = LinearMemory::new(24, 2);
        let args = MultiplyArgs {
            a_base: 0,
            b_base: 8,
            c_base: 12,
            row_blocks: 2,
            col_blocks: 2,
            k_blocks: 2,
            a_stride: 2,
            b_stride: 2,
            c_stride: 2,
        };
        let err = engine.multiply(&mut memory, &args).unwrap_err();
        assert!(matches!(err, GemmError::Config { .. }));
        assert!(err.to_string().contains("overlaps"));
    }

    #[test]
    fn test_rejects_args_overflowing_address_space() {
        let engine = GemmEngine::new(direct(2, 1, 1, 1)).unwrap();
        let mut memory = LinearMemory::new(24, 2);
        let huge = MultiplyArgs {
            a_base: 0,
            b_base: 8,
            c_base: 16,
            row_blocks: usize::MAX,
            col_blocks: 2,
            k_blocks: 2,
            a_stride: 2,
            b_stride: 2,
            c_stride: 2,
        };
        assert!(matches!(
            engine.multiply(&mut memory, &huge),
            Err(GemmError::Config { .. })
        ));

        let far = MultiplyArgs {
            a_base: usize::MAX - 1,
            row_blocks: 2,
            ..huge
        };
        assert!(matches!(
            engine.multiply(&mut memory, &far),
            Err(GemmError::Config { .. })
        ));
    }

    #[test]
    fn test_rejects_region_past_memory_end() {
        let engine = GemmEngine::new(direct(2, 1, 1, 1)).unwrap();
        let mut memory = LinearMemory::new(20, 2);
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
        assert!(matches!(
            engine.multiply(&mut memory, &args),
            Err(GemmError::Config { .. })
        ));
    }

    #[test]
    fn test_rejects_memory_of_other_width() {
        let engine = GemmEngine::new(direct(2, 1, 1, 1)).unwrap();
        let mut memory = LinearMemory::new(24, 4);
        let args = MultiplyArgs {
            a_base: 0,
            b_base: 8,
            c_base: 16,
            row_blocks: 1,
            col_blocks: 1,
            k_blocks: 1,
            a_stride: 1,
            b_stride: 1,
            c_stride: 1,
        };
        assert!(matches!(
            engine.multiply(&mut memory, &args),
            Err(GemmError::Config { .. })
        ));
    }

    #[test]
    fn test_pass_bound_checked_before_running() {
        // Each block fits a 17-bit accumulator, two K blocks do not
        let config = GemmConfig::new(2, 1, 1, 1, 8, 17);
        let a = Matrix::random(2, 4, -128, 127, 61);
        let b = Matrix::random(4, 2, -128, 127, 62);
        assert!(matches!(
            multiply_matrices(&a, &b, &config),
            Err(GemmError::Range { .. })
        ));
    }

    #[test]
    fn test_stage_failure_reports_root_cause() {
        // An out-of-range element deep inside B stops the reader mid-pass;
        // the other stages only see closed channels.
        let config = direct(2, 1, 1, 1);
        let engine = GemmEngine::new(config).unwrap();
        let a = Matrix::random(4, 4, -10, 10, 71);
        let mut b = Matrix::random(4, 4, -10, 10, 72);
        b.set(3, 3, 1000);

        let mut memory = LinearMemory::new(24, 2);
        memory.store(0, &a.pack(2).unwrap()).unwrap();
        memory.store(8, &b.pack(2).unwrap()).unwrap();
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
        assert!(matches!(
            engine.multiply(&mut memory, &args),
            Err(GemmError::Range { .. })
        ));
    }

    #[test]
    fn test_concurrent_passes_do_not_share_state() {
        let config = direct(4, 1, 1, 1);
        let problems: Vec<(Matrix, Matrix)> = (0..4)
            .map(|i| {
                (
                    Matrix::random(8, 8, -128, 127, 80 + i),
                    Matrix::random(8, 8, -128, 127, 90 + i),
                )
            })
            .collect();

        let config = &config;
        let results: Vec<Matrix> = thread::scope(|s| {
            let handles: Vec<_> = problems
                .iter()
                .map(|(a, b)| s.spawn(move || multiply_matrices(a, b, config).map(|(c, _)| c)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap().unwrap())
                .collect()
        });

        for ((a, b), c) in problems.iter().zip(&results) {
            assert_eq!(c, &a.reference_multiply(b).unwrap());
        }
    }

    #[test]
    fn test_report_json() {
        let a = Matrix::identity(4);
        let (_, report) = multiply_matrices(&a, &a, &direct(2, 1, 1, 1)).unwrap();
        let json = report.to_json().unwrap();
        assert!(json.contains("\"tiles_written\": 4"));
        assert!(report.to_string().contains("Mode: direct"));
    }
}
