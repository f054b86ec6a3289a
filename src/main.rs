//! Blocked GEMM engine simulator CLI
//!
//! Usage:
//!   gemmsim -m 16 -k 16 -n 16
//!   gemmsim -m 32 -k 16 -n 8 --mem-width 4 --strassen 2 --acc-width 40
//!   gemmsim -m 8 -k 8 -n 8 --config engine.json --json

use clap::Parser as ClapParser;
use colored::Colorize;

use systolic_gemm::{multiply_matrices, GemmConfig, Matrix, PassReport};

#[derive(ClapParser, Debug)]
#[command(name = "gemmsim")]
#[command(author = "FPGA Team")]
#[command(version = "0.1.0")]
#[command(about = "Runs random matrices through the blocked systolic GEMM pipeline")]
struct Args {
    /// Rows of A and C
    #[arg(short = 'm', long = "rows", default_value = "16")]
    rows: usize,

    /// Columns of A, rows of B
    #[arg(short = 'k', long = "depth", default_value = "16")]
    depth: usize,

    /// Columns of B and C
    #[arg(short = 'n', long = "cols", default_value = "16")]
    cols: usize,

    /// Read the engine configuration from a JSON file
    #[arg(short = 'c', long = "config")]
    config_file: Option<String>,

    /// Elements per memory word
    #[arg(short = 'w', long = "mem-width", default_value = "4")]
    mem_width: usize,

    /// Words per block along M
    #[arg(long = "row-words", default_value = "2")]
    row_words: usize,

    /// Words per block along K
    #[arg(long = "k-words", default_value = "2")]
    k_words: usize,

    /// Words per block along N
    #[arg(long = "col-words", default_value = "2")]
    col_words: usize,

    /// Data width in bits
    #[arg(short = 'd', long = "data-width", default_value = "8")]
    data_width: u32,

    /// Accumulator width in bits
    #[arg(short = 'a', long = "acc-width", default_value = "32")]
    acc_width: u32,

    /// Strassen levels per block product (0, 1 or 2)
    #[arg(short = 's', long = "strassen", default_value = "0")]
    strassen: u32,

    /// Seed for the random operands
    #[arg(long = "seed", default_value = "1")]
    seed: u64,

    /// Output the pass report as JSON
    #[arg(short = 'j', long = "json")]
    json_output: bool,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = match &args.config_file {
        Some(path) => GemmConfig::from_json_file(path).unwrap_or_else(|e| {
            eprintln!("{}: Failed to load config '{}': {}", "Error".red(), path, e);
            std::process::exit(1);
        }),
        None => GemmConfig::new(
            args.mem_width,
            args.row_words,
            args.k_words,
            args.col_words,
            args.data_width,
            args.acc_width,
        )
        .with_strassen(args.strassen),
    };
    if let Err(e) = config.validate() {
        eprintln!("{}: Invalid engine configuration: {}", "Error".red(), e);
        std::process::exit(1);
    }

    if args.verbose && !args.json_output {
        println!("{}", "Systolic GEMM Simulator".bold().blue());
        println!("{}", "=".repeat(35));
        println!();
        println!(
            "{}: {}x{} @ {}x{}",
            "Problem".green(),
            args.rows,
            args.depth,
            args.depth,
            args.cols
        );
        println!("{}: {}", "Engine".green(), config);
        println!();
    }

    let (low, high) = (config.min_value(), config.max_value());
    let a = Matrix::random(args.rows, args.depth, low, high, args.seed);
    let b = Matrix::random(args.depth, args.cols, low, high, args.seed.wrapping_add(1));

    let (c, report) = match multiply_matrices(&a, &b, &config) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("{}: {}", "Engine error".red(), e);
            std::process::exit(1);
        }
    };

    let expected = match a.reference_multiply(&b) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("{}: {}", "Reference error".red(), e);
            std::process::exit(1);
        }
    };
    let mismatches = c
        .data()
        .iter()
        .zip(expected.data())
        .filter(|(got, want)| got != want)
        .count();

    if args.json_output {
        match report.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("{}: Failed to serialize to JSON: {}", "Error".red(), e);
                std::process::exit(1);
            }
        }
    } else {
        print_report(&report, args.verbose);
    }

    if mismatches > 0 {
        eprintln!(
            "{}: {} of {} elements differ from the reference product",
            "Mismatch".red().bold(),
            mismatches,
            expected.data().len()
        );
        std::process::exit(1);
    }
    if !args.json_output {
        println!("{}", "Result matches the reference product".green());
    }
}

fn print_report(report: &PassReport, verbose: bool) {
    println!("{}", "Pass Results".bold().green());
    println!("{}", "=".repeat(50));
    println!();

    println!("{}: {}", "Engine".cyan(), report.config);
    println!("{}: {}", "Mode".cyan(), report.mode);
    println!("{}: {:?}", "Output shape".cyan(), report.output_shape);
    println!(
        "{}: {} ({} K blocks each)",
        "Tiles".cyan(),
        report.tiles_written,
        report.k_blocks
    );
    println!("{}: {} cycles", "Array steps".cyan(), report.array.steps);
    println!();

    if verbose {
        println!("{}", "Traffic".bold().yellow());
        println!("{}", "-".repeat(50));
        println!("  {}: {}", "Words read".cyan(), report.words_read);
        println!("  {}: {}", "Words written".cyan(), report.words_written);
        println!("  {}: {}", "Block products".cyan(), report.array.blocks);
        println!("  {}: {}", "Multiplies".cyan(), report.array.multiplies);
        println!();
    }
}
