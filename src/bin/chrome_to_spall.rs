//! Convert a Chrome Performance trace for viewing in Spall.
//!
//! Reads a trace exported from Chrome's Performance panel (one event per
//! line) and writes the same trace to stdout, with the sampled CPU profile
//! replaced by explicit begin/end events for every function call.
//!
//! # Usage
//!
//! ```bash
//! chrome_to_spall Trace.json > trace.spall.json
//! cat Trace.json | chrome_to_spall > trace.spall.json
//! RUST_LOG=info chrome_to_spall Trace.json > trace.spall.json
//! ```

use chrome_to_spall::convert::Converter;
use clap::Parser;
use env_logger::Env;
use log::info;
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "chrome_to_spall")]
#[command(about = "Convert Chrome's performance profiles into Spall traces")]
#[command(version)]
struct Args {
    /// Input trace file (reads stdin if omitted)
    input: Option<PathBuf>,
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let stdout = io::stdout();
    let writer = BufWriter::new(stdout.lock());
    let mut converter = Converter::new();

    let stats = match &args.input {
        Some(path) => {
            let input_file = File::open(path).map_err(|e| {
                format!("Failed to open input file '{}': {}", path.display(), e)
            })?;
            converter.convert(BufReader::new(input_file), writer)?
        }
        None => converter.convert(io::stdin().lock(), writer)?,
    };

    info!(
        "Converted {} lines: {} profiles, {} chunks, {} samples, {} begin / {} end events, {} passed through",
        stats.lines,
        stats.profiles_started,
        stats.chunks,
        stats.samples,
        stats.begin_events,
        stats.end_events,
        stats.passed_through
    );
    if stats.decode_errors > 0 || stats.unknown_profile_chunks > 0 {
        info!(
            "Skipped {} undecodable records and {} chunks without a Profile event",
            stats.decode_errors, stats.unknown_profile_chunks
        );
    }

    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
