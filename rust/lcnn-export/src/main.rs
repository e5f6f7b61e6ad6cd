//! LCNN archive exporter
//!
//! This binary converts a PyTorch checkpoint into an LCNN tensor archive.
//!
//! # Usage
//!
//! ```bash
//! # Export to ./model_weights.bin
//! lcnn-export checkpoint.pt
//!
//! # Export to a chosen path and read the result back
//! lcnn-export checkpoint.pt weights/resnet.bin --verify
//!
//! # Checkpoint of a torch.compile'd model
//! lcnn-export checkpoint.pt --strip-prefix _orig_mod.
//! ```

mod export;

use std::error::Error as _;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lcnn_core::ExportConfig;

/// Export a PyTorch checkpoint to an LCNN archive
#[derive(Parser, Debug)]
#[command(name = "lcnn-export")]
#[command(about = "Convert a PyTorch checkpoint into an LCNN tensor archive")]
struct Args {
    /// Checkpoint written by torch.save
    checkpoint: PathBuf,

    /// Archive to write (defaults to output.path from the config, ./model_weights.bin)
    output: Option<PathBuf>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Prefix to strip from parameter names (repeatable)
    #[arg(long = "strip-prefix", value_name = "PREFIX")]
    strip_prefixes: Vec<String>,

    /// Read the archive back and compare it with the checkpoint
    #[arg(long)]
    verify: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(&args) {
        Ok(report) => {
            println!(
                "Exported {} parameters to {}",
                report.summary.stats.records,
                report.summary.path.display()
            );
            println!(
                "File size: {} bytes ({:.2} MB)",
                report.summary.file_size,
                report.summary.file_size as f64 / (1024.0 * 1024.0)
            );
            println!("Checksum (xxh64): {:016x}", report.summary.stats.checksum);
            if report.verified {
                println!("Verified: archive matches checkpoint");
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: {err}");
            let mut source = err.source();
            while let Some(cause) = source {
                eprintln!("  caused by: {cause}");
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> lcnn_core::Result<export::ExportReport> {
    let mut config = match &args.config {
        Some(path) => ExportConfig::from_file(path)?,
        None => ExportConfig::default(),
    }
    .with_env_overrides();

    config
        .adapter
        .strip_prefixes
        .extend(args.strip_prefixes.iter().cloned());
    if let Some(output) = &args.output {
        config.output.path = output.clone();
    }
    config.validate()?;

    tracing::info!(
        checkpoint = %args.checkpoint.display(),
        output = %config.output.path.display(),
        "exporting checkpoint"
    );

    let checkpoint = lcnn_core::load_checkpoint(&args.checkpoint)?;
    export::export(&checkpoint, &config, args.verify)
}
