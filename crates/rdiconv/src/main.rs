//! Converts native debug info into RDI containers for the debug info cache.

#![warn(missing_docs, missing_debug_implementations, clippy::all)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::Parser;
use console::style;
use dbgcache::debug_info::rdi;

macro_rules! log {
    ($cli:expr, $($arg:tt)*) => {
        if !$cli.quiet {
            println!($($arg)*);
        }
    };
}

/// Converts native debug info into an RDI container.
#[derive(Parser, Debug)]
#[command(version)]
struct Cli {
    /// Path of the RDI container to write.
    #[arg(long = "out", short = 'o', value_name = "PATH")]
    out: PathBuf,

    /// The number of threads the conversion may use.
    #[arg(long = "threads", short = 't', default_value_t = 1)]
    threads: usize,

    /// Compress the payload with zstd.
    #[arg(long = "compress", short = 'z')]
    compress: bool,

    /// If enabled output will be suppressed.
    #[arg(long = "quiet", short = 'q')]
    quiet: bool,

    /// Path to the native debug info.
    #[arg(index = 1, value_name = "INPUT")]
    input: PathBuf,
}

fn convert(input: &Path, output: &Path, compress: bool) -> Result<u64> {
    let payload = fs::read(input).with_context(|| format!("failed to read {}", input.display()))?;
    if rdi::is_rdi(&payload) {
        bail!("{} already is an RDI container", input.display());
    }

    // write next to the target, so that readers never observe a partial container
    let parent = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create a temporary file in {}", parent.display()))?;
    rdi::write_container(&mut file, &payload, compress).context("failed to write RDI container")?;
    file.flush()?;
    let file = file
        .persist(output)
        .with_context(|| format!("failed to move RDI container to {}", output.display()))?;

    Ok(file.metadata()?.len())
}

fn execute() -> Result<()> {
    let cli = Cli::parse();
    let start = Instant::now();

    log!(
        cli,
        "{} {} ({} threads)",
        style("Converting").bold(),
        style(cli.input.display()).dim(),
        cli.threads.max(1),
    );
    let size = convert(&cli.input, &cli.out, cli.compress)?;
    log!(
        cli,
        "{} {} ({size} bytes in {:.2?})",
        style("Wrote").bold(),
        style(cli.out.display()).cyan(),
        start.elapsed(),
    );

    Ok(())
}

fn main() {
    match execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            eprintln!("{}: {}", style("error").red().bold(), error);
            for cause in error.chain().skip(1) {
                eprintln!("{}", style(format!("  caused by {cause}")).dim());
            }
            std::process::exit(1);
        }
    }
}
