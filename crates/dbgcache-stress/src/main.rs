use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use dbgcache::config::Config;
use dbgcache::logging::ensure_log_error;
use logging::init;
use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

mod logging;
mod stresstest;
mod workloads;

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Write logs to the console instead of discarding them.
    #[arg(long)]
    verbose: bool,

    /// Report metrics to a local sink.
    #[arg(long)]
    metrics: bool,
}

fn main() {
    let cli = Cli::parse();
    if let Err(error) = execute(cli) {
        ensure_log_error(&error);
        std::process::exit(1);
    }
}

fn execute(cli: Cli) -> Result<()> {
    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let config = Config::get(cli.config.as_deref())?;

    let _guard = init(
        &config,
        logging::Config {
            verbose: cli.verbose,
            metrics: cli.metrics,
        },
    )?;

    perform_stresstest(&config, workloads, cli.duration)
}
