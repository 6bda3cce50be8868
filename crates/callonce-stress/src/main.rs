use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use humantime::parse_duration;

mod logging;
mod stresstest;
mod workloads;

use stresstest::{describe, perform_stresstest};
use workloads::WorkloadsConfig;

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = parse_duration)]
    duration: Duration,

    /// Enable logging of every cache event, written to stdout.
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    logging::init(logging::Config {
        backtraces: true,
        tracing: true,
        verbose: cli.verbose,
    });

    for (i, workload) in workloads.workloads.iter().enumerate() {
        println!("Workload {i}: {}", describe(workload));
    }
    println!();

    perform_stresstest(workloads, cli.duration, cli.verbose).await
}
